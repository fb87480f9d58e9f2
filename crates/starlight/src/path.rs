//! Centralizes path expansion and existence checks so job inputs, the local
//! compiler path, and file references inside compiler output all resolve the
//! same way.
//!
//! Types:
//!
//! - `PathResolver` remembers the caller's working directory.
//!
//! Functions:
//!
//! - `PathResolver::expand_path` performs `$VAR` and `~` expansion.
//! - `PathResolver::absolutize` anchors an expanded path at the working
//!   directory.
//! - `PathResolver::locate` accepts a file reference only when it exists under
//!   the job root or the working directory; this gate is what separates a real
//!   `file:line:` prefix from a message that merely contains a colon.
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use directories_next::BaseDirs;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PathResolver {
    cwd: PathBuf,
}

impl PathResolver {
    pub fn new() -> Result<Self> {
        let cwd = env::current_dir().context("failed to resolve current working directory")?;
        Ok(Self { cwd })
    }

    pub fn with_cwd<P: Into<PathBuf>>(cwd: P) -> Self {
        Self { cwd: cwd.into() }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn expand_path(&self, input: &str) -> Result<PathBuf> {
        let expanded_env = expand_env_vars(input)?;
        let expanded = expand_home(&expanded_env)?;
        let path = PathBuf::from(expanded);
        debug!(original = %input, expanded = %path.display(), "expanded path");
        Ok(path)
    }

    pub fn absolutize(&self, input: &str) -> Result<PathBuf> {
        let expanded = self.expand_path(input)?;
        if expanded.as_os_str().is_empty() {
            anyhow::bail!("path must not be empty");
        }
        if expanded.is_absolute() {
            Ok(expanded)
        } else {
            Ok(self.cwd.join(expanded))
        }
    }

    pub fn locate(&self, reference: &str, root: &Path) -> Option<PathBuf> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return None;
        }
        let candidate = Path::new(trimmed);
        if candidate.is_absolute() {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        [root.join(candidate), self.cwd.join(candidate)]
            .into_iter()
            .find(|path| path.is_file())
    }
}

fn expand_home(input: &str) -> Result<String> {
    if !input.starts_with('~') {
        return Ok(input.to_string());
    }

    let base_dirs = BaseDirs::new()
        .ok_or_else(|| anyhow!("unable to determine home directory for '~' expansion"))?;
    let home_dir = base_dirs.home_dir();

    if input == "~" {
        return Ok(home_dir.to_string_lossy().into_owned());
    }

    if let Some(rest) = input.strip_prefix("~/") {
        return Ok(home_dir.join(rest).to_string_lossy().into_owned());
    }

    anyhow::bail!("user-specific home expansion ('{input}') is not supported")
}

fn expand_env_vars(input: &str) -> Result<String> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            output.push(ch);
            continue;
        }

        let name = match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    anyhow::bail!("missing closing '}}' in environment variable reference");
                }
                name
            }
            Some(&c) if is_env_name_char(c) => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_env_name_char(c) {
                        break;
                    }
                    name.push(c);
                    chars.next();
                }
                name
            }
            _ => {
                output.push('$');
                continue;
            }
        };

        if name.is_empty() {
            anyhow::bail!("environment variable name must not be empty");
        }
        let value =
            env::var(&name).map_err(|_| anyhow!("environment variable '{name}' is not set"))?;
        output.push_str(&value);
    }

    Ok(output)
}

fn is_env_name_char(ch: char) -> bool {
    ch == '_' || ch.is_ascii_alphanumeric()
}
