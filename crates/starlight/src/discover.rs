//! Finds the config and shader files a job works on and turns a user-picked
//! path into a [`JobInput`].
//!
//! Directory roots are scanned with case-insensitive globs for the config and
//! shader suffixes. A single shader file instead walks up its ancestors looking
//! for the config entry that names it; that entry's other stage becomes the
//! companion shader sent along with it.
use std::fs;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use tracing::{debug, warn};

use crate::config::{is_config_file, ConfigEntry, ConfigFile, CONFIG_SUFFIX};
use crate::error::JobError;

pub const SHADER_SUFFIXES: [&str; 3] = [".vert", ".frag", ".glsl"];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

pub fn is_shader_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SHADER_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

/// What one job operates on. Exactly one of the three shapes is authoritative.
#[derive(Debug, Clone)]
pub enum JobInput {
    Directory { root: PathBuf },
    Config { root: PathBuf, config: PathBuf },
    Shader(ShaderTarget),
}

/// A single shader file together with the config entry that owns it.
#[derive(Debug, Clone)]
pub struct ShaderTarget {
    pub root: PathBuf,
    pub shader: PathBuf,
    pub config_path: PathBuf,
    pub config: ConfigFile,
    pub entry: ConfigEntry,
    pub companion: PathBuf,
}

impl JobInput {
    pub fn root(&self) -> &Path {
        match self {
            Self::Directory { root } | Self::Config { root, .. } => root,
            Self::Shader(target) => &target.root,
        }
    }

    /// Config files the job compiles, as absolute paths in processing order.
    pub fn config_files(&self) -> Result<Vec<PathBuf>, JobError> {
        match self {
            Self::Directory { root } => Ok(discover_configs(root)?
                .into_iter()
                .map(|rel| root.join(rel))
                .collect()),
            Self::Config { config, .. } => Ok(vec![config.clone()]),
            Self::Shader(target) => Ok(vec![target.config_path.clone()]),
        }
    }

    /// Diagnostics that carry no usable location are attached to this file.
    pub fn primary_config(&self) -> Result<PathBuf, JobError> {
        self.config_files()?
            .into_iter()
            .next()
            .ok_or_else(|| JobError::InvalidInput(self.root().to_path_buf()))
    }
}

pub fn resolve_input(path: &Path) -> Result<JobInput, JobError> {
    let metadata = fs::metadata(path).map_err(|_| JobError::InvalidInput(path.to_path_buf()))?;
    if metadata.is_dir() {
        validate_root(path)?;
        return Ok(JobInput::Directory {
            root: path.to_path_buf(),
        });
    }
    if !metadata.is_file() {
        return Err(JobError::InvalidInput(path.to_path_buf()));
    }

    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| JobError::InvalidInput(path.to_path_buf()))?;
    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    if is_config_file(name) {
        validate_config_input(path, &parent)?;
        Ok(JobInput::Config {
            root: parent,
            config: path.to_path_buf(),
        })
    } else if is_shader_file(name) {
        let target =
            find_owning_config(path)?.ok_or_else(|| JobError::InvalidInput(path.to_path_buf()))?;
        if !target.companion.is_file() {
            warn!(companion = %target.companion.display(), "companion shader is missing");
            return Err(JobError::InvalidInput(target.companion));
        }
        Ok(JobInput::Shader(target))
    } else {
        validate_root(&parent)?;
        Ok(JobInput::Directory { root: parent })
    }
}

/// A root is usable only when it holds at least one config and one shader.
pub fn validate_root(root: &Path) -> Result<(), JobError> {
    let mut has_config = false;
    let mut has_shader = false;
    for rel in matching_files(root, &all_suffixes())? {
        let rel = rel?;
        let name = rel.to_string_lossy();
        has_config |= is_config_file(&name);
        has_shader |= is_shader_file(&name);
        if has_config && has_shader {
            debug!(root = %root.display(), "input folder validated");
            return Ok(());
        }
    }
    Err(JobError::InvalidInput(root.to_path_buf()))
}

fn validate_config_input(config_path: &Path, root: &Path) -> Result<(), JobError> {
    let config = ConfigFile::load(config_path)?;
    let references_existing = config
        .data
        .iter()
        .flat_map(|entry| entry.shader_paths())
        .any(|path| root.join(path).is_file());
    if references_existing {
        return Ok(());
    }
    validate_root(root)
}

/// Every config and shader file under `root`, relative to it and sorted.
pub fn discover_files(root: &Path) -> Result<Vec<PathBuf>, JobError> {
    collect_sorted(root, &all_suffixes())
}

pub fn discover_configs(root: &Path) -> Result<Vec<PathBuf>, JobError> {
    collect_sorted(root, &[CONFIG_SUFFIX])
}

pub fn discover_shaders(root: &Path) -> Result<Vec<PathBuf>, JobError> {
    collect_sorted(root, &SHADER_SUFFIXES)
}

/// Every directory below `root` (recursive, relative, sorted).
pub fn subdirectories(root: &Path) -> Result<Vec<PathBuf>, JobError> {
    let pattern = format!("{}/**/*", escaped_root(root)?);
    let mut dirs = Vec::new();
    for found in glob::glob_with(&pattern, MATCH_OPTIONS)
        .map_err(|_| JobError::InvalidInput(root.to_path_buf()))?
    {
        let path = found.map_err(glob::GlobError::into_error)?;
        if path.is_dir() {
            if let Ok(rel) = path.strip_prefix(root) {
                dirs.push(rel.to_path_buf());
            }
        }
    }
    dirs.sort();
    dirs.dedup();
    Ok(dirs)
}

/// Walks from the shader's directory towards the filesystem root and returns the
/// first config entry naming the shader. Within one directory configs are tried
/// in lexical order.
pub fn find_owning_config(shader: &Path) -> Result<Option<ShaderTarget>, JobError> {
    let file_name = shader
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| JobError::InvalidInput(shader.to_path_buf()))?;

    let mut current = shader.parent();
    while let Some(dir) = current {
        if dir.as_os_str().is_empty() {
            break;
        }
        for config_path in immediate_configs(dir) {
            let config = match ConfigFile::load(&config_path) {
                Ok(config) => config,
                Err(err) => {
                    debug!(path = %config_path.display(), error = %err, "skipping unreadable config");
                    continue;
                }
            };
            let found = config.data.iter().find_map(|entry| {
                entry
                    .match_file_name(file_name)
                    .map(|(_, sibling)| (entry.clone(), dir.join(sibling)))
            });
            if let Some((entry, companion)) = found {
                debug!(
                    shader = %shader.display(),
                    config = %config_path.display(),
                    companion = %companion.display(),
                    "found owning config"
                );
                return Ok(Some(ShaderTarget {
                    root: dir.to_path_buf(),
                    shader: shader.to_path_buf(),
                    config_path,
                    config,
                    entry,
                    companion,
                }));
            }
        }
        current = dir.parent();
    }
    Ok(None)
}

fn immediate_configs(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "cannot list directory");
            return Vec::new();
        }
    };
    let mut configs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(is_config_file)
        })
        .collect();
    configs.sort();
    configs
}

fn all_suffixes() -> Vec<&'static str> {
    let mut suffixes = vec![CONFIG_SUFFIX];
    suffixes.extend(SHADER_SUFFIXES);
    suffixes
}

fn collect_sorted(root: &Path, suffixes: &[&str]) -> Result<Vec<PathBuf>, JobError> {
    let mut files = matching_files(root, suffixes)?.collect::<Result<Vec<_>, _>>()?;
    files.sort();
    files.dedup();
    Ok(files)
}

/// Lazily yields files under `root` whose names end in one of `suffixes`,
/// relative to `root`.
fn matching_files<'a>(
    root: &'a Path,
    suffixes: &[&str],
) -> Result<impl Iterator<Item = Result<PathBuf, JobError>> + 'a, JobError> {
    let escaped = escaped_root(root)?;
    let mut scans = Vec::with_capacity(suffixes.len());
    for suffix in suffixes {
        let pattern = format!("{escaped}/**/*{}", Pattern::escape(suffix));
        let paths = glob::glob_with(&pattern, MATCH_OPTIONS)
            .map_err(|_| JobError::InvalidInput(root.to_path_buf()))?;
        scans.push(paths);
    }
    Ok(scans.into_iter().flatten().filter_map(move |found| {
        match found {
            Ok(path) if path.is_file() => path
                .strip_prefix(root)
                .ok()
                .map(|rel| Ok(rel.to_path_buf())),
            Ok(_) => None,
            Err(err) => Some(Err(JobError::Io(err.into_error()))),
        }
    }))
}

fn escaped_root(root: &Path) -> Result<String, JobError> {
    let text = root
        .to_str()
        .ok_or_else(|| JobError::InvalidInput(root.to_path_buf()))?;
    Ok(Pattern::escape(text.trim_end_matches(['/', '\\'])))
}
