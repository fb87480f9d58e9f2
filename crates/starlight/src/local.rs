//! Runs the command-line compiler once per config, strictly in sequence.
//!
//! Invocations never overlap: a later config may include files an earlier one
//! generated. Each run is bounded by [`LOCAL_TIMEOUT`] and races the job's
//! cancellation token; the child is spawned with `kill_on_drop`, so losing
//! either race terminates it.
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::context::JobContext;
use crate::diagnostics::{error_count, Diagnostic, DiagnosticParser};
use crate::discover::{subdirectories, JobInput};
use crate::error::JobError;
use crate::path::PathResolver;

pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Clone)]
pub struct LocalCompiler {
    binary: PathBuf,
    timeout: Duration,
}

/// What a local job produced across all of its invocations.
#[derive(Debug, Clone, Default)]
pub struct LocalRun {
    pub diagnostics: Vec<Diagnostic>,
    pub invocations: usize,
}

impl LocalRun {
    pub fn error_count(&self) -> usize {
        error_count(&self.diagnostics)
    }
}

impl LocalCompiler {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: LOCAL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub async fn run(
        &self,
        input: &JobInput,
        resolver: &PathResolver,
        ctx: &JobContext<'_>,
    ) -> Result<LocalRun, JobError> {
        let mut run = LocalRun::default();
        self.run_into(input, resolver, ctx, &mut run).await?;
        Ok(run)
    }

    /// Like [`run`](Self::run), but accumulates into `run` so whatever earlier
    /// invocations reported survives a later timeout or spawn failure.
    pub async fn run_into(
        &self,
        input: &JobInput,
        resolver: &PathResolver,
        ctx: &JobContext<'_>,
        run: &mut LocalRun,
    ) -> Result<(), JobError> {
        let root = input.root().to_path_buf();
        let configs = input.config_files()?;
        if configs.is_empty() {
            return Err(JobError::InvalidInput(root));
        }
        let search_paths = {
            let root = root.clone();
            ctx.guard(async move { tokio::task::spawn_blocking(move || subdirectories(&root)).await? })
                .await?
        };

        let share = 100.0 / configs.len() as f64;
        for config in &configs {
            ctx.checkpoint()?;
            let relative = config.strip_prefix(&root).unwrap_or(config);
            let output = self.invoke(&root, relative, &search_paths, ctx).await?;
            run.invocations += 1;

            forward_lines(ctx, &output.stdout);
            forward_lines(ctx, &output.stderr);
            if !output.status.success() {
                warn!(
                    config = %relative.display(),
                    status = %output.status,
                    "compiler exited unsuccessfully"
                );
            }

            let stderr = String::from_utf8_lossy(&output.stderr);
            let parsed = DiagnosticParser::new(resolver, &root, config).parse(&stderr);
            debug!(
                config = %relative.display(),
                diagnostics = parsed.len(),
                errors = error_count(&parsed),
                "parsed compiler output"
            );
            run.diagnostics.extend(parsed);
            ctx.progress(share, Some(&format!("compiled {}", relative.display())));
        }

        info!(
            invocations = run.invocations,
            errors = run.error_count(),
            "local generation finished"
        );
        Ok(())
    }

    async fn invoke(
        &self,
        root: &Path,
        config: &Path,
        search_paths: &[PathBuf],
        ctx: &JobContext<'_>,
    ) -> Result<Output, JobError> {
        let mut command = Command::new(&self.binary);
        command
            .args(compiler_arguments(config, search_paths))
            .current_dir(root)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        ctx.log(&format!(
            "running {} for {}",
            self.binary.display(),
            config.display()
        ));
        let timeout = self.timeout;
        ctx.guard(async {
            match tokio::time::timeout(timeout, command.output()).await {
                Ok(result) => result.map_err(|source| JobError::Spawn {
                    binary: self.binary.clone(),
                    source,
                }),
                Err(_) => {
                    warn!(config = %config.display(), "compiler timed out; killing it");
                    Err(JobError::Timeout {
                        config: config.to_path_buf(),
                        after: timeout,
                    })
                }
            }
        })
        .await
    }
}

/// `--batch-template <config> --output-to-json-file-path [--search-path <dir>]...`
pub fn compiler_arguments(config: &Path, search_paths: &[PathBuf]) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--batch-template".into(),
        config.as_os_str().to_owned(),
        "--output-to-json-file-path".into(),
    ];
    for dir in search_paths {
        args.push("--search-path".into());
        args.push(dir.as_os_str().to_owned());
    }
    args
}

fn forward_lines(ctx: &JobContext<'_>, bytes: &[u8]) {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .for_each(|line| ctx.log(line));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_argument_list_with_search_paths() {
        let args = compiler_arguments(
            Path::new("a.sl.json"),
            &[PathBuf::from("inc"), PathBuf::from("inc/common")],
        );
        let args: Vec<_> = args.iter().map(|arg| arg.to_string_lossy()).collect();
        assert_eq!(
            args,
            vec![
                "--batch-template",
                "a.sl.json",
                "--output-to-json-file-path",
                "--search-path",
                "inc",
                "--search-path",
                "inc/common",
            ]
        );
    }

    #[test]
    fn no_search_paths_without_subdirectories() {
        let args = compiler_arguments(Path::new("x.sl.json"), &[]);
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn defaults_to_ten_second_timeout() {
        let compiler = LocalCompiler::new("/usr/bin/starlight");
        assert_eq!(compiler.timeout, Duration::from_secs(10));
        assert_eq!(compiler.binary(), Path::new("/usr/bin/starlight"));
        let compiler = compiler.with_timeout(Duration::from_millis(50));
        assert_eq!(compiler.timeout, Duration::from_millis(50));
    }
}
