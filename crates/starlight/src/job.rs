//! One generation job from input path to published diagnostics.
//!
//! Stages run strictly one after another: backend selection (synchronous, before
//! any suspension), input resolution, backend execution, then diagnostics
//! publication. The previous job's diagnostics are cleared when a new job starts
//! and replaced wholesale once the new ones are parsed, including when a local
//! invocation times out or fails to start after earlier ones reported.
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConfigFile;
use crate::context::{JobContext, OutputLog, ProgressSink};
use crate::diagnostics::{Diagnostic, DiagnosticCollection};
use crate::discover::{resolve_input, JobInput};
use crate::error::JobError;
use crate::local::{LocalCompiler, LocalRun};
use crate::path::PathResolver;
use crate::remote::RemoteService;
use crate::settings::Settings;

pub const OUTPUT_FORMATS: [&str; 3] = ["lua", "cpp", "ts"];
pub const FALLBACK_OUTPUT_FORMAT: &str = "lua";

/// Asks the user for an output language when nothing else decides it.
pub trait FormatPrompt: Sync {
    fn choose(&self, choices: &[&str]) -> Option<String>;
}

/// Never answers, so the fallback format applies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrompt;

impl FormatPrompt for NoPrompt {
    fn choose(&self, _choices: &[&str]) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub enum Backend {
    Local(LocalCompiler),
    Remote(RemoteService),
}

impl Backend {
    /// A non-empty binary path selects the local compiler; anything else goes
    /// to the remote service.
    pub fn select(settings: &Settings, resolver: &PathResolver) -> Result<Self, JobError> {
        if settings.uses_local_compiler() {
            let raw = settings.binary_path.trim();
            let binary = resolver
                .expand_path(raw)
                .map_err(|err| JobError::InvalidBinaryPath {
                    path: raw.to_string(),
                    reason: err.to_string(),
                })?;
            debug!(binary = %binary.display(), "using local compiler");
            Ok(Self::Local(LocalCompiler::new(binary)))
        } else {
            let service = RemoteService::new(&settings.api_url)?;
            debug!(url = %service.endpoint(), "using remote service");
            Ok(Self::Remote(service))
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Local(_) => BackendKind::Local,
            Self::Remote(_) => BackendKind::Remote,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub path: PathBuf,
    pub output_language: Option<String>,
}

impl JobRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            output_language: None,
        }
    }

    pub fn with_output_language(mut self, language: impl Into<String>) -> Self {
        self.output_language = Some(language.into());
        self
    }
}

/// Caller-side collaborators for one job.
#[derive(Clone, Copy)]
pub struct JobHooks<'a> {
    pub progress: &'a dyn ProgressSink,
    pub log: &'a dyn OutputLog,
    pub prompt: &'a dyn FormatPrompt,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub backend: BackendKind,
    pub root: PathBuf,
    pub output_format: Option<String>,
    pub extracted: Vec<PathBuf>,
    pub invocations: usize,
    pub warnings: usize,
}

pub struct Generator {
    settings: Settings,
    resolver: PathResolver,
    diagnostics: DiagnosticCollection,
    local_timeout: Option<Duration>,
}

impl Generator {
    pub fn new(settings: Settings, resolver: PathResolver) -> Self {
        Self {
            settings,
            resolver,
            diagnostics: DiagnosticCollection::new(),
            local_timeout: None,
        }
    }

    /// Overrides the per-invocation limit of the local compiler.
    pub fn with_local_timeout(mut self, timeout: Duration) -> Self {
        self.local_timeout = Some(timeout);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Diagnostics of the most recent job.
    pub fn diagnostics(&self) -> &DiagnosticCollection {
        &self.diagnostics
    }

    pub async fn generate(
        &mut self,
        request: &JobRequest,
        hooks: JobHooks<'_>,
        cancel: CancellationToken,
    ) -> Result<JobReport, JobError> {
        self.diagnostics.clear();
        let ctx = JobContext::new(cancel, hooks.progress, hooks.log);
        ctx.checkpoint()?;

        let backend = Backend::select(&self.settings, &self.resolver)?;
        let path = self.absolutize(&request.path)?;
        let input = ctx
            .guard(async move { tokio::task::spawn_blocking(move || resolve_input(&path)).await? })
            .await?;
        let root = input.root().to_path_buf();
        info!(root = %root.display(), backend = ?backend.kind(), "starting generation");

        match backend {
            Backend::Local(compiler) => {
                let compiler = match self.local_timeout {
                    Some(timeout) => compiler.with_timeout(timeout),
                    None => compiler,
                };
                let mut run = LocalRun::default();
                let outcome = compiler.run_into(&input, &self.resolver, &ctx, &mut run).await;
                if let Err(err) = outcome {
                    if !err.is_canceled() {
                        self.publish(run.diagnostics);
                    }
                    return Err(err);
                }
                let errors = run.error_count();
                let invocations = run.invocations;
                let warnings = self.publish(run.diagnostics);
                if errors > 0 {
                    return Err(JobError::CompilerErrors(errors));
                }
                Ok(JobReport {
                    backend: BackendKind::Local,
                    root,
                    output_format: None,
                    extracted: Vec::new(),
                    invocations,
                    warnings,
                })
            }
            Backend::Remote(service) => {
                let format = ctx
                    .guard(resolve_output_format(
                        request.output_language.as_deref(),
                        &input,
                        hooks.prompt,
                    ))
                    .await?;
                ctx.log(&format!("output format: {format}"));
                let run = service.run(&input, &format, &self.resolver, &ctx).await?;
                let warnings = self.publish(run.diagnostics);
                if let Some(log) = run.failed_log {
                    return Err(JobError::GenerationFailed(log));
                }
                Ok(JobReport {
                    backend: BackendKind::Remote,
                    root,
                    output_format: Some(format),
                    extracted: run.extracted,
                    invocations: 1,
                    warnings,
                })
            }
        }
    }

    fn absolutize(&self, path: &Path) -> Result<PathBuf, JobError> {
        self.resolver
            .absolutize(&path.to_string_lossy())
            .map_err(|err| {
                debug!(path = %path.display(), error = %err, "cannot expand input path");
                JobError::InvalidInput(path.to_path_buf())
            })
    }

    /// Replaces the collection and returns the warning count.
    fn publish(&mut self, diagnostics: Vec<Diagnostic>) -> usize {
        let warnings = diagnostics.iter().filter(|d| !d.is_error()).count();
        self.diagnostics.replace(diagnostics);
        warnings
    }
}

/// Caller hint, then the first config declaring a format, then the prompt,
/// then [`FALLBACK_OUTPUT_FORMAT`].
pub async fn resolve_output_format(
    hint: Option<&str>,
    input: &JobInput,
    prompt: &dyn FormatPrompt,
) -> Result<String, JobError> {
    if let Some(hint) = hint.map(str::trim).filter(|hint| !hint.is_empty()) {
        return Ok(hint.to_string());
    }

    let declared = {
        let input = input.clone();
        tokio::task::spawn_blocking(move || declared_output_format(&input)).await??
    };
    if let Some(format) = declared {
        debug!(%format, "output format declared by config");
        return Ok(format);
    }

    if let Some(choice) = prompt
        .choose(&OUTPUT_FORMATS)
        .map(|choice| choice.trim().to_string())
        .filter(|choice| !choice.is_empty())
    {
        return Ok(choice);
    }
    warn!(
        format = FALLBACK_OUTPUT_FORMAT,
        "no output format selected; using default"
    );
    Ok(FALLBACK_OUTPUT_FORMAT.to_string())
}

fn declared_output_format(input: &JobInput) -> Result<Option<String>, JobError> {
    if let JobInput::Shader(target) = input {
        return Ok(target.config.declared_output_format().map(str::to_string));
    }
    for path in input.config_files()? {
        match ConfigFile::load(&path) {
            Ok(config) => {
                if let Some(format) = config.declared_output_format() {
                    return Ok(Some(format.to_string()));
                }
            }
            Err(err) => debug!(path = %path.display(), error = %err, "skipping unreadable config"),
        }
    }
    Ok(None)
}
