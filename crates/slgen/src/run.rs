use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::Mutex;

use anyhow::{Context, Result};
use starlight::{
    create_template, CancellationToken, Diagnostic, DiagnosticCollection, FormatPrompt, Generator,
    JobHooks, JobRequest, OutputLog, PathResolver, ProgressSink, Settings,
};
use tracing_subscriber::EnvFilter;

use crate::cli::{BackendArgs, GenerateArgs, NewArgs};
use crate::paths::AppPaths;

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

pub async fn generate(args: GenerateArgs) -> Result<()> {
    let settings = load_settings(&args.backend)?;
    let resolver = PathResolver::new()?;
    let mut generator = Generator::new(settings, resolver);

    let mut request = JobRequest::new(&args.path);
    if let Some(output_type) = args.output_type {
        request = request.with_output_language(output_type);
    }

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; canceling job");
                cancel.cancel();
            }
        })
    };

    let progress = ConsoleProgress::default();
    let hooks = JobHooks {
        progress: &progress,
        log: &ConsoleLog,
        prompt: &StdinPrompt,
    };
    let outcome = generator.generate(&request, hooks, cancel).await;
    interrupt.abort();

    print_diagnostics(generator.diagnostics());
    match outcome {
        Ok(report) => {
            tracing::info!(
                root = %report.root.display(),
                backend = ?report.backend,
                format = report.output_format.as_deref().unwrap_or("-"),
                files = report.extracted.len(),
                invocations = report.invocations,
                warnings = report.warnings,
                "generation finished"
            );
            for file in &report.extracted {
                println!("generated {}", file.display());
            }
            Ok(())
        }
        Err(err) if err.is_canceled() => {
            tracing::info!("generation canceled");
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("generation failed for {}", args.path.display())),
    }
}

pub fn new_template(args: NewArgs) -> Result<()> {
    let files = create_template(&args.dir, &args.name)
        .with_context(|| format!("failed to create template '{}'", args.name))?;
    println!("Created {}", files.config.display());
    println!("Created {}", files.vertex.display());
    println!("Created {}", files.fragment.display());
    Ok(())
}

pub fn describe(args: BackendArgs) -> Result<()> {
    let paths = AppPaths::discover()?;
    let settings = load_settings(&args)?;
    println!("Settings file: {}", paths.settings_file().display());
    if settings.uses_local_compiler() {
        println!("Backend:       local ({})", settings.binary_path);
    } else {
        println!("Backend:       remote");
    }
    println!("Service URL:   {}", settings.api_url);
    Ok(())
}

fn load_settings(overrides: &BackendArgs) -> Result<Settings> {
    let paths = AppPaths::discover()?;
    let path = paths.settings_file();
    let settings = Settings::load_or_default(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded settings");
    Ok(settings.with_overrides(overrides.binary_path.clone(), overrides.api_url.clone()))
}

fn print_diagnostics(collection: &DiagnosticCollection) {
    for (_, diagnostics) in collection.files() {
        for diagnostic in diagnostics {
            println!("{}", format_diagnostic(diagnostic));
        }
    }
}

/// `file:line:col: severity: message`, with related locations indented below.
pub fn format_diagnostic(diagnostic: &Diagnostic) -> String {
    let location = &diagnostic.location;
    let mut out = location.file.display().to_string();
    if let Some(line) = location.line {
        out.push_str(&format!(":{line}"));
        if let Some(column) = location.column {
            out.push_str(&format!(":{column}"));
        }
    }
    out.push_str(&format!(
        ": {}: {}",
        diagnostic.severity.as_str(),
        diagnostic.message
    ));
    for related in &diagnostic.related {
        out.push_str(&format!("\n    {}", related.file.display()));
        if let Some(line) = related.line {
            out.push_str(&format!(":{line}"));
        }
        out.push_str(&format!(": {}", related.message));
    }
    out
}

#[derive(Default)]
struct ConsoleProgress {
    total: Mutex<f64>,
}

impl ProgressSink for ConsoleProgress {
    fn report(&self, increment: f64, message: Option<&str>) {
        let Ok(mut total) = self.total.lock() else {
            return;
        };
        *total = (*total + increment).min(100.0);
        if let Some(message) = message {
            eprintln!("[{:>3.0}%] {message}", *total);
        }
    }
}

struct ConsoleLog;

impl OutputLog for ConsoleLog {
    fn log(&self, line: &str) {
        println!("{line}");
    }
}

/// Reads a choice from stdin; never prompts when stdin is not a terminal.
struct StdinPrompt;

impl FormatPrompt for StdinPrompt {
    fn choose(&self, choices: &[&str]) -> Option<String> {
        if !io::stdin().is_terminal() {
            return None;
        }
        eprint!("Output format [{}]: ", choices.join("/"));
        io::stderr().flush().ok()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer).ok()?;
        pick_choice(answer.trim(), choices)
    }
}

/// Accepts a 1-based index or a case-insensitive name.
fn pick_choice(answer: &str, choices: &[&str]) -> Option<String> {
    if answer.is_empty() {
        return None;
    }
    if let Ok(index) = answer.parse::<usize>() {
        return index
            .checked_sub(1)
            .and_then(|i| choices.get(i))
            .map(|choice| choice.to_string());
    }
    choices
        .iter()
        .find(|choice| choice.eq_ignore_ascii_case(answer))
        .map(|choice| choice.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use starlight::{RelatedLocation, Severity, SourceLocation};
    use std::path::PathBuf;

    #[test]
    fn formats_located_diagnostic_with_related() {
        let diagnostic = Diagnostic {
            severity: Severity::Error,
            location: SourceLocation {
                file: PathBuf::from("blur.vert"),
                line: Some(12),
                column: Some(4),
            },
            message: "undefined symbol".into(),
            related: vec![RelatedLocation {
                file: PathBuf::from("common.glsl"),
                line: Some(3),
                message: "declared here".into(),
            }],
        };
        assert_eq!(
            format_diagnostic(&diagnostic),
            "blur.vert:12:4: error: undefined symbol\n    common.glsl:3: declared here"
        );
    }

    #[test]
    fn formats_unlocated_warning() {
        let diagnostic = Diagnostic {
            severity: Severity::Warning,
            location: SourceLocation {
                file: PathBuf::from("x.sl.json"),
                line: None,
                column: None,
            },
            message: "missing newline".into(),
            related: Vec::new(),
        };
        assert_eq!(
            format_diagnostic(&diagnostic),
            "x.sl.json: warning: missing newline"
        );
    }

    #[test]
    fn picks_choice_by_index_or_name() {
        let choices = ["lua", "cpp", "ts"];
        assert_eq!(pick_choice("2", &choices).as_deref(), Some("cpp"));
        assert_eq!(pick_choice("TS", &choices).as_deref(), Some("ts"));
        assert_eq!(pick_choice("0", &choices), None);
        assert_eq!(pick_choice("rust", &choices), None);
        assert_eq!(pick_choice("", &choices), None);
    }

    #[test]
    fn progress_is_capped_at_completion() {
        let progress = ConsoleProgress::default();
        progress.report(70.0, None);
        progress.report(45.0, Some("done"));
        assert_eq!(*progress.total.lock().unwrap(), 100.0);
    }
}
