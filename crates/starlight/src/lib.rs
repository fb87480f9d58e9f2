mod archive;
mod config;
mod context;
mod diagnostics;
mod discover;
mod error;
mod job;
mod local;
mod path;
mod remote;
mod settings;
mod template;

pub use archive::{
    build_archive, plan_archive, write_archive, ArchiveEntry, ArchivePlan, ArchiveSummary,
    EntrySource, ARCHIVE_FILE_NAME, CANONICAL_CONFIG_NAME,
};
pub use config::{is_config_file, references_parent, ConfigEntry, ConfigFile, CONFIG_SUFFIX};
pub use context::{JobContext, NoProgress, OutputLog, ProgressSink, TracingLog};
pub use diagnostics::{
    error_count, group_by_file, Diagnostic, DiagnosticCollection, DiagnosticParser,
    RelatedLocation, Severity, SourceLocation,
};
pub use discover::{
    discover_configs, discover_files, discover_shaders, find_owning_config, is_shader_file,
    resolve_input, subdirectories, validate_root, JobInput, ShaderTarget, SHADER_SUFFIXES,
};
pub use error::JobError;
pub use job::{
    resolve_output_format, Backend, BackendKind, FormatPrompt, Generator, JobHooks, JobReport,
    JobRequest, NoPrompt, FALLBACK_OUTPUT_FORMAT, OUTPUT_FORMATS,
};
pub use local::{compiler_arguments, LocalCompiler, LocalRun, LOCAL_TIMEOUT};
pub use path::PathResolver;
pub use remote::{
    extract_archive, extract_output_block, RemoteRun, RemoteService, DEFAULT_API_URL,
    LOG_FILE_NAME, RESULT_FILE_NAME,
};
pub use settings::{Settings, SettingsError, SETTINGS_FILE_NAME};
pub use template::{create_template, to_big_camel, TemplateFiles};

pub use tokio_util::sync::CancellationToken;
