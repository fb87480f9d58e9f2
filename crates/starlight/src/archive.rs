//! Assembles the zip bundle submitted to the remote service.
//!
//! Building happens in two steps. [`plan_archive`] decides which named byte
//! streams go into the bundle, reading and rewriting configs in memory; the
//! plan is then written once by [`write_archive`] and never touched again.
//! [`build_archive`] runs both on blocking threads under the job's
//! cancellation token and only returns after the zip stream is finished and its
//! file closed.
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::{base_name, references_parent, ConfigFile};
use crate::context::JobContext;
use crate::discover::{discover_files, discover_shaders, JobInput, ShaderTarget};
use crate::error::JobError;

/// Name of the synthesized config when a single shader is submitted.
pub const CANONICAL_CONFIG_NAME: &str = "index.sl.json";
pub const ARCHIVE_FILE_NAME: &str = "starlight_input.zip";

const ARCHIVE_PROGRESS_SHARE: f64 = 35.0;

#[derive(Debug, Clone, PartialEq)]
pub enum EntrySource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    pub name: String,
    pub source: EntrySource,
}

#[derive(Debug, Default, Clone)]
pub struct ArchivePlan {
    entries: Vec<ArchiveEntry>,
    names: HashSet<String>,
}

impl ArchivePlan {
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, name: impl Into<String>, source: EntrySource) {
        let name = name.into();
        if !self.names.insert(name.clone()) {
            warn!(%name, "skipping duplicate archive entry");
            return;
        }
        self.entries.push(ArchiveEntry { name, source });
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub entries: Vec<String>,
    pub bytes: u64,
}

pub fn plan_archive(input: &JobInput) -> Result<ArchivePlan, JobError> {
    match input {
        JobInput::Shader(target) => plan_single_shader(target),
        JobInput::Config { root, config } => plan_single_config(root, config),
        JobInput::Directory { root } => plan_directory(root),
    }
}

fn plan_single_shader(target: &ShaderTarget) -> Result<ArchivePlan, JobError> {
    let shader_name = file_name_of(&target.shader)?;
    let companion_name = file_name_of(&target.companion)?;

    let mut entry = target.entry.clone();
    for path in [&mut entry.vertex, &mut entry.fragment] {
        if let Some(name) = base_name(path) {
            *path = name.to_string();
        }
    }
    let config = target.config.narrowed_to(entry);

    let mut plan = ArchivePlan::default();
    plan.push(
        CANONICAL_CONFIG_NAME,
        EntrySource::Bytes(config.to_json_pretty()?.into_bytes()),
    );
    plan.push(shader_name, EntrySource::File(target.shader.clone()));
    plan.push(companion_name, EntrySource::File(target.companion.clone()));
    Ok(plan)
}

fn plan_single_config(root: &Path, config_path: &Path) -> Result<ArchivePlan, JobError> {
    let mut config = ConfigFile::load(config_path)?;
    let config_name = file_name_of(config_path)?;
    let mut plan = ArchivePlan::default();
    let mut rewritten = false;

    for entry in &mut config.data {
        for path in [&mut entry.vertex, &mut entry.fragment] {
            if !references_parent(path) {
                continue;
            }
            let resolved = root.join(path.as_str());
            let flattened = base_name(path)
                .ok_or_else(|| JobError::invalid_config(config_path, format!("bad path '{path}'")))?
                .to_string();
            let bytes = fs::read(&resolved)?;
            debug!(from = %path, to = %flattened, "flattening out-of-root shader reference");
            plan.push(flattened.clone(), EntrySource::Bytes(bytes));
            *path = flattened;
            rewritten = true;
        }
    }

    if rewritten {
        plan.push(
            config_name,
            EntrySource::Bytes(config.to_json_pretty()?.into_bytes()),
        );
    } else {
        plan.push(config_name, EntrySource::File(config_path.to_path_buf()));
    }

    for rel in discover_shaders(root)? {
        plan.push(archive_name(&rel), EntrySource::File(root.join(&rel)));
    }
    Ok(plan)
}

fn plan_directory(root: &Path) -> Result<ArchivePlan, JobError> {
    let mut plan = ArchivePlan::default();
    for rel in discover_files(root)? {
        plan.push(archive_name(&rel), EntrySource::File(root.join(&rel)));
    }
    Ok(plan)
}

/// Writes `plan` to `destination`, stopping between entries once `cancel`
/// fires. `on_progress` receives `(written, total)` byte counts.
pub fn write_archive<F>(
    plan: &ArchivePlan,
    destination: &Path,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<ArchiveSummary, JobError>
where
    F: FnMut(u64, u64),
{
    let total = plan
        .entries()
        .iter()
        .map(|entry| match &entry.source {
            EntrySource::Bytes(bytes) => bytes.len() as u64,
            EntrySource::File(path) => fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        })
        .sum::<u64>();

    let file = File::create(destination)?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut written = 0u64;

    for entry in plan.entries() {
        if cancel.is_cancelled() {
            drop(writer);
            let _ = fs::remove_file(destination);
            return Err(JobError::Canceled);
        }
        let bytes = match &entry.source {
            EntrySource::Bytes(bytes) => bytes.clone(),
            EntrySource::File(path) => fs::read(path)?,
        };
        writer.start_file(entry.name.as_str(), options)?;
        writer.write_all(&bytes)?;
        written += bytes.len() as u64;
        on_progress(written, total);
    }

    let file = writer.finish()?;
    file.sync_all()?;
    drop(file);

    Ok(ArchiveSummary {
        path: destination.to_path_buf(),
        entries: plan.names().map(str::to_string).collect(),
        bytes: written,
    })
}

pub async fn build_archive(
    input: &JobInput,
    work_dir: &Path,
    ctx: &JobContext<'_>,
) -> Result<ArchiveSummary, JobError> {
    ctx.progress(0.0, Some("creating zip archive..."));

    let planning = {
        let input = input.clone();
        tokio::task::spawn_blocking(move || plan_archive(&input))
    };
    let plan = ctx.guard(async { planning.await? }).await?;
    if plan.is_empty() {
        return Err(JobError::InvalidInput(input.root().to_path_buf()));
    }

    let destination = work_dir.join(ARCHIVE_FILE_NAME);
    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
    let writing = {
        let destination = destination.clone();
        let token = ctx.token().clone();
        tokio::task::spawn_blocking(move || {
            write_archive(&plan, &destination, &token, |done, total| {
                let _ = progress_tx.send((done, total));
            })
        })
    };

    let summary = ctx
        .guard(async {
            while let Some((done, total)) = progress_rx.recv().await {
                ctx.progress(0.0, Some(&format!("creating zip archive... {done}B/{total}B")));
            }
            writing.await?
        })
        .await?;

    info!(
        path = %summary.path.display(),
        entries = summary.entries.len(),
        bytes = summary.bytes,
        "collected input archive"
    );
    ctx.progress(ARCHIVE_PROGRESS_SHARE, None);
    Ok(summary)
}

fn file_name_of(path: &Path) -> Result<String, JobError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| JobError::InvalidInput(path.to_path_buf()))
}

fn archive_name(rel: &Path) -> String {
    rel.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
