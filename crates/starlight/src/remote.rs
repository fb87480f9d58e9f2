use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, Url};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::archive::{build_archive, ARCHIVE_FILE_NAME};
use crate::context::JobContext;
use crate::diagnostics::{error_count, Diagnostic, DiagnosticParser};
use crate::discover::JobInput;
use crate::error::JobError;
use crate::path::PathResolver;

pub const DEFAULT_API_URL: &str = "https://starlight.yyyyy.tech";
pub const RESULT_FILE_NAME: &str = "slOutput.zip";
pub const LOG_FILE_NAME: &str = ".starlight.log";

const BEGIN_MARKER: &str = "output begin";
const END_MARKER: &str = "output end";
const RECEIVE_PROGRESS_SHARE: f64 = 20.0;
const DOWNLOAD_PROGRESS_SHARE: f64 = 20.0;
const EXTRACT_PROGRESS_SHARE: f64 = 25.0;

#[derive(Debug, Clone)]
pub struct RemoteService {
    http: Client,
    endpoint: Url,
}

/// What a remote job left behind in the root.
#[derive(Debug, Clone, Default)]
pub struct RemoteRun {
    pub diagnostics: Vec<Diagnostic>,
    pub extracted: Vec<PathBuf>,
    /// Set when the service log reported an error; the log itself is already
    /// gone by then.
    pub failed_log: Option<PathBuf>,
}

impl RemoteService {
    pub fn new(api_url: &str) -> Result<Self, JobError> {
        let endpoint = parse_endpoint(api_url)?;
        let http = Client::builder().build()?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn run(
        &self,
        input: &JobInput,
        output_format: &str,
        resolver: &PathResolver,
        ctx: &JobContext<'_>,
    ) -> Result<RemoteRun, JobError> {
        let root = input.root().to_path_buf();
        let work_dir = tempfile::tempdir()?;
        let archive = build_archive(input, work_dir.path(), ctx).await?;

        ctx.log(&format!(
            "uploading {} ({} bytes) to {}",
            ARCHIVE_FILE_NAME, archive.bytes, self.endpoint
        ));
        let response = self.upload(&archive.path, output_format, ctx).await?;

        let result_path = work_dir.path().join(RESULT_FILE_NAME);
        let received = download(response, &result_path, ctx).await?;
        debug!(path = %result_path.display(), bytes = received, "stored service response");

        ctx.progress(0.0, Some("extracting result..."));
        // Awaited without a race: the extractor watches the token itself, so the
        // job only unwinds once no further entry can be written.
        let extracted = {
            let result_path = result_path.clone();
            let root = root.clone();
            let cancel = ctx.token().clone();
            tokio::task::spawn_blocking(move || extract_archive(&result_path, &root, &cancel))
                .await??
        };
        info!(root = %root.display(), files = extracted.len(), "extracted generated files");

        let primary = input.primary_config()?;
        let (diagnostics, failed) = collect_log(&root, resolver, &primary, ctx).await?;
        ctx.progress(EXTRACT_PROGRESS_SHARE, Some("starlight generate done"));

        Ok(RemoteRun {
            diagnostics,
            extracted,
            failed_log: failed.then(|| root.join(LOG_FILE_NAME)),
        })
    }

    async fn upload(
        &self,
        archive: &Path,
        output_format: &str,
        ctx: &JobContext<'_>,
    ) -> Result<Response, JobError> {
        let bytes = ctx.guard(async { Ok(tokio::fs::read(archive).await?) }).await?;
        let part = Part::bytes(bytes)
            .file_name(ARCHIVE_FILE_NAME)
            .mime_str("application/zip")?;
        let form = Form::new()
            .text("type", output_format.to_string())
            .part("zipfile", part);

        debug!(url = %self.endpoint, format = %output_format, "posting archive");
        ctx.guard(async {
            let response = self
                .http
                .post(self.endpoint.clone())
                .multipart(form)
                .send()
                .await?
                .error_for_status()?;
            Ok(response)
        })
        .await
    }
}

fn parse_endpoint(api_url: &str) -> Result<Url, JobError> {
    let trimmed = api_url.trim();
    let url = Url::parse(trimmed).map_err(|err| JobError::InvalidEndpoint {
        url: trimmed.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(JobError::InvalidEndpoint {
            url: trimmed.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// Streams the response body into `destination`. Returns the byte count.
async fn download(
    mut response: Response,
    destination: &Path,
    ctx: &JobContext<'_>,
) -> Result<u64, JobError> {
    let mut file = tokio::fs::File::create(destination).await?;
    let mut received = 0u64;
    let mut acknowledged = false;

    while let Some(chunk) = ctx.guard(async { Ok(response.chunk().await?) }).await? {
        if !acknowledged {
            ctx.progress(RECEIVE_PROGRESS_SHARE, Some("receiving result from server..."));
            acknowledged = true;
        }
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
    }
    if !acknowledged {
        ctx.progress(RECEIVE_PROGRESS_SHARE, Some("receiving result from server..."));
    }
    file.flush().await?;
    file.sync_all().await?;
    ctx.progress(DOWNLOAD_PROGRESS_SHARE, Some("result received"));
    Ok(received)
}

/// Unpacks `archive` over `root`, overwriting files with matching names.
///
/// `cancel` is checked before each entry. The service log is written last, so
/// a canceled extraction never leaves one behind.
pub fn extract_archive(
    archive: &Path,
    root: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>, JobError> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let mut order = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let is_log = zip.by_index(index)?.name().trim_start_matches("./") == LOG_FILE_NAME;
        order.push((is_log, index));
    }
    order.sort();

    let mut names = Vec::with_capacity(order.len());
    for (_, index) in order {
        if cancel.is_cancelled() {
            debug!(written = names.len(), "extraction canceled");
            return Err(JobError::Canceled);
        }
        let mut entry = zip.by_index(index)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!(name = %entry.name(), "skipping unsafe entry name in result");
            continue;
        };
        let target = root.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&target)?;
        io::copy(&mut entry, &mut file)?;
        names.push(target);
    }
    Ok(names)
}

/// Reads, parses, and removes the service log. The second value reports
/// whether the log recorded any error.
async fn collect_log(
    root: &Path,
    resolver: &PathResolver,
    primary: &Path,
    ctx: &JobContext<'_>,
) -> Result<(Vec<Diagnostic>, bool), JobError> {
    let log_path = root.join(LOG_FILE_NAME);
    let content = match tokio::fs::read(&log_path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %log_path.display(), "service returned no log");
            return Ok((Vec::new(), false));
        }
        Err(err) => return Err(err.into()),
    };
    if let Err(err) = fs::remove_file(&log_path) {
        warn!(path = %log_path.display(), error = %err, "failed to remove service log");
    }

    let block = extract_output_block(&content);
    block
        .lines()
        .filter(|line| !line.trim().is_empty())
        .for_each(|line| ctx.log(line));

    let diagnostics = DiagnosticParser::new(resolver, root, primary).parse(block);
    let failed = error_count(&diagnostics) > 0 || content.to_ascii_uppercase().contains("[ERROR]");
    Ok((diagnostics, failed))
}

/// Returns the text between the `output begin` and `output end` marker lines.
/// Without a begin marker the whole log counts; without an end marker the
/// block runs to the end.
pub fn extract_output_block(content: &str) -> &str {
    let mut start = None;
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        let next = offset + line.len();
        let lower = line.to_ascii_lowercase();
        match start {
            None if lower.contains(BEGIN_MARKER) => start = Some(next),
            Some(begin) if lower.contains(END_MARKER) => return &content[begin..offset],
            _ => {}
        }
        offset = next;
    }
    match start {
        Some(begin) => &content[begin..],
        None => content,
    }
}
