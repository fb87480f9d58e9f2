use std::fs;
use std::io::{Cursor, Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;

use starlight::{
    CancellationToken, Generator, JobError, JobHooks, JobRequest, NoPrompt, PathResolver,
    ProgressSink, Settings, TracingLog, LOG_FILE_NAME,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

/// What the fake service saw in the upload.
#[derive(Debug)]
struct Upload {
    output_type: String,
    entries: Vec<String>,
    config: String,
}

#[derive(Default)]
struct Recorded(Mutex<Vec<(f64, Option<String>)>>);

impl ProgressSink for Recorded {
    fn report(&self, increment: f64, message: Option<&str>) {
        self.0
            .lock()
            .unwrap()
            .push((increment, message.map(str::to_string)));
    }
}

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

fn project(root: &Path) {
    write(
        root,
        "x.sl.json",
        r#"{"namespace": "StarLight", "outputFormat": "cpp", "data": [{"fileName": "x", "vsh": "x.vert", "fsh": "x.frag"}]}"#,
    );
    write(root, "x.vert", "void main() {}\n");
    write(root, "x.frag", "void main() {}\n");
}

fn result_zip(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in files {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

async fn read_request(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut buf = [0u8; 8192];
    let header_end = loop {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before headers");
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = find(&raw, b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let headers = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let lowered = headers.to_ascii_lowercase();
    let mut body = raw[header_end..].to_vec();

    if let Some(length) = lowered
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
    {
        while body.len() < length {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed mid-body");
            body.extend_from_slice(&buf[..n]);
        }
        body.truncate(length);
    } else {
        while find(&body, b"\r\n0\r\n\r\n").is_none() {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed mid-body");
            body.extend_from_slice(&buf[..n]);
        }
        body = dechunk(&body);
    }
    (headers, body)
}

fn dechunk(mut raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let line_end = find(raw, b"\r\n").unwrap();
        let size_text = String::from_utf8_lossy(&raw[..line_end]).to_string();
        let size = usize::from_str_radix(size_text.trim(), 16).unwrap();
        if size == 0 {
            return out;
        }
        let start = line_end + 2;
        out.extend_from_slice(&raw[start..start + size]);
        raw = &raw[start + size + 2..];
    }
}

fn parse_upload(headers: &str, body: &[u8]) -> Upload {
    let boundary = headers
        .lines()
        .find_map(|line| line.split("boundary=").nth(1))
        .unwrap()
        .trim()
        .trim_matches('"')
        .to_string();
    let delimiter = format!("--{boundary}");

    let mut output_type = None;
    let mut archive = None;
    let mut rest = body;
    while let Some(start) = find(rest, delimiter.as_bytes()) {
        rest = &rest[start + delimiter.len()..];
        if rest.starts_with(b"--") {
            break;
        }
        let part_end = find(rest, delimiter.as_bytes()).unwrap_or(rest.len());
        let part = &rest[..part_end];
        let head_end = find(part, b"\r\n\r\n").unwrap();
        let head = String::from_utf8_lossy(&part[..head_end]).to_string();
        let mut content = &part[head_end + 4..];
        if content.ends_with(b"\r\n") {
            content = &content[..content.len() - 2];
        }
        if head.contains("name=\"type\"") {
            output_type = Some(String::from_utf8_lossy(content).to_string());
        } else if head.contains("name=\"zipfile\"") {
            assert!(head.contains("filename=\"starlight_input.zip\""));
            archive = Some(content.to_vec());
        }
    }

    let mut zip = ZipArchive::new(Cursor::new(archive.expect("zipfile part"))).unwrap();
    let mut entries: Vec<String> = zip.file_names().map(str::to_string).collect();
    entries.sort();
    let config_name = entries
        .iter()
        .find(|name| name.ends_with(".sl.json"))
        .cloned()
        .unwrap();
    let mut config = String::new();
    zip.by_name(&config_name)
        .unwrap()
        .read_to_string(&mut config)
        .unwrap();

    Upload {
        output_type: output_type.expect("type part"),
        entries,
        config,
    }
}

/// Serves exactly one request, answering with `response` as a zip body.
async fn serve_once(response: Vec<u8>) -> (SocketAddr, JoinHandle<Upload>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (headers, body) = read_request(&mut stream).await;
        let upload = parse_upload(&headers, &body);
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/zip\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            response.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(&response).await.unwrap();
        stream.shutdown().await.unwrap();
        upload
    });
    (addr, handle)
}

fn remote_generator(addr: SocketAddr, cwd: &Path) -> Generator {
    let settings = Settings::default().with_overrides(None, Some(format!("http://{addr}/generate")));
    Generator::new(settings, PathResolver::with_cwd(cwd))
}

#[tokio::test]
async fn remote_job_uploads_and_extracts() {
    let root = tempfile::tempdir().unwrap();
    project(root.path());
    let response = result_zip(&[
        ("x.h", "// generated\n"),
        ("x.cpp", "#include \"x.h\"\n"),
        (
            LOG_FILE_NAME,
            "boot\n---- output begin ----\n[INFO] compiling x\n[WARNING] x.frag:1: default precision\n---- output end ----\n",
        ),
    ]);
    let (addr, server) = serve_once(response).await;

    let progress = Recorded::default();
    let hooks = JobHooks {
        progress: &progress,
        log: &TracingLog,
        prompt: &NoPrompt,
    };
    let mut generator = remote_generator(addr, root.path());
    let report = generator
        .generate(&JobRequest::new(root.path()), hooks, CancellationToken::new())
        .await
        .unwrap();
    let upload = server.await.unwrap();

    assert_eq!(upload.output_type, "cpp");
    assert_eq!(upload.entries, vec!["x.frag", "x.sl.json", "x.vert"]);
    assert_eq!(report.output_format.as_deref(), Some("cpp"));
    assert_eq!(report.warnings, 1);

    assert!(root.path().join("x.h").is_file());
    assert!(root.path().join("x.cpp").is_file());
    assert!(!root.path().join(LOG_FILE_NAME).exists());
    assert_eq!(
        generator.diagnostics().get(&root.path().join("x.frag")).len(),
        1
    );

    let seen = progress.0.lock().unwrap();
    let total: f64 = seen.iter().map(|(increment, _)| increment).sum();
    assert!((total - 100.0).abs() < 1e-6, "progress summed to {total}");
    assert!(seen.iter().all(|(increment, _)| *increment >= 0.0));
    assert!(seen
        .iter()
        .any(|(_, message)| message.as_deref() == Some("receiving result from server...")));
}

#[tokio::test]
async fn single_shader_uploads_canonical_config() {
    let root = tempfile::tempdir().unwrap();
    project(root.path());
    write(root.path(), "other.sl.json", r#"{"data": [{"vsh": "o.vert", "fsh": "o.frag"}]}"#);
    let (addr, server) = serve_once(result_zip(&[("x.lua", "return {}\n")])).await;

    let hooks = JobHooks {
        progress: &starlight::NoProgress,
        log: &TracingLog,
        prompt: &NoPrompt,
    };
    let mut generator = remote_generator(addr, root.path());
    let request = JobRequest::new(root.path().join("x.vert")).with_output_language("lua");
    generator
        .generate(&request, hooks, CancellationToken::new())
        .await
        .unwrap();
    let upload = server.await.unwrap();

    assert_eq!(upload.output_type, "lua");
    assert_eq!(upload.entries, vec!["index.sl.json", "x.frag", "x.vert"]);
    assert!(upload.config.contains("\"vsh\": \"x.vert\""));
    assert!(!upload.config.contains("o.vert"));
    assert!(root.path().join("x.lua").is_file());
}

#[tokio::test]
async fn logged_error_fails_but_keeps_partial_output() {
    let root = tempfile::tempdir().unwrap();
    project(root.path());
    let response = result_zip(&[
        ("x.h", "// partial\n"),
        (LOG_FILE_NAME, "[ERROR] x.vert:4:9: 'color' : undeclared identifier\n"),
    ]);
    let (addr, server) = serve_once(response).await;

    let hooks = JobHooks {
        progress: &starlight::NoProgress,
        log: &TracingLog,
        prompt: &NoPrompt,
    };
    let mut generator = remote_generator(addr, root.path());
    let err = generator
        .generate(&JobRequest::new(root.path()), hooks, CancellationToken::new())
        .await
        .unwrap_err();
    server.await.unwrap();

    assert!(matches!(err, JobError::GenerationFailed(_)));
    assert!(err.to_string().starts_with("Error occurred during generation"));
    assert!(root.path().join("x.h").is_file());
    assert!(!root.path().join(LOG_FILE_NAME).exists());

    let located = generator.diagnostics().get(&root.path().join("x.vert"));
    assert_eq!(located.len(), 1);
    assert_eq!(located[0].location.line, Some(4));
    assert_eq!(located[0].column_range(), Some(8..10));
}

#[tokio::test]
async fn cancellation_before_response_is_quiet() {
    let root = tempfile::tempdir().unwrap();
    project(root.path());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // Accepts and reads but never answers.
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut stream).await;
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
    });

    let cancel = CancellationToken::new();
    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            cancel.cancel();
        })
    };

    let hooks = JobHooks {
        progress: &starlight::NoProgress,
        log: &TracingLog,
        prompt: &NoPrompt,
    };
    let mut generator = remote_generator(addr, root.path());
    let err = generator
        .generate(&JobRequest::new(root.path()), hooks, cancel)
        .await
        .unwrap_err();
    trigger.await.unwrap();
    server.abort();

    assert!(err.is_canceled());
    assert!(generator.diagnostics().is_empty());
}
