#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use starlight::{
    CancellationToken, Generator, JobContext, JobError, JobHooks, JobInput, JobRequest,
    LocalCompiler, NoPrompt, NoProgress, PathResolver, Settings, TracingLog,
};

// Scripts are written and then executed; forking while another test still holds
// a script open for writing fails with ETXTBSY, so these tests run one at a time.
fn serial() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(root: &Path, rel: &str, contents: &str) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    path
}

fn fake_compiler(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-starlight");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn project(root: &Path) {
    for name in ["a", "b"] {
        write(
            root,
            &format!("{name}.sl.json"),
            &format!(r#"{{"data": [{{"vsh": "{name}.vert", "fsh": "{name}.frag"}}]}}"#),
        );
        write(root, &format!("{name}.vert"), "void main() {}\n");
        write(root, &format!("{name}.frag"), "void main() {}\n");
    }
    fs::create_dir_all(root.join("inc/common")).unwrap();
}

fn local_generator(binary: &Path, cwd: &Path) -> Generator {
    let settings = Settings::default().with_overrides(Some(binary.display().to_string()), None);
    Generator::new(settings, PathResolver::with_cwd(cwd))
}

fn hooks() -> JobHooks<'static> {
    JobHooks {
        progress: &NoProgress,
        log: &TracingLog,
        prompt: &NoPrompt,
    }
}

#[tokio::test]
async fn configs_compile_one_after_another() {
    let _serial = serial();
    let root = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    project(root.path());
    let trace = tools.path().join("trace.log");
    let binary = fake_compiler(
        tools.path(),
        &format!(
            "echo \"start $2\" >> '{trace}'\nsleep 0.2\necho \"args $*\" >> '{trace}'\necho \"end $2\" >> '{trace}'",
            trace = trace.display()
        ),
    );

    let mut generator = local_generator(&binary, root.path());
    let report = generator
        .generate(&JobRequest::new(root.path()), hooks(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.invocations, 2);
    let lines: Vec<String> = fs::read_to_string(&trace)
        .unwrap()
        .lines()
        .filter(|line| !line.starts_with("args"))
        .map(str::to_string)
        .collect();
    assert_eq!(
        lines,
        vec!["start a.sl.json", "end a.sl.json", "start b.sl.json", "end b.sl.json"]
    );

    let args = fs::read_to_string(&trace).unwrap();
    assert!(args.contains(
        "args --batch-template a.sl.json --output-to-json-file-path --search-path inc --search-path inc/common"
    ));
}

#[tokio::test]
async fn stderr_errors_fail_the_job_after_all_configs_ran() {
    let _serial = serial();
    let root = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    project(root.path());
    let binary = fake_compiler(
        tools.path(),
        "echo \"compiling $2\"\necho \"[WARNING] unused uniform\" >&2\necho \"[ERROR] a.vert:3:2: undefined symbol\" >&2\nexit 1",
    );

    let mut generator = local_generator(&binary, tools.path());
    let err = generator
        .generate(&JobRequest::new(root.path()), hooks(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::CompilerErrors(2)));
    let diagnostics = generator.diagnostics();
    assert_eq!(diagnostics.len(), 4);
    assert_eq!(diagnostics.error_count(), 2);
    let located = diagnostics.get(&root.path().join("a.vert"));
    assert_eq!(located.len(), 2);
    assert_eq!(located[0].location.line, Some(3));
    assert_eq!(located[0].column_range(), Some(1..3));
    assert_eq!(diagnostics.get(&root.path().join("b.sl.json")).len(), 1);
}

#[tokio::test]
async fn warnings_alone_do_not_fail() {
    let _serial = serial();
    let root = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    project(root.path());
    let binary = fake_compiler(tools.path(), "echo \"[WARNING] slow path\" >&2\nexit 3");

    let mut generator = local_generator(&binary, tools.path());
    let report = generator
        .generate(
            &JobRequest::new(root.path().join("b.sl.json")),
            hooks(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.invocations, 1);
    assert_eq!(report.warnings, 1);
}

#[tokio::test]
async fn cancellation_stops_a_running_compiler() {
    let _serial = serial();
    let root = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    project(root.path());
    let binary = fake_compiler(tools.path(), "sleep 8");

    let cancel = CancellationToken::new();
    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            cancel.cancel();
        })
    };

    let started = Instant::now();
    let mut generator = local_generator(&binary, tools.path());
    let err = generator
        .generate(&JobRequest::new(root.path()), hooks(), cancel)
        .await
        .unwrap_err();
    trigger.await.unwrap();

    assert!(err.is_canceled());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(generator.diagnostics().is_empty());
}

#[tokio::test]
async fn slow_compiler_times_out() {
    let _serial = serial();
    let root = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    project(root.path());
    let binary = fake_compiler(tools.path(), "sleep 8");

    let compiler = LocalCompiler::new(&binary).with_timeout(Duration::from_millis(200));
    let input = JobInput::Config {
        root: root.path().to_path_buf(),
        config: root.path().join("a.sl.json"),
    };
    let resolver = PathResolver::with_cwd(tools.path());
    let ctx = JobContext::new(CancellationToken::new(), &NoProgress, &TracingLog);

    let err = compiler.run(&input, &resolver, &ctx).await.unwrap_err();
    assert!(matches!(err, JobError::Timeout { .. }));
}

#[tokio::test]
async fn timeout_keeps_diagnostics_from_earlier_configs() {
    let _serial = serial();
    let root = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    project(root.path());
    let binary = fake_compiler(
        tools.path(),
        "case \"$2\" in\n  a.sl.json) echo \"[ERROR] a.vert:3:2: undefined symbol\" >&2 ;;\n  *) sleep 8 ;;\nesac",
    );

    let mut generator =
        local_generator(&binary, tools.path()).with_local_timeout(Duration::from_millis(300));
    let err = generator
        .generate(&JobRequest::new(root.path()), hooks(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Timeout { ref config, .. } if config.ends_with("b.sl.json")));
    let diagnostics = generator.diagnostics();
    assert!(diagnostics.len() > 0);
    assert_eq!(diagnostics.error_count(), 1);
    assert_eq!(diagnostics.get(&root.path().join("a.vert")).len(), 1);
}

#[tokio::test]
async fn missing_binary_is_a_spawn_failure() {
    let _serial = serial();
    let root = tempfile::tempdir().unwrap();
    project(root.path());

    let mut generator = local_generator(&root.path().join("no-such-compiler"), root.path());
    let err = generator
        .generate(&JobRequest::new(root.path()), hooks(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Spawn { .. }));
}
