use epa_launcher::frontend::EpaFrontend;
use epa_launcher::launcher::{launch, LaunchOptions, OsSpawner, RunMode, EXIT_EXEC_FAILED, EXIT_SETUP_FAILED};
use epa_launcher::parse::parse_str;
use epa_launcher::{ChildSlot, ChildState, ChildStatus, LaunchError, LaunchSpec, OutputTarget, RedirectSpec};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::fs;
use std::path::Path;
use std::time::Duration;

fn quick() -> LaunchOptions {
    LaunchOptions { run_mode: RunMode::Run, start_grace: Duration::from_millis(200) }
}

fn sh(script: &str) -> LaunchSpec {
    LaunchSpec::new("/bin/sh", vec!["-c", script])
}

fn stdout_to(path: &Path, append: bool) -> RedirectSpec {
    RedirectSpec {
        stdout: Some(OutputTarget { path: path.display().to_string(), append }),
        ..RedirectSpec::default()
    }
}

/// Launch a child that outlives the grace window, then reap it.
fn run_to_completion(spec: &LaunchSpec, redirect: &RedirectSpec, handshake: &str) {
    let slot = ChildSlot::new();
    let pid = launch(&OsSpawner, spec, redirect, handshake, &quick(), &slot)
        .expect("launch")
        .expect("pid");
    assert_eq!(slot.pid(), Some(pid));
    assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
}

#[test]
fn early_exit_code_is_reported() {
    let slot = ChildSlot::new();
    let err = launch(&OsSpawner, &sh("exit 7"), &RedirectSpec::default(), "t", &quick(), &slot).unwrap_err();
    match err {
        LaunchError::EarlyExit(status) => assert_eq!(status, ChildStatus::ExitedWithCode(7)),
        other => panic!("expected early exit, got {:?}", other),
    }
    // reaped during the startup check, so nothing is left to kill
    assert_eq!(slot.raw(), 0);
}

#[test]
fn early_kill_is_reported_with_signal() {
    let slot = ChildSlot::new();
    let err = launch(&OsSpawner, &sh("kill -9 $$"), &RedirectSpec::default(), "t", &quick(), &slot).unwrap_err();
    assert!(matches!(
        err,
        LaunchError::EarlyExit(ChildStatus::KilledBySignal { signal, .. }) if signal == Signal::SIGKILL as i32
    ));
}

#[test]
fn missing_binary_fails_as_exec_error_exit() {
    let slot = ChildSlot::new();
    let spec = LaunchSpec::new("/nonexistent/app.addstrinst", Vec::<String>::new());
    let err = launch(&OsSpawner, &spec, &RedirectSpec::default(), "t", &quick(), &slot).unwrap_err();
    assert!(matches!(err, LaunchError::EarlyExit(ChildStatus::ExitedWithCode(code)) if code == EXIT_EXEC_FAILED));
}

#[test]
fn exec_failure_is_explained_on_child_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let err_path = dir.path().join("err.txt");
    let redirect = RedirectSpec {
        stderr: Some(OutputTarget { path: err_path.display().to_string(), append: false }),
        ..RedirectSpec::default()
    };
    let slot = ChildSlot::new();
    let spec = LaunchSpec::new("/nonexistent/app.addstrinst", Vec::<String>::new());
    let err = launch(&OsSpawner, &spec, &redirect, "t", &quick(), &slot).unwrap_err();
    assert!(matches!(err, LaunchError::EarlyExit(ChildStatus::ExitedWithCode(code)) if code == EXIT_EXEC_FAILED));
    let message = fs::read_to_string(&err_path).unwrap();
    assert!(message.starts_with("Error: error executing /nonexistent/app.addstrinst: "), "{}", message);
    assert!(message.ends_with('\n'));
}

#[test]
fn empty_executable_is_refused_before_fork() {
    let slot = ChildSlot::new();
    let spec = LaunchSpec { executable: String::new(), argv: vec![], env: Default::default() };
    let err = launch(&OsSpawner, &spec, &RedirectSpec::default(), "t", &quick(), &slot).unwrap_err();
    assert!(matches!(err, LaunchError::MissingExecutable));
    assert_eq!(slot.raw(), 0);
}

#[test]
fn unwritable_redirect_fails_in_child() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("missing-dir").join("out.txt");
    let slot = ChildSlot::new();
    let err = launch(&OsSpawner, &sh("sleep 5"), &stdout_to(&target, false), "t", &quick(), &slot).unwrap_err();
    assert!(matches!(err, LaunchError::EarlyExit(ChildStatus::ExitedWithCode(code)) if code == EXIT_SETUP_FAILED));
}

#[test]
fn append_keeps_output_of_both_runs() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("app.out");
    let redirect = stdout_to(&out, true);
    run_to_completion(&sh("echo first; sleep 1"), &redirect, "t");
    run_to_completion(&sh("echo second; sleep 1"), &redirect, "t");
    assert_eq!(fs::read_to_string(&out).unwrap(), "first\nsecond\n");
}

#[test]
fn truncate_replaces_previous_output() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("app.out");
    let redirect = stdout_to(&out, false);
    run_to_completion(&sh("echo first; sleep 1"), &redirect, "t");
    run_to_completion(&sh("echo second; sleep 1"), &redirect, "t");
    assert_eq!(fs::read_to_string(&out).unwrap(), "second\n");
}

#[test]
fn stdin_and_stderr_are_redirected() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    let err = dir.path().join("err.txt");
    fs::write(&input, "hello\n").unwrap();
    let redirect = RedirectSpec {
        stdin: Some(input.display().to_string()),
        stdout: None,
        stderr: Some(OutputTarget { path: err.display().to_string(), append: false }),
    };
    run_to_completion(&sh("read line; echo \"got $line\" >&2; sleep 1"), &redirect, "t");
    assert_eq!(fs::read_to_string(&err).unwrap(), "got hello\n");
}

#[test]
fn handshake_environment_reaches_child() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("env.out");
    let spec = sh("echo \"$METASIM_CACHE_SIMULATION $METASIM_ARIEL_FRONTEND $METASIM_SST_SHMEM $APP_MODE\"; sleep 1")
        .with_env("APP_MODE", "fast");
    run_to_completion(&spec, &stdout_to(&out, false), "/dev/shm/sst_shmem_test");
    assert_eq!(fs::read_to_string(&out).unwrap(), "0 1 /dev/shm/sst_shmem_test fast\n");
}

fn frontend_params(dir: &Path, script: &str) -> String {
    let link = dir.join("sh.addstrinst");
    std::os::unix::fs::symlink("/bin/sh", &link).unwrap();
    format!(
        "executable: {}\nappargcount: 2\napparg0: -c\napparg1: '{}'\nstartgrace: 200\nattachtimeout: 20\n",
        dir.join("sh").display(),
        script
    )
}

#[test]
fn frontend_waits_for_attach_then_finish_kills() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = frontend_params(dir.path(), "printf x >> \"$METASIM_SST_SHMEM\"; sleep 30");
    let params = parse_str(&yaml).unwrap();
    let mut frontend = EpaFrontend::new("fe", &params, RunMode::Run).unwrap();
    assert!(frontend.launch_spec().executable.ends_with("sh.addstrinst"));

    let pid: Pid = frontend.init(0).unwrap().expect("child pid");
    assert_eq!(frontend.supervisor().state(), &ChildState::Running);
    let tunnel = frontend.supervisor().handshake_name().unwrap().to_string();
    assert!(Path::new(&tunnel).exists());

    frontend.finish();
    assert!(!Path::new(&tunnel).exists());
    assert_eq!(frontend.child_slot().raw(), 0);
    assert!(matches!(waitpid(pid, None).unwrap(), WaitStatus::Signaled(_, Signal::SIGKILL, _)));

    frontend.finish();
    frontend.emergency_shutdown();
}

#[test]
fn frontend_attach_timeout_then_emergency_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = frontend_params(dir.path(), "sleep 30").replace("attachtimeout: 20", "attachtimeout: 1");
    let params = parse_str(&yaml).unwrap();
    let mut frontend = EpaFrontend::new("fe", &params, RunMode::Run).unwrap();

    let err = frontend.init(0).unwrap_err();
    assert!(matches!(err, LaunchError::AttachTimeout(d) if d == Duration::from_secs(1)));
    let pid = frontend.child_slot().pid().expect("child still recorded");

    frontend.emergency_shutdown();
    assert!(matches!(waitpid(pid, None).unwrap(), WaitStatus::Signaled(_, Signal::SIGKILL, _)));
}

#[test]
fn frontend_attach_wait_can_be_cancelled_from_another_thread() {
    let dir = tempfile::tempdir().unwrap();
    let params = parse_str(&frontend_params(dir.path(), "sleep 30")).unwrap();
    let frontend = EpaFrontend::new("fe", &params, RunMode::Run).unwrap();
    let cancel = frontend.attach_cancel();
    let slot = frontend.child_slot();

    let starting = std::thread::spawn(move || {
        let mut frontend = frontend;
        let started = frontend.init(0);
        (frontend, started)
    });
    std::thread::sleep(Duration::from_millis(500));
    let pid = slot.pid().expect("child recorded before the attach wait");
    cancel.cancel();

    let (mut frontend, started) = starting.join().unwrap();
    assert!(matches!(started, Err(LaunchError::AttachCancelled)));
    frontend.emergency_shutdown();
    assert!(matches!(waitpid(pid, None).unwrap(), WaitStatus::Signaled(_, Signal::SIGKILL, _)));
    assert!(frontend.supervisor().handshake_name().is_none());
}

#[test]
fn frontend_init_only_never_forks() {
    let dir = tempfile::tempdir().unwrap();
    let params = parse_str(&frontend_params(dir.path(), "exit 3")).unwrap();
    let mut frontend = EpaFrontend::new("fe", &params, RunMode::InitOnly).unwrap();
    assert_eq!(frontend.init(0).unwrap(), None);
    assert_eq!(frontend.child_slot().raw(), 0);
    assert_eq!(frontend.supervisor().state(), &ChildState::NotStarted);
    frontend.finish();
}

#[test]
fn frontend_without_executable_is_a_config_error() {
    let params = parse_str("appargcount: 0\n").unwrap();
    assert!(matches!(
        EpaFrontend::new("fe", &params, RunMode::Run),
        Err(LaunchError::MissingExecutable)
    ));
}
