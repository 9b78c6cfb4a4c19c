use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    /// Point the tracker at a port nothing listens on
    fn with_unreachable_server(self) -> Self {
        let config_dir = self.xdg_config.join("sogamo");
        fs::create_dir_all(&config_dir).expect("failed to create config dir");
        fs::write(
            config_dir.join("config.toml"),
            "[tracker]\nserver_url = \"http://127.0.0.1:9\"\nrequest_timeout_secs = 2\n",
        )
        .expect("failed to write config");
        self
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("sogamo/sogamo.db")
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("sogamo"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("SOGAMO_TOKEN")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute sogamo: {e}"))
}

fn assert_success(args: &[&str], output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return stdout;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "sogamo {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn run_ok(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run_bin(env, args);
    assert_success(args, &output)
}

#[test]
fn track_persists_events_across_invocations() {
    let env = CliTestEnv::new();

    run_ok(&env, &["--token", "demo", "track", "Signed Up", "--prop", "plan=pro"]);
    run_ok(&env, &["--token", "demo", "track", "Opened"]);

    assert!(env.db_path().exists(), "snapshot database should exist");

    let status = run_ok(&env, &["--token", "demo", "status"]);
    assert!(status.contains("Sogamo Tracker Status"));
    assert!(
        status.contains("Pending Events:  2"),
        "expected two pending events, got:\n{status}"
    );

    let tokens = run_ok(&env, &["tokens"]);
    assert_eq!(tokens.trim(), "demo");
}

#[test]
fn profile_ops_are_withheld_until_identify() {
    let env = CliTestEnv::new();

    let output = run_ok(&env, &["--token", "demo", "people", "set", "plan=pro"]);
    assert!(output.contains("withheld until identify"));

    let status = run_ok(&env, &["--token", "demo", "status"]);
    assert!(status.contains("Withheld:        1"), "got:\n{status}");
    assert!(status.contains("People ID:       <not set>"));

    run_ok(&env, &["--token", "demo", "identify", "user-9"]);

    let status = run_ok(&env, &["--token", "demo", "status"]);
    assert!(status.contains("Withheld:        0"), "got:\n{status}");
    assert!(status.contains("Pending Profile: 1"), "got:\n{status}");
    assert!(status.contains("Distinct ID:     user-9"));
}

#[test]
fn register_once_and_reset() {
    let env = CliTestEnv::new();

    run_ok(&env, &["--token", "demo", "register", "source=organic"]);
    run_ok(
        &env,
        &["--token", "demo", "register", "--once", "source=ad", "level=1"],
    );

    let status = run_ok(&env, &["--token", "demo", "status"]);
    assert!(status.contains("source = \"organic\""), "got:\n{status}");
    assert!(status.contains("level = 1"), "got:\n{status}");

    run_ok(&env, &["--token", "demo", "track", "A"]);
    run_ok(&env, &["--token", "demo", "reset"]);

    let status = run_ok(&env, &["--token", "demo", "status"]);
    assert!(status.contains("Super Props:     0"), "got:\n{status}");
    assert!(status.contains("Pending Events:  0"), "got:\n{status}");
}

#[test]
fn flush_keeps_records_when_server_unreachable() {
    let env = CliTestEnv::new().with_unreachable_server();

    run_ok(&env, &["--token", "demo", "track", "A"]);
    let output = run_ok(&env, &["--token", "demo", "flush"]);
    assert!(output.contains("Failed attempts:  1"), "got:\n{output}");
    assert!(output.contains("Still queued:     1"), "got:\n{output}");

    let status = run_ok(&env, &["--token", "demo", "status"]);
    assert!(status.contains("Pending Events:  1"), "got:\n{status}");
}

#[test]
fn forget_deletes_only_that_token() {
    let env = CliTestEnv::new();

    run_ok(&env, &["--token", "demo", "track", "A"]);
    run_ok(&env, &["--token", "other", "track", "B"]);

    let output = run_ok(&env, &["--token", "demo", "forget"]);
    assert!(output.contains("Deleted snapshot for demo"), "got:\n{output}");

    let tokens = run_ok(&env, &["tokens"]);
    assert_eq!(tokens.trim(), "other");

    let output = run_ok(&env, &["--token", "demo", "forget"]);
    assert!(output.contains("No snapshot saved for demo"), "got:\n{output}");
}

#[test]
fn missing_token_is_an_error() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["track", "A"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no project token"), "got:\n{stderr}");
}
