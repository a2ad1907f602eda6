//! Configuration system tests
//!
//! Tests configuration loading, validation, and environment overrides
//! through the binary.

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Test fixture for configuration testing
struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("executor.toml");
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }
}

fn taskhost_cmd() -> Command {
    Command::cargo_bin("taskhost").unwrap()
}

fn validate(fixture: &ConfigFixture) -> assert_cmd::assert::Assert {
    taskhost_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg(fixture.path())
        .assert()
}

fn show(fixture: &ConfigFixture) -> Command {
    let mut cmd = taskhost_cmd();
    cmd.arg("config").arg("show").arg("--config").arg(fixture.path());
    cmd
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_minimal_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator]
url = "ws://coordinator.example.com:7077"
"#,
    );

    validate(&fixture).success();
}

#[test]
fn test_full_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[executor]
id = "exec-test-001"
cores = 8
max_concurrent_tasks = 4
heartbeat_interval_ms = 5000
heartbeat_timeout_ms = 15000
shutdown_timeout_ms = 2000
max_result_size = 0
max_frame_size = 1048576
strict_leak_detection = true
user_classpath_first = true
user_class_path = ["/opt/libs/extra.jar"]
fetch_use_cache = false

[coordinator]
url = "wss://coordinator.example.com"
reconnect_interval_ms = 1000
max_reconnect_interval_ms = 30000
max_reconnect_attempts = 5
connect_timeout_ms = 60000

[storage]
work_dir = "/tmp/taskhost/work"
cache_dir = "/tmp/taskhost/cache"
block_dir = "/tmp/taskhost/blocks"

[logging]
level = "debug"
file = "/tmp/taskhost.log"
max_file_size_mb = 50
max_files = 3
json_format = true
"#,
    );

    validate(&fixture).success();
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_invalid_coordinator_url() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator]
url = "http://not-websocket.com"
"#,
    );

    validate(&fixture)
        .code(10)
        .stderr(predicate::str::contains("E102"));
}

#[test]
fn test_zero_heartbeat_interval() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[executor]
heartbeat_interval_ms = 0
"#,
    );

    validate(&fixture)
        .failure()
        .stderr(predicate::str::contains("heartbeat_interval_ms"));
}

#[test]
fn test_frame_size_must_exceed_reserved_bytes() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[executor]
max_frame_size = 204800
"#,
    );

    validate(&fixture)
        .failure()
        .stderr(predicate::str::contains("max_frame_size"));
}

#[test]
fn test_invalid_log_level() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[logging]
level = "invalid_level"
"#,
    );

    validate(&fixture).failure();
}

#[test]
fn test_malformed_toml() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator
url = "ws://example.com"
"#,
    );

    validate(&fixture)
        .code(10)
        .stderr(predicate::str::contains("E101"));
}

// ─────────────────────────────────────────────────────────────────
// Config Show Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_show_custom() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[executor]
id = "custom-exec-123"
max_concurrent_tasks = 12

[coordinator]
url = "wss://custom.example.com"
"#,
    );

    show(&fixture)
        .assert()
        .success()
        .stdout(predicate::str::contains("custom-exec-123"))
        .stdout(predicate::str::contains("max_concurrent_tasks = 12"))
        .stdout(predicate::str::contains("wss://custom.example.com"));
}

// ─────────────────────────────────────────────────────────────────
// Config Init Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_init_creates_valid_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("nested").join("executor.toml");

    taskhost_cmd()
        .arg("config")
        .arg("init")
        .arg("--path")
        .arg(config_path.to_str().unwrap())
        .assert()
        .success()
        .stdout(predicate::str::contains("Created configuration file"));

    assert!(config_path.exists());

    taskhost_cmd()
        .arg("config")
        .arg("validate")
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .assert()
        .success();
}

#[test]
fn test_config_init_refuses_overwrite() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[executor]\n");

    taskhost_cmd()
        .arg("config")
        .arg("init")
        .arg("--path")
        .arg(fixture.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_config_init_force_overwrite() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[executor]\nid = \"stale-id\"\n");

    taskhost_cmd()
        .arg("config")
        .arg("init")
        .arg("--path")
        .arg(fixture.path())
        .arg("--force")
        .assert()
        .success();

    let content = fs::read_to_string(fixture.path()).unwrap();
    assert!(!content.contains("stale-id"));
    assert!(content.contains("[executor]"));
}

// ─────────────────────────────────────────────────────────────────
// Environment Variable Override Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_env_override_coordinator_url() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[coordinator]
url = "ws://file.example.com"
"#,
    );

    show(&fixture)
        .env("TASKHOST_COORDINATOR_URL", "wss://env.example.com")
        .assert()
        .success()
        .stdout(predicate::str::contains("wss://env.example.com"))
        .stdout(predicate::str::contains("file.example.com").not());
}

#[test]
fn test_env_override_executor_settings() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");

    show(&fixture)
        .env("TASKHOST_MAX_CONCURRENT_TASKS", "6")
        .env("TASKHOST_STRICT_LEAK_DETECTION", "true")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_concurrent_tasks = 6"))
        .stdout(predicate::str::contains("strict_leak_detection = true"));
}

// ─────────────────────────────────────────────────────────────────
// Path Expansion Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_tilde_expansion() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[storage]
work_dir = "~/taskhost/work"
cache_dir = "~/taskhost/cache"
block_dir = "~/taskhost/blocks"
"#,
    );

    let output = show(&fixture).env("HOME", "/home/tester").assert().success();
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();

    assert!(!stdout.contains("work_dir = \"~"));
    assert!(stdout.contains("/home/tester/taskhost/work"));
}
