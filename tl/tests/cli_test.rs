//! CLI tests for the `tl` binary

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

const PLAN: &str = "\
| ID | Task | Status |
|----|------|--------|
| T-1 | Scaffold crate | COMPLETE |
| T-2 | Parse config | IN PROGRESS |
";

/// `tl` running inside `dir`, with logs and user config kept out of $HOME
fn tl(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("tl");
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .env("XDG_DATA_HOME", dir.path().join("data"))
        .env("XDG_CONFIG_HOME", dir.path().join("config"))
        .env("NO_COLOR", "1");
    cmd
}

/// Project with PLAN.md, a worker that finishes the table, and a config file
fn project(gates: &[&str]) -> (TempDir, PathBuf) {
    project_with(gates, "")
}

/// Like [`project`], with `extra` appended to the config file
fn project_with(gates: &[&str], extra: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    fs::write(dir.path().join("PLAN.md"), PLAN).unwrap();

    let worker = dir.path().join("worker.sh");
    fs::write(
        &worker,
        "#!/bin/sh\nsed 's/IN PROGRESS/DONE/' PLAN.md > PLAN.tmp && mv PLAN.tmp PLAN.md\n",
    )
    .unwrap();
    fs::set_permissions(&worker, fs::Permissions::from_mode(0o755)).unwrap();

    let gates = gates.iter().map(|g| format!("    - \"{}\"\n", g)).collect::<String>();
    let config = dir.path().join("cfg.yml");
    fs::write(
        &config,
        format!(
            "project:\n  root: {}\n  state-file: PLAN.md\n\
             worker:\n  command: {}\n  stdio: piped\n\
             gates:\n  commands:\n{}\
             loop:\n  pause-ms: 0\n  max-iterations: 5\n{}",
            dir.path().display(),
            worker.display(),
            if gates.is_empty() { "    []\n".to_string() } else { gates },
            extra,
        ),
    )
    .unwrap();
    (dir, config)
}

fn lock_path(dir: &TempDir) -> PathBuf {
    dir.path().join(".taskloop").join("loop.lock")
}

fn write_lock(dir: &TempDir, pid: u32) {
    let path = lock_path(dir);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(
        &path,
        format!(r#"{{"pid": {}, "started_at": "2026-01-01T00:00:00Z", "mode": "run"}}"#, pid),
    )
    .unwrap();
}

fn config_arg(config: &Path) -> [String; 2] {
    ["--config".to_string(), config.display().to_string()]
}

// =============================================================================
// Help and version
// =============================================================================

#[test]
fn test_cli_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    tl(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("gates"))
        .stdout(predicate::str::contains("unlock"))
        .stdout(predicate::str::contains("Exit codes"));
}

#[test]
fn test_cli_version() {
    let dir = TempDir::new().unwrap();
    tl(&dir).arg("--version").assert().success().stdout(predicate::str::starts_with("tl "));
}

// =============================================================================
// status
// =============================================================================

#[test]
fn test_status_text() {
    let (dir, config) = project(&[]);
    tl(&dir)
        .args(config_arg(&config))
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("work-left"))
        .stdout(predicate::str::contains("2 total, 1 complete, 1 remaining"))
        .stdout(predicate::str::contains("T-2 Parse config"))
        .stdout(predicate::str::contains("free"));
}

#[test]
fn test_status_json_reports_stale_lock() {
    let (dir, config) = project(&[]);
    write_lock(&dir, 999_999);

    let output = tl(&dir)
        .args(config_arg(&config))
        .args(["status", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("status json");
    assert_eq!(report["state"], "work-left");
    assert_eq!(report["stats"]["total"], 2);
    assert_eq!(report["active-item"]["id"], "T-2");
    assert_eq!(report["lock"]["pid"], 999_999);
    assert_eq!(report["lock"]["owner-alive"], false);
}

#[test]
fn test_status_reads_project_local_config() {
    let (dir, config) = project(&[]);
    fs::rename(&config, dir.path().join(".taskloop.yml")).unwrap();

    tl(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("PLAN.md"))
        .stdout(predicate::str::contains("work-left"));
}

// =============================================================================
// run
// =============================================================================

#[test]
fn test_run_finishes_table() {
    let (dir, config) = project(&["true"]);

    tl(&dir)
        .args(config_arg(&config))
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("all tasks complete"));

    assert!(fs::read_to_string(dir.path().join("PLAN.md")).unwrap().contains("| T-2 | Parse config | DONE |"));
    assert!(!lock_path(&dir).exists());
    assert!(dir.path().join(".taskloop").join("loop.log").exists());
}

#[test]
fn test_run_refused_while_holder_alive() {
    let (dir, config) = project(&[]);
    let pid = std::process::id();
    write_lock(&dir, pid);

    tl(&dir)
        .args(config_arg(&config))
        .arg("run")
        .assert()
        .code(1)
        .stderr(predicate::str::contains(pid.to_string()));

    // Untouched: the worker never ran and the lock still names the holder
    assert!(fs::read_to_string(dir.path().join("PLAN.md")).unwrap().contains("IN PROGRESS"));
    assert!(fs::read_to_string(lock_path(&dir)).unwrap().contains(&pid.to_string()));
}

#[test]
fn test_run_rejects_zero_iterations() {
    let (dir, config) = project(&[]);
    tl(&dir)
        .args(config_arg(&config))
        .args(["run", "--max-iterations", "0"])
        .assert()
        .failure();
    assert!(!lock_path(&dir).exists());
}

// =============================================================================
// gates
// =============================================================================

#[test]
fn test_gates_reports_each_command() {
    let (dir, config) = project(&["true", "false"]);
    tl(&dir)
        .args(config_arg(&config))
        .arg("gates")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("1/2 gates passed"))
        .stderr(predicate::str::contains("Gate 'false' failed with exit code 1"));
}

#[test]
fn test_gates_none_configured() {
    let (dir, config) = project(&[]);
    tl(&dir)
        .args(config_arg(&config))
        .arg("gates")
        .assert()
        .success()
        .stdout(predicate::str::contains("No gates configured"));
}

// =============================================================================
// unlock
// =============================================================================

#[test]
fn test_unlock_without_lock() {
    let (dir, config) = project(&[]);
    tl(&dir)
        .args(config_arg(&config))
        .arg("unlock")
        .assert()
        .success()
        .stdout(predicate::str::contains("No lock held"));
}

#[test]
fn test_unlock_removes_stale_lock() {
    let (dir, config) = project(&[]);
    write_lock(&dir, 999_999);

    tl(&dir)
        .args(config_arg(&config))
        .arg("unlock")
        .assert()
        .success()
        .stdout(predicate::str::contains("PID 999999"));
    assert!(!lock_path(&dir).exists());
}

#[test]
fn test_unlock_live_holder_needs_force() {
    let (dir, config) = project(&[]);
    write_lock(&dir, std::process::id());

    tl(&dir)
        .args(config_arg(&config))
        .arg("unlock")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--force"));
    assert!(lock_path(&dir).exists());

    tl(&dir).args(config_arg(&config)).args(["unlock", "--force"]).assert().success();
    assert!(!lock_path(&dir).exists());
}

// =============================================================================
// Signals delivered to a running `tl run`
// =============================================================================

#[cfg(target_os = "linux")]
mod signals {
    use super::*;

    use std::process::{Child, ExitStatus, Stdio};
    use std::thread;
    use std::time::{Duration, Instant};

    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    /// Gate that records its process group and then blocks
    const BLOCKING_GATE: &str = "echo $$ > g1.pid; sleep 30";

    /// Gate that only starts if the run keeps going after the first one
    const SECOND_GATE: &str = "touch g2";

    fn spawn_run(dir: &TempDir, config: &Path) -> Child {
        std::process::Command::new(env!("CARGO_BIN_EXE_tl"))
            .current_dir(dir.path())
            .env("HOME", dir.path())
            .env("XDG_DATA_HOME", dir.path().join("data"))
            .env("XDG_CONFIG_HOME", dir.path().join("config"))
            .env("NO_COLOR", "1")
            .args(config_arg(config))
            .arg("run")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to spawn tl")
    }

    fn send(child: &Child, signal: Signal) {
        kill(Pid::from_raw(child.id() as i32), signal).expect("Failed to signal tl");
    }

    /// Wait for the blocking gate to start and return its process group
    fn wait_for_gate(dir: &TempDir) -> i32 {
        let path = dir.path().join("g1.pid");
        let deadline = Instant::now() + Duration::from_secs(15);
        while Instant::now() < deadline {
            if let Ok(text) = fs::read_to_string(&path)
                && text.ends_with('\n')
                && let Ok(pid) = text.trim().parse()
            {
                return pid;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("gate never started");
    }

    fn wait_exit(child: &mut Child, limit: Duration) -> ExitStatus {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait().expect("try_wait failed") {
                return status;
            }
            thread::sleep(Duration::from_millis(20));
        }
        let _ = child.kill();
        panic!("tl did not exit within {limit:?}");
    }

    /// A non-zombie process in group `pgid` still exists
    fn group_alive(pgid: i32) -> bool {
        let Ok(entries) = fs::read_dir("/proc") else {
            return false;
        };
        entries.flatten().any(|entry| {
            let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
                return false;
            };
            // Fields after the parenthesized command: state ppid pgrp ...
            let Some(rest) = stat.rfind(')').map(|i| &stat[i + 1..]) else {
                return false;
            };
            let fields: Vec<&str> = rest.split_whitespace().collect();
            fields.len() > 2 && fields[0] != "Z" && fields[2] == pgid.to_string()
        })
    }

    fn assert_group_gone(pgid: i32) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while group_alive(pgid) {
            assert!(Instant::now() < deadline, "gate process group {pgid} survived tl");
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn assert_torn_down(dir: &TempDir, pgid: i32) {
        assert!(!lock_path(dir).exists(), "lock must be released");
        assert_group_gone(pgid);
        // Nothing may start a later gate once shutdown began, not even after exit
        thread::sleep(Duration::from_millis(300));
        assert!(!dir.path().join("g2").exists(), "second gate started after the signal");
    }

    #[test]
    fn test_sigint_during_gate_exits_130_and_stops_later_gates() {
        let (dir, config) = project_with(&[BLOCKING_GATE, SECOND_GATE], "shutdown:\n  kill-grace-ms: 500\n");
        let mut tl = spawn_run(&dir, &config);
        let pgid = wait_for_gate(&dir);

        send(&tl, Signal::SIGINT);
        let status = wait_exit(&mut tl, Duration::from_secs(10));

        assert_eq!(status.code(), Some(130));
        assert_torn_down(&dir, pgid);
        let log = fs::read_to_string(dir.path().join(".taskloop").join("loop.log")).unwrap();
        assert!(log.contains("run.cleanup"));
    }

    #[test]
    fn test_sigterm_during_gate_exits_143() {
        let (dir, config) = project_with(&[BLOCKING_GATE, SECOND_GATE], "shutdown:\n  kill-grace-ms: 500\n");
        let mut tl = spawn_run(&dir, &config);
        let pgid = wait_for_gate(&dir);

        send(&tl, Signal::SIGTERM);
        let status = wait_exit(&mut tl, Duration::from_secs(10));

        assert_eq!(status.code(), Some(143));
        assert_torn_down(&dir, pgid);
    }

    #[test]
    fn test_second_sigint_skips_kill_grace() {
        // The gate ignores SIGTERM, so a graceful shutdown would sit out the full grace window
        let stubborn = "trap '' TERM; echo $$ > g1.pid; while true; do sleep 0.1; done";
        let (dir, config) = project_with(&[stubborn, SECOND_GATE], "shutdown:\n  kill-grace-ms: 20000\n");
        let mut tl = spawn_run(&dir, &config);
        let pgid = wait_for_gate(&dir);

        send(&tl, Signal::SIGINT);
        thread::sleep(Duration::from_millis(500));
        assert!(tl.try_wait().unwrap().is_none(), "first SIGINT should wait on the gate");
        let second = Instant::now();
        send(&tl, Signal::SIGINT);
        let status = wait_exit(&mut tl, Duration::from_secs(10));

        assert_eq!(status.code(), Some(130));
        assert!(second.elapsed() < Duration::from_secs(5), "second SIGINT did not force the exit");
        assert_torn_down(&dir, pgid);
    }
}
