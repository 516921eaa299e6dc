#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{TimeDelta, Utc};
use serde_json::{Map, Value, json};
use tempfile::TempDir;

pub const IMEI: &str = "860000000000001";

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    /// Each stdout line parsed as JSON; non-JSON lines are skipped.
    pub fn json_lines(&self) -> Vec<Value> {
        self.stdout
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_fre") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "fre.exe" } else { "fre" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve fre binary path for integration test"),
    }
}

/// Isolated config file plus database under a temp dir.
pub struct Workspace {
    pub dir: TempDir,
    pub config_path: PathBuf,
    pub db_path: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp workspace");
        let db_path = dir.path().join("fre.sqlite3");
        let config_path = dir.path().join("config.toml");
        let config = format!(
            "[paths]\nsqlite_db = {db:?}\n\n[api]\nenabled = false\n\n[notifications]\nenabled = false\n",
            db = db_path.to_string_lossy(),
        );
        fs::write(&config_path, config).expect("write test config");
        Self {
            dir,
            config_path,
            db_path,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run `fre --config <workspace config> --json <args>`.
    pub fn run(&self, case_name: &str, args: &[&str]) -> CmdResult {
        self.run_with_stdin(case_name, args, "")
    }

    pub fn run_with_stdin(&self, case_name: &str, args: &[&str], stdin: &str) -> CmdResult {
        let config = self.config_path.to_string_lossy().to_string();
        let mut full: Vec<&str> = vec!["--config", &config, "--json"];
        full.extend_from_slice(args);
        run_cli_with_stdin(case_name, &full, stdin)
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    run_cli_with_stdin(case_name, args, "")
}

pub fn run_cli_with_stdin(case_name: &str, args: &[&str], stdin: &str) -> CmdResult {
    let root = std::env::temp_dir().join("fre-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut child = Command::new(&bin_path)
        .args(args)
        .env("FRE_LOG", "fleet_rule_engine=debug")
        .env_remove("FRE_OUTPUT_FORMAT")
        .env("RUST_BACKTRACE", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("execute fre command");
    if let Some(mut pipe) = child.stdin.take() {
        pipe.write_all(stdin.as_bytes()).expect("write stdin");
    }
    let output = child.wait_with_output().expect("wait for fre command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

// ──────────────────── payload fixtures ────────────────────

/// One tracker sample relative to now.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub minutes_ago: i64,
    pub speed_mps: f64,
    pub gsm: i64,
    pub valid: bool,
}

impl Sample {
    pub const fn valid(minutes_ago: i64, speed_mps: f64, gsm: i64) -> Self {
        Self {
            minutes_ago,
            speed_mps,
            gsm,
            valid: true,
        }
    }

    pub const fn invalid(minutes_ago: i64, speed_mps: f64, gsm: i64) -> Self {
        Self {
            minutes_ago,
            speed_mps,
            gsm,
            valid: false,
        }
    }
}

/// Gateway payload in the keyed `ListPackets` form.
pub fn payload(imei: &str, samples: &[Sample]) -> String {
    let now = Utc::now();
    let packets: Map<String, Value> = samples
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let at = now - TimeDelta::minutes(s.minutes_ago);
            (
                i.to_string(),
                json!({
                    "Speed": s.speed_mps,
                    "GSMSignalStrength": s.gsm,
                    "Datetime": at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                    "PositioningStatus": if s.valid { "A" } else { "V" },
                    "Latitude": 19.432_608,
                    "Longitude": -99.133_209,
                }),
            )
        })
        .collect();
    json!({"IMEI": imei, "ListPackets": packets}).to_string()
}

/// Ten valid moving samples with a weak signal, then one packet without a
/// valid fix six minutes later.
pub fn jammer_samples() -> Vec<Sample> {
    let mut samples: Vec<Sample> = (11..=20).rev().map(|m| Sample::valid(m, 10.0, 5)).collect();
    samples.push(Sample::invalid(5, 10.0, 4));
    samples
}

pub const JAMMER_MANIFEST: &str = "stages:
  - rule: jammer
    order: 2
    audit:
      description: jammer pattern evaluated
      level: critical
      is_alert: true
      snapshot: [packet, state]
";

pub const BUFFER_MANIFEST: &str = "stages:
  - rule: buffer
    order: 1
    audit:
      description: buffer updated
";
