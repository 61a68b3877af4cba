use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir()
            .unwrap_or_else(|err| panic!("failed to create temp dir: {err}"));
        Self { dir }
    }

    fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    fn home(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    fn project(&self) -> PathBuf {
        self.dir.path().join("project")
    }

    fn user_settings(&self) -> PathBuf {
        self.home().join(".claude").join("settings.json")
    }

    fn project_settings(&self) -> PathBuf {
        self.project().join(".claude").join("settings.json")
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "--cache-dir".to_string(),
            path_str(&self.cache_dir()).to_string(),
            "--home".to_string(),
            path_str(&self.home()).to_string(),
            "--project-dir".to_string(),
            path_str(&self.project()).to_string(),
        ]
    }

    fn run(&self, args: &[&str]) -> Output {
        let mut all = self.base_args();
        all.extend(args.iter().map(ToString::to_string));
        run_pmem(all)
    }

    fn run_json(&self, args: &[&str]) -> Value {
        let output = self.run(args);
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            panic!(
                "pmem command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
                output.status, stdout, stderr
            );
        }
        parse_stdout(&output)
    }

    fn run_json_failure(&self, args: &[&str]) -> Value {
        let output = self.run(args);
        assert!(!output.status.success(), "expected pmem {args:?} to fail");
        parse_stdout(&output)
    }
}

fn run_pmem<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_pmem"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute pmem binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("invalid JSON in {}: {err}", path.display()))
}

fn write_file(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .unwrap_or_else(|err| panic!("failed to create {}: {err}", parent.display()));
    }
    fs::write(path, body).unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

fn array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

#[test]
fn enable_status_disable_round_trip() {
    let ws = Workspace::new();

    let enabled = ws.run_json(&["enable", "alpha@beta", "--scope", "project"]);
    assert_eq!(enabled["ok"], true);
    assert_eq!(enabled["outcome"]["changed"], true);
    assert_eq!(enabled["contract_version"], "pmem.v1");
    assert_eq!(
        read_json_file(&ws.project_settings()),
        serde_json::json!({"enabledPlugins": {"alpha@beta": true}})
    );

    let status = ws.run_json(&["scopes", "status", "alpha@beta"]);
    assert_eq!(status["active_scopes"], serde_json::json!(["project"]));

    let pairs = ws.run_json(&["cache", "list"]);
    let entries = array(&pairs, "pairs");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["key"], "alpha@beta");
    assert_eq!(entries[0]["use_count"], 1);

    let disabled = ws.run_json(&["disable", "alpha@beta", "--scope", "project"]);
    assert_eq!(disabled["outcome"]["changed"], true);
    let status = ws.run_json(&["scopes", "status", "alpha@beta"]);
    assert_eq!(status["active_scopes"], serde_json::json!([]));

    let pairs = ws.run_json(&["cache", "list"]);
    assert_eq!(array(&pairs, "pairs")[0]["use_count"], 1);

    let history = ws.run_json(&["history", "show"]);
    let actions = array(&history, "entries")
        .iter()
        .map(|entry| entry["action"].as_str().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert_eq!(actions, ["add", "query", "remove", "query"]);
}

#[test]
fn disable_all_reports_partial_failure() {
    let ws = Workspace::new();
    write_file(&ws.user_settings(), "{\"enabledPlugins\": {\"alpha@beta\": true}}");
    write_file(&ws.project_settings(), "{ not json");

    let result = ws.run_json_failure(&["disable", "alpha@beta", "--all"]);
    assert_eq!(result["ok"], false);
    assert_eq!(array(&result, "succeeded").len(), 2);
    let failed = array(&result, "failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["scope"], "project");

    assert_eq!(
        read_json_file(&ws.user_settings()),
        serde_json::json!({"enabledPlugins": {}})
    );
    assert_eq!(
        fs::read_to_string(ws.project_settings()).unwrap_or_default(),
        "{ not json"
    );
}

#[test]
fn dry_run_enable_writes_no_settings() {
    let ws = Workspace::new();

    let result = ws.run_json(&["enable", "alpha@beta", "--scope", "user", "--dry-run"]);
    assert_eq!(result["outcome"]["dry_run"], true);
    assert_eq!(result["outcome"]["changed"], true);
    assert!(!ws.user_settings().exists());

    let pairs = ws.run_json(&["cache", "list"]);
    assert_eq!(array(&pairs, "pairs")[0]["use_count"], 0);
    assert_eq!(array(&pairs, "pairs")[0]["attempt_count"], 1);
    let sources = ws.run_json(&["cache", "list", "--sources"]);
    assert!(array(&sources, "sources").is_empty());
}

#[test]
fn cache_forget_and_clear() {
    let ws = Workspace::new();
    ws.run_json(&["enable", "alpha@beta", "--scope", "local"]);
    ws.run_json(&["enable", "gamma@beta", "--scope", "local"]);

    let forgotten = ws.run_json(&["cache", "forget", "alpha@beta"]);
    assert_eq!(forgotten["removed"], true);
    let again = ws.run_json(&["cache", "forget", "alpha@beta"]);
    assert_eq!(again["removed"], false);

    let source = ws.run_json(&["cache", "forget-source", "beta"]);
    assert_eq!(source["removed"], true);

    let cleared = ws.run_json(&["cache", "clear"]);
    assert_eq!(cleared["pairs_cleared"], true);
    assert_eq!(cleared["sources_cleared"], true);
    assert!(array(&ws.run_json(&["cache", "list"]), "pairs").is_empty());
}

#[test]
fn history_trim_with_explicit_keep() {
    let ws = Workspace::new();
    for _ in 0..4 {
        ws.run_json(&["scopes", "status", "alpha@beta"]);
    }

    let trimmed = ws.run_json(&["history", "trim", "--keep", "1"]);
    assert_eq!(trimmed["report"], serde_json::json!({"before": 4, "after": 1, "removed": 3}));
    assert_eq!(array(&ws.run_json(&["history", "show"]), "entries").len(), 1);

    let untouched = ws.run_json(&["history", "trim", "--older-than-days", "30"]);
    assert_eq!(untouched["report"]["removed"], 0);
}

#[test]
fn overview_lists_active_identities() {
    let ws = Workspace::new();
    ws.run_json(&["enable", "alpha@beta", "--scope", "user"]);
    ws.run_json(&["enable", "alpha@beta", "--scope", "local"]);

    let overview = ws.run_json(&["scopes", "overview"]);
    assert_eq!(overview["active"], serde_json::json!({"alpha@beta": ["user", "local"]}));
    assert_eq!(array(&overview, "scopes").len(), 3);
}

#[test]
fn malformed_key_is_rejected() {
    let ws = Workspace::new();
    let output = ws.run(&["enable", "no-separator", "--scope", "user"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no-separator"), "stderr:\n{stderr}");
    assert!(!ws.user_settings().exists());
}

#[cfg(unix)]
#[test]
fn non_utf8_arguments_are_recorded_lossily() {
    use std::os::unix::ffi::OsStrExt;

    let ws = Workspace::new();
    let cache_dir = ws.cache_dir();
    let home = ws.home();
    let project = ws.dir.path().join(OsStr::from_bytes(b"proj\xff"));
    let args: Vec<&OsStr> = vec![
        OsStr::new("--cache-dir"),
        cache_dir.as_os_str(),
        OsStr::new("--home"),
        home.as_os_str(),
        OsStr::new("--project-dir"),
        project.as_os_str(),
        OsStr::new("scopes"),
        OsStr::new("status"),
        OsStr::new("alpha@beta"),
    ];
    let output = run_pmem(args);
    assert!(output.status.success(), "stderr:\n{}", String::from_utf8_lossy(&output.stderr));

    let history = ws.run_json(&["history", "show"]);
    let entries = array(&history, "entries");
    assert_eq!(entries.len(), 1);
    let command_line = array(&entries[0]["context"], "command_line");
    let recorded =
        command_line.iter().filter_map(Value::as_str).any(|arg| arg.ends_with("proj\u{fffd}"));
    assert!(recorded, "command line: {command_line:?}");
}
