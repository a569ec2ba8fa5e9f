//! End-to-end tests for the logflow-ingest binary
//!
//! Every test runs in its own scratch directory with the crawler feed
//! disabled so nothing touches the network.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

const LOG: &str = concat!(
    r#"192.168.1.10 - - [15/Mar/2021:10:12:01 +0000] "GET /uniprot/P12345.fasta HTTP/1.1" 200 1024 "-" "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/89.0.4389.90 Safari/537.36""#,
    "\n",
    r#"66.249.66.1 - - [15/Mar/2021:10:12:05 +0000] "GET /uniprot/Q8N158 HTTP/1.1" 200 2048 "-" "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)""#,
    "\n",
    "not an access log line\n",
);

fn logflow(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("logflow-ingest").unwrap();
    cmd.current_dir(dir)
        .env("LOG_LEVEL", "warn")
        .env("LOGFLOW_NO_CRAWLER_FEED", "true")
        .env_remove("LOGFLOW_OUT_DIR")
        .env_remove("LOGFLOW_DB_PATH");
    cmd
}

fn ingest(dir: &Path, log: &Path) -> Command {
    let mut cmd = logflow(dir);
    cmd.arg("ingest")
        .arg("--log-path")
        .arg(log)
        .arg("--namespace")
        .arg("rest")
        .arg("--out-dir")
        .arg(dir.join("out"))
        .arg("--legacy")
        .arg("--no-crawler-feed");
    cmd
}

// ============================================================================
// classify
// ============================================================================

#[test]
fn test_classify_programmatic_agent() {
    let dir = tempfile::tempdir().unwrap();
    logflow(dir.path())
        .args(["classify", "python-requests/2.28.1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("programmatic"));
}

#[test]
fn test_classify_json_output() {
    let dir = tempfile::tempdir().unwrap();
    logflow(dir.path())
        .args([
            "classify",
            "--json",
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""category":"bot""#));
}

#[test]
fn test_classify_with_regexes_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let rules = dir.path().join("regexes.yaml");
    std::fs::write(
        &rules,
        "user_agent_parsers:\n  - regex: '(Lynx)/(\\d+)'\nos_parsers: []\ndevice_parsers: []\n",
    )
    .unwrap();

    logflow(dir.path())
        .arg("classify")
        .arg("--ua-regexes")
        .arg(&rules)
        .arg("Lynx/2.9.0dev.12 libwww-FM/2.14 SSL-MM/1.4.1")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("Lynx\t"));
}

#[test]
fn test_malformed_dotenv_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".env"), "NOT A VALID LINE\n").unwrap();

    logflow(dir.path())
        .args(["classify", "curl/8.4.0"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Could not load .env file"));
}

// ============================================================================
// ingest
// ============================================================================

#[test]
fn test_ingest_then_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("rest.2021-03-15.log");
    std::fs::write(&log, LOG).unwrap();

    ingest(dir.path(), &log)
        .assert()
        .success()
        .stdout(predicate::str::contains("imported=2 skipped=1"))
        .stdout(predicate::str::contains("1 ingested"));
    assert!(dir.path().join("out/rest/2021-03.parquet").exists());
    assert!(dir.path().join("out/meta.sqlite").exists());

    ingest(dir.path(), &log)
        .assert()
        .success()
        .stdout(predicate::str::contains("already ingested"));
}

#[test]
fn test_ingest_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    ingest(dir.path(), &dir.path().join("missing.log"))
        .assert()
        .failure()
        .stdout(predicate::str::contains("failed"));
}

#[test]
fn test_ingest_requires_log_input() {
    let dir = tempfile::tempdir().unwrap();
    logflow(dir.path())
        .args(["ingest", "--namespace", "rest"])
        .assert()
        .failure();
}

#[test]
fn test_ingest_glob_with_date_range() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("logs");
    std::fs::create_dir_all(&logs).unwrap();
    std::fs::write(logs.join("rest.2021-03-15.log"), LOG).unwrap();
    std::fs::write(logs.join("rest.2021-04-15.log"), "").unwrap();

    logflow(dir.path())
        .arg("ingest")
        .arg("--log-glob")
        .arg(format!("{}/*.log", logs.display()))
        .args(["--start-date", "2021-03-01", "--end-date", "2021-04-01"])
        .args(["--namespace", "rest", "--json"])
        .arg("--out-dir")
        .arg(dir.path().join("out"))
        .assert()
        .success()
        .stdout(predicate::str::contains("rest.2021-03-15.log"))
        .stdout(predicate::str::contains("rest.2021-04-15.log").not());
}

// ============================================================================
// meta
// ============================================================================

#[test]
fn test_meta_list_and_export() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("rest.2021-03-15.log");
    std::fs::write(&log, LOG).unwrap();
    ingest(dir.path(), &log).assert().success();

    logflow(dir.path())
        .arg("meta")
        .arg("--out-dir")
        .arg(dir.path().join("out"))
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("complete"))
        .stdout(predicate::str::contains("sha256:"));

    let csv = dir.path().join("meta.csv");
    logflow(dir.path())
        .arg("meta")
        .arg("--out-dir")
        .arg(dir.path().join("out"))
        .arg("export")
        .arg("--csv")
        .arg(&csv)
        .assert()
        .success()
        .stdout(predicate::str::contains("exported\t1"));

    let content = std::fs::read_to_string(&csv).unwrap();
    assert!(content.starts_with("namespace,log_path,total_bytes,lines_imported,lines_skipped"));
    assert!(content.contains(",3072,2,1,"));
}

#[test]
fn test_meta_release_without_claim_fails() {
    let dir = tempfile::tempdir().unwrap();
    logflow(dir.path())
        .arg("meta")
        .arg("--out-dir")
        .arg(dir.path().join("out"))
        .arg("release")
        .arg(format!("sha256:{}", "0".repeat(64)))
        .assert()
        .failure()
        .stderr(predicate::str::contains("No pending claim"));
}
