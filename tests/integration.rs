use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let docs = root.join("docs");
    fs::create_dir_all(docs.join("guides")).unwrap();
    fs::write(
        docs.join("alpha.md"),
        "---\ntitle: Alpha Document\n---\n# Alpha\n\nThis is the alpha document about Rust programming and the RETRY_BUDGET setting.\n",
    )
    .unwrap();
    fs::write(
        docs.join("guides/beta.md"),
        "# Beta Guide\n\nThe beta guide builds on [[docs/alpha.md]] and explains deployment.\n",
    )
    .unwrap();

    let config_content = r#"[db]
path = ".resonance/resonance.db"

[corpus]
root = "."
sources = ["docs"]
include_globs = ["**/*.md"]

[embedding]
provider = "disabled"
"#;
    let config_path = root.join("resonance.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_resonance"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run resonance binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run(&config, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Store initialized"));
    assert!(tmp.path().join(".resonance/resonance.db").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (_, _, first) = run(&config, &["init"]);
    let (_, stderr, second) = run(&config, &["init"]);
    assert!(first);
    assert!(second, "second init failed: {}", stderr);
}

#[test]
fn test_validate_writes_report() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run(&config, &["validate"]);
    assert!(success, "validate failed: {}", stderr);
    assert!(stdout.contains("files:   2 (2 valid, 0 skipped)"));
    assert!(stdout.contains("ok"));
    assert!(tmp.path().join(".resonance/pre-flight.json").exists());
}

#[test]
fn test_ingest_then_reingest_skips_everything() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run(&config, &["ingest", "--progress", "off"]);
    assert!(success, "ingest failed: {}", stderr);
    assert!(stdout.contains("ingest done"));
    assert!(stdout.contains("processed: 2  skipped: 0  failed: 0"));

    let (stdout, _, success) = run(&config, &["ingest", "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("processed: 0  skipped: 2  failed: 0"));
}

#[test]
fn test_ingest_json_report() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run(&config, &["ingest", "--json", "--progress", "off"]);
    assert!(success, "ingest failed: {}", stderr);

    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["success"], true);
    assert_eq!(report["state"], "done");
    assert_eq!(report["stats"]["files"], 2);
    assert_eq!(report["stats"]["nodes"], 2);
    assert_eq!(report["preflight"]["valid_files"], 2);
}

#[test]
fn test_ingest_blocked_by_preflight() {
    let (tmp, config) = setup_test_env();
    let content = fs::read_to_string(&config)
        .unwrap()
        .replace(r#"sources = ["docs"]"#, r#"sources = ["nowhere"]"#);
    fs::write(&config, content).unwrap();

    let (_, stderr, success) = run(&config, &["ingest", "--progress", "off"]);
    assert!(!success);
    assert!(stderr.contains("Ingestion blocked"), "{}", stderr);

    let report = fs::read_to_string(tmp.path().join(".resonance/pre-flight.json")).unwrap();
    assert!(report.contains("no_valid_files"));
    assert!(report.contains("missing_source"));
}

#[test]
fn test_grep_resolves_to_nodes() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run(&config, &["ingest", "--progress", "off"]);
    assert!(success, "ingest failed: {}", stderr);

    let (stdout, _, success) = run(&config, &["grep", "retry_budget"]);
    assert!(success);
    assert!(stdout.contains("docs/alpha.md"));
    assert!(stdout.contains("id: docs-alpha"));
}

#[test]
fn test_search_requires_embeddings() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run(&config, &["search", "deployment"]);
    assert!(!success);
    assert!(stderr.contains("requires embeddings"));
}

#[test]
fn test_stats_and_graph() {
    let (_tmp, config) = setup_test_env();
    run(&config, &["ingest", "--progress", "off"]);

    let (stdout, stderr, success) = run(&config, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Nodes:       2"));
    assert!(stdout.contains("Edges:       0"));

    let (stdout, _, success) = run(&config, &["graph", "neighbors", "docs-alpha"]);
    assert!(success);
    assert!(stdout.contains("docs-alpha (degree 0)"));

    let (_, _, success) = run(&config, &["graph", "neighbors", "nope"]);
    assert!(!success);
}
