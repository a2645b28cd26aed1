// ABOUTME: Tests running the table-cloner binary end to end
// ABOUTME: Argument validation, job files and a full SQLite clone

use rusqlite::Connection;
use std::process::Command;
use tempfile::tempdir;

fn bin() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_table-cloner"));
    command
        .env_remove("SOURCE_URL")
        .env_remove("TARGET_URL")
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1");
    command
}

fn seed(path: &std::path::Path, rows: i64) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)")
        .unwrap();
    for i in 0..rows {
        conn.execute(
            "INSERT INTO items VALUES (?1, ?2)",
            rusqlite::params![i, format!("item-{}", i)],
        )
        .unwrap();
    }
}

#[test]
fn test_help_lists_subcommands() {
    let output = bin().arg("--help").output().expect("Failed to execute command");
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("clone"));
    assert!(stdout.contains("ddl"));
}

#[test]
fn test_identical_source_and_target_is_rejected() {
    let temp_dir = tempdir().unwrap();
    let db = temp_dir.path().join("same.db");
    seed(&db, 1);
    let url = format!("sqlite://{}", db.display());

    let output = bin()
        .args(["clone", "--source", &url, "--target", &url])
        .args(["--source-object", "items"])
        .output()
        .expect("Failed to execute command");
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("Source and target are the same object"));
}

#[test]
fn test_missing_source_name_is_rejected() {
    let output = bin()
        .args(["clone", "--source", "sqlite://a.db", "--target", "sqlite://b.db"])
        .output()
        .expect("Failed to execute command");
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("Specify object name for source object"));
}

#[test]
fn test_missing_target_url_is_reported() {
    let output = bin()
        .args(["clone", "--source", "sqlite://a.db", "--source-object", "items"])
        .output()
        .expect("Failed to execute command");
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("No target connection string"));
}

#[test]
fn test_clone_and_ddl_with_job_file() {
    let temp_dir = tempdir().unwrap();
    let source = temp_dir.path().join("source.db");
    let target = temp_dir.path().join("target.db");
    seed(&source, 130);

    let job = temp_dir.path().join("job.toml");
    std::fs::write(
        &job,
        format!(
            "[source]\nurl = \"sqlite://{}\"\nname = \"items\"\n\n\
             [target]\nurl = \"sqlite://{}\"\n\n\
             [target.options]\ncreate_if_not_exists = true\n",
            source.display(),
            target.display()
        ),
    )
    .unwrap();

    let output = bin()
        .args(["ddl", "--config", job.to_str().unwrap()])
        .output()
        .expect("Failed to execute command");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("CREATE TABLE \"ITEMS\" (id INTEGER PRIMARY KEY, label TEXT)"));

    let output = bin()
        .args(["clone", "--config", job.to_str().unwrap()])
        .output()
        .expect("Failed to execute command");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "{}", stderr);
    assert!(stdout.contains("Rows copied: 130"));
    assert!(stderr.contains("130 rows processed"));
    assert!(stderr.contains("ISSUING 'INSERT INTO main.items VALUES(?1, ?2)'"));

    let copied: i64 = Connection::open(&target)
        .unwrap()
        .query_row("SELECT count(*) FROM items", [], |r| r.get(0))
        .unwrap();
    assert_eq!(copied, 130);
}
