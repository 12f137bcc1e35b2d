use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_db() -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    std::env::temp_dir().join(format!("releasehistory-cli-{now}.sqlite3"))
}

fn run_rh<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_rh"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rh binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rh(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "rh command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn history_data(value: &Value) -> &Vec<Value> {
    value
        .get("data")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing data array in feed: {value}"))
}

fn event_action<'a>(item: &'a Value) -> &'a str {
    item.get("payload")
        .and_then(|payload| payload.get("action"))
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing payload.action in item: {item}"))
}

#[test]
fn cli_seeds_and_pages_a_release_history() {
    let db = unique_temp_db();
    let db_arg = path_str(&db).to_string();

    let migrate = run_json(["--db", &db_arg, "db", "migrate"]);
    assert_eq!(migrate.get("after_version").and_then(Value::as_i64), Some(1));

    let release = run_json([
        "--db",
        &db_arg,
        "seed",
        "release",
        "--creation-time",
        "2023-11-14T22:13:20Z",
    ]);
    let release_id = as_str(&release, "release_id").to_string();

    let _user = run_json([
        "--db",
        &db_arg,
        "seed",
        "user",
        "--username",
        "ann",
        "--display-name",
        "Ann",
    ]);

    let _approval = run_json([
        "--db",
        &db_arg,
        "seed",
        "approval-audit",
        "--release-id",
        &release_id,
        "--action",
        "create",
        "--approver",
        "ann",
        "--actor",
        "maintainer",
        "--at",
        "2023-11-14T22:13:21Z",
    ]);

    let _run = run_json([
        "--db",
        &db_arg,
        "seed",
        "run-audit",
        "--release-id",
        &release_id,
        "--run-number",
        "1",
        "--result",
        "green",
        "--actor",
        "runner",
        "--at",
        "2023-11-14T22:13:22Z",
    ]);

    let _comment = run_json([
        "--db",
        &db_arg,
        "seed",
        "comment",
        "--release-id",
        &release_id,
        "--content",
        "ship it",
        "--author",
        "commenter",
        "--at",
        "2023-11-14T22:13:23Z",
    ]);

    let first = run_json([
        "--db",
        &db_arg,
        "history",
        "--release-id",
        &release_id,
        "--items",
        "2",
        "--sort-order",
        "asc",
    ]);
    let first_data = history_data(&first);
    assert_eq!(first_data.len(), 2);
    assert_eq!(event_action(&first_data[0]), "added Ann");
    assert_eq!(
        event_action(&first_data[1]),
        "run 1 succeeded with status GREEN and automatically resolved its findings"
    );

    // 2023-11-14T22:13:22Z is 1_700_000_002_000 epoch milliseconds; the
    // next-page cursor sits one millisecond past the last retained item.
    let next = first
        .get("links")
        .and_then(|links| links.get("next"))
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing links.next in feed: {first}"));
    assert!(next.ends_with("lastTimestamp=1700000002001"), "unexpected next link: {next}");

    let second = run_json([
        "--db",
        &db_arg,
        "history",
        "--release-id",
        &release_id,
        "--items",
        "2",
        "--sort-order",
        "asc",
        "--last-timestamp",
        "1700000002001",
    ]);
    let second_data = history_data(&second);
    assert_eq!(second_data.len(), 1);
    assert_eq!(second_data[0].get("kind").and_then(Value::as_str), Some("comment"));
    assert_eq!(
        second_data[0]
            .get("payload")
            .and_then(|payload| payload.get("content"))
            .and_then(Value::as_str),
        Some("ship it")
    );

    let status = run_json(["--db", &db_arg, "db", "schema-version"]);
    assert_eq!(status.get("current_version").and_then(Value::as_i64), Some(1));

    let _ = std::fs::remove_file(&db);
}

#[test]
fn cli_surfaces_override_events_with_comment_fallback() {
    let db = unique_temp_db();
    let db_arg = path_str(&db).to_string();

    let release = run_json([
        "--db",
        &db_arg,
        "seed",
        "release",
        "--creation-time",
        "2023-11-14T22:13:20Z",
    ]);
    let release_id = as_str(&release, "release_id").to_string();

    // A deliberately stale comment id: the referenced comment never exists.
    let _override = run_json([
        "--db",
        &db_arg,
        "seed",
        "override-audit",
        "--release-id",
        &release_id,
        "--action",
        "create",
        "--chapter",
        "1",
        "--requirement",
        "2",
        "--check",
        "3",
        "--original-color",
        "red",
        "--manual-color",
        "green",
        "--comment-id",
        "01ARZ3NDEKTSV4RRFFQ69G5FAV",
        "--actor",
        "overrider",
        "--at",
        "2023-11-14T22:13:25Z",
    ]);

    let feed = run_json([
        "--db",
        &db_arg,
        "history",
        "--release-id",
        &release_id,
        "--sort-order",
        "asc",
    ]);
    let data = history_data(&feed);
    assert_eq!(data.len(), 1);
    assert_eq!(event_action(&data[0]), "added a manual color override");
    let payload = &data[0]["payload"];
    assert_eq!(
        payload.get("comment").and_then(Value::as_str),
        Some("comment not available anymore")
    );
    assert_eq!(payload.get("previous_color").and_then(Value::as_str), Some("RED"));
    assert_eq!(payload.get("new_color").and_then(Value::as_str), Some("GREEN"));

    let _ = std::fs::remove_file(&db);
}

#[test]
fn cli_rejects_unknown_release_and_bad_parameters() {
    let db = unique_temp_db();
    let db_arg = path_str(&db).to_string();

    let _ = run_json(["--db", &db_arg, "db", "migrate"]);

    let unknown = run_rh([
        "--db",
        &db_arg,
        "history",
        "--release-id",
        "01ARZ3NDEKTSV4RRFFQ69G5FAV",
    ]);
    assert!(!unknown.status.success());
    let stderr = String::from_utf8_lossy(&unknown.stderr);
    assert!(stderr.contains("not found"), "unexpected stderr: {stderr}");

    let bad_id = run_rh(["--db", &db_arg, "history", "--release-id", "not-a-ulid"]);
    assert!(!bad_id.status.success());

    let _ = std::fs::remove_file(&db);
}
