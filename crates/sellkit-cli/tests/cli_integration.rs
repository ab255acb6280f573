use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use serde_json::Value;

const OFFER: &str = "1736412345678x42";
const PAGE_URL: &str = "https://shop.test/blog/pricing";
const T0: &str = "2026-03-02T09:00:00Z";
const T0_PLUS_1H: &str = "2026-03-02T10:00:00Z";
const T0_PLUS_25H: &str = "2026-03-03T10:00:00Z";

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_sk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_sk"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute sk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_sk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "sk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing boolean field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
    path_str(&path).to_string()
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

fn visit(db: &Path, fixture_name: &str, url: &str, now: &str, steps: &[&str]) -> Value {
    let fixture_path = fixture(fixture_name);
    let mut args = vec![
        "--db", path_str(db), "visit", "--offer", OFFER, "--url", url, "--config-file",
        fixture_path.as_str(), "--now", now,
    ];
    for step in steps {
        args.push("--step");
        args.push(*step);
    }
    let output = run_json(args);
    validate_schema("visit.json", &output);
    output
}

fn init_field<'a>(output: &'a Value, key: &str) -> &'a str {
    let init = output.get("init").unwrap_or_else(|| panic!("missing init in payload: {output}"));
    as_str(init, key)
}

fn events_of_kind(output: &Value, kind: &str) -> usize {
    as_array(output, "events")
        .iter()
        .filter(|event| event.get("kind").and_then(Value::as_str) == Some(kind))
        .count()
}

fn notice_messages(output: &Value) -> Vec<String> {
    as_array(output, "notices")
        .iter()
        .map(|notice| as_str(notice, "message").to_string())
        .collect()
}

fn stored_keys(db: &Path) -> Vec<String> {
    let dump = run_json(["--db", path_str(db), "store", "dump"]);
    validate_schema("store-dump.json", &dump);
    as_array(&dump, "entries").iter().map(|entry| as_str(entry, "key").to_string()).collect()
}

// Test IDs: TCLI-001
#[test]
fn db_commands_cover_migrate_integrity_backup_restore() {
    let sandbox = unique_temp_dir("sellkit-cli-db");
    let db_a = sandbox.join("a.sqlite3");
    let db_b = sandbox.join("b.sqlite3");
    let backup_file = sandbox.join("backup.sqlite3");

    let schema_before = run_json(["--db", path_str(&db_a), "db", "schema-version"]);
    validate_schema("db-schema-version.json", &schema_before);
    assert_eq!(as_i64(&schema_before, "current_version"), 0);

    let dry_run = run_json(["--db", path_str(&db_a), "db", "migrate", "--dry-run"]);
    assert_eq!(as_array(&dry_run, "would_apply_versions").len(), 1);
    let still_before = run_json(["--db", path_str(&db_a), "db", "schema-version"]);
    assert_eq!(as_i64(&still_before, "current_version"), 0);

    let migrate = run_json(["--db", path_str(&db_a), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 1);
    assert!(as_bool(&migrate, "up_to_date"));

    let marked = run_json(["--db", path_str(&db_a), "ledger", "mark", "--offer", OFFER]);
    assert!(as_bool(&marked, "newly_marked"));

    let integrity = run_json(["--db", path_str(&db_a), "db", "integrity-check"]);
    assert!(as_bool(&integrity, "quick_check_ok"));
    assert_eq!(as_i64(&integrity, "unreadable_entries"), 0);

    let backup = run_json(["--db", path_str(&db_a), "db", "backup", "--out", path_str(&backup_file)]);
    assert_eq!(as_str(&backup, "status"), "ok");

    let restore = run_json(["--db", path_str(&db_b), "db", "restore", "--in", path_str(&backup_file)]);
    assert_eq!(as_i64(&restore, "current_version"), 1);
    let status = run_json(["--db", path_str(&db_b), "ledger", "status", "--offer", OFFER]);
    assert!(as_bool(&status, "purchased"));

    let missing = run_sk([
        "--db",
        path_str(&db_b),
        "db",
        "restore",
        "--in",
        path_str(&sandbox.join("missing.sqlite3")),
    ]);
    assert!(!missing.status.success());
}

// Test IDs: TCLI-002
#[test]
fn fresh_visitor_sees_overlay_after_time_trigger() {
    let sandbox = unique_temp_dir("sellkit-cli-fresh");
    let db = sandbox.join("browser.sqlite3");

    let output = visit(&db, "time_offer.yaml", PAGE_URL, T0, &["wait:4", "wait:1"]);
    assert_eq!(init_field(&output, "status"), "ready");
    assert_eq!(init_field(&output, "entry"), "arm_trigger");

    let steps = as_array(&output, "steps");
    assert_eq!(as_str(&steps[0], "surface"), "hidden");
    assert_eq!(as_str(&steps[1], "surface"), "overlay");
    assert_eq!(as_str(&output, "final_surface"), "overlay");
    assert_eq!(events_of_kind(&output, "impression"), 1);

    let keys = stored_keys(&db);
    for expected in [
        "mysellkit_session".to_string(),
        "mysellkit_session_time".to_string(),
        format!("mysellkit_seen_{OFFER}"),
        format!("mysellkit_impression_{OFFER}"),
    ] {
        assert!(keys.contains(&expected), "missing {expected} in {keys:?}");
    }

    let dump = run_json(["--db", path_str(&db), "store", "dump"]);
    for entry in as_array(&dump, "entries") {
        let updated_at = as_str(entry, "updated_at");
        assert!(
            updated_at.starts_with("2026-03-02T09:00:0"),
            "entry should carry simulated write time, got {updated_at}"
        );
    }
}

// Test IDs: TCLI-003
#[test]
fn reload_shows_reminder_and_cooldown_spans_browsing_sessions() {
    let sandbox = unique_temp_dir("sellkit-cli-cooldown");
    let db = sandbox.join("browser.sqlite3");

    let first = visit(&db, "time_offer.yaml", PAGE_URL, T0, &["wait:5"]);
    assert_eq!(as_str(&first, "final_surface"), "overlay");

    let reload = visit(&db, "time_offer.yaml", PAGE_URL, T0, &["wait:30"]);
    assert_eq!(init_field(&reload, "entry"), "show_reminder");
    assert_eq!(as_str(&reload, "final_surface"), "reminder");
    assert_eq!(events_of_kind(&reload, "impression"), 0);

    let ended = run_json(["--db", path_str(&db), "store", "end-session"]);
    assert!(as_i64(&ended, "removed") >= 1);

    let next_session = visit(&db, "time_offer.yaml", PAGE_URL, T0_PLUS_1H, &["wait:30"]);
    assert_eq!(init_field(&next_session, "entry"), "cooldown_active");
    assert_eq!(as_str(&next_session, "final_surface"), "hidden");

    let next_day = visit(&db, "time_offer.yaml", PAGE_URL, T0_PLUS_25H, &["wait:5"]);
    assert_eq!(init_field(&next_day, "entry"), "arm_trigger");
    assert_eq!(as_str(&next_day, "final_surface"), "overlay");
}

// Test IDs: TCLI-004
#[test]
fn checkout_success_round_trip_suppresses_offer() {
    let sandbox = unique_temp_dir("sellkit-cli-success");
    let db = sandbox.join("browser.sqlite3");

    let checkout = visit(&db, "time_offer.yaml", PAGE_URL, T0, &["open", "checkout"]);
    let steps = as_array(&checkout, "steps");
    let outcome = steps[1].get("outcome").unwrap_or_else(|| panic!("missing outcome: {checkout}"));
    assert_eq!(as_str(outcome, "outcome"), "redirected");
    assert!(as_str(outcome, "token").starts_with("pt_"));
    assert_eq!(
        as_array(&checkout, "redirects")[0].as_str(),
        Some("https://checkout.stripe.test/c/pay/cs_test_123")
    );
    assert_eq!(as_str(&checkout, "final_surface"), "hidden");
    assert_eq!(as_str(&checkout, "cta_state"), "loading");
    assert_eq!(events_of_kind(&checkout, "click"), 1);

    let request = &as_array(&checkout, "checkout_requests")[0];
    assert!(as_str(request, "success_url")
        .starts_with("https://mysellkit.com/version-test/payment-processing?token=pt_"));
    assert_eq!(as_str(request, "cancel_url"), format!("{PAGE_URL}?mysellkit_cancelled=true"));
    assert!(stored_keys(&db).contains(&format!("mysellkit_purchase_token_{OFFER}")));

    let returned = visit(
        &db,
        "time_offer.yaml",
        &format!("{PAGE_URL}?utm=mail&mysellkit_success=true"),
        T0,
        &["wait:10", "open"],
    );
    assert_eq!(init_field(&returned, "status"), "suppressed");
    assert_eq!(init_field(&returned, "returned"), "success");
    assert_eq!(as_str(&returned, "final_url"), format!("{PAGE_URL}?utm=mail"));
    assert_eq!(as_str(&returned, "final_surface"), "hidden");
    assert!(!stored_keys(&db).contains(&format!("mysellkit_purchase_token_{OFFER}")));

    let status = run_json(["--db", path_str(&db), "ledger", "status", "--offer", OFFER]);
    assert!(as_bool(&status, "purchased"));

    let later = visit(&db, "time_offer.yaml", PAGE_URL, T0_PLUS_25H, &["wait:5"]);
    assert_eq!(init_field(&later, "status"), "suppressed");
}

// Test IDs: TCLI-005
#[test]
fn cancelled_return_shows_notice_and_reminder() {
    let sandbox = unique_temp_dir("sellkit-cli-cancel");
    let db = sandbox.join("browser.sqlite3");

    let _checkout = visit(&db, "time_offer.yaml", PAGE_URL, T0, &["open", "checkout"]);
    let returned = visit(
        &db,
        "time_offer.yaml",
        &format!("{PAGE_URL}?mysellkit_cancelled=true"),
        T0,
        &[],
    );
    assert_eq!(init_field(&returned, "status"), "ready");
    assert_eq!(init_field(&returned, "returned"), "cancelled");
    assert_eq!(as_str(&returned, "final_surface"), "reminder");
    assert_eq!(as_str(&returned, "final_url"), PAGE_URL);
    assert!(notice_messages(&returned)
        .contains(&"Payment was not completed. You can try again anytime!".to_string()));

    let status = run_json(["--db", path_str(&db), "ledger", "status", "--offer", OFFER]);
    assert!(!as_bool(&status, "purchased"));
}

// Test IDs: TCLI-006
#[test]
fn draft_offer_aborts_unless_diagnostic() {
    let sandbox = unique_temp_dir("sellkit-cli-draft");
    let db = sandbox.join("browser.sqlite3");

    let aborted = visit(&db, "draft_offer.yaml", PAGE_URL, T0, &["scroll:900:2000:1000"]);
    assert_eq!(init_field(&aborted, "status"), "aborted");
    let reason = aborted
        .get("init")
        .and_then(|init| init.get("reason"))
        .unwrap_or_else(|| panic!("missing abort reason: {aborted}"));
    assert_eq!(as_str(reason, "code"), "not_live");
    assert_eq!(as_array(&aborted, "events").len(), 0);

    let diagnostic = visit(
        &db,
        "draft_offer.yaml",
        &format!("{PAGE_URL}?debug=true"),
        T0,
        &["scroll:500:2000:1000", "checkout"],
    );
    assert_eq!(init_field(&diagnostic, "status"), "ready");
    assert!(as_bool(diagnostic.get("diagnostic").unwrap_or(&Value::Null), "enabled"));
    let steps = as_array(&diagnostic, "steps");
    assert_eq!(as_str(&steps[0], "surface"), "overlay");
    let checkout = steps[1].get("outcome").unwrap_or_else(|| panic!("missing outcome: {diagnostic}"));
    assert_eq!(as_str(checkout, "outcome"), "not_live");
    assert!(notice_messages(&diagnostic)
        .contains(&"This product is in draft mode. Checkout is disabled.".to_string()));
    assert!(as_array(&diagnostic, "redirects").is_empty());

    let keys = stored_keys(&db);
    assert!(!keys.iter().any(|key| key.starts_with("mysellkit_seen_")), "diagnostic wrote {keys:?}");
}

// Test IDs: TCLI-007
#[test]
fn declined_checkout_restores_call_to_action() {
    let sandbox = unique_temp_dir("sellkit-cli-declined");
    let db = sandbox.join("browser.sqlite3");

    let output = visit(&db, "declined_checkout.yaml", PAGE_URL, T0, &["wait:60", "open", "checkout"]);
    assert_eq!(init_field(&output, "entry"), "awaiting_manual");
    let steps = as_array(&output, "steps");
    assert_eq!(as_str(&steps[0], "surface"), "hidden");
    assert_eq!(as_str(&steps[1], "surface"), "overlay");
    let outcome = steps[2].get("outcome").unwrap_or_else(|| panic!("missing outcome: {output}"));
    assert_eq!(as_str(outcome, "outcome"), "failed");
    assert_eq!(as_str(outcome, "message"), "Unable to start checkout. Offer sold out.");
    assert_eq!(as_str(&output, "cta_state"), "idle");
    assert_eq!(as_str(&output, "final_surface"), "overlay");
    assert!(as_array(&output, "redirects").is_empty());
    assert!(!stored_keys(&db).contains(&format!("mysellkit_purchase_token_{OFFER}")));
}

// Test IDs: TCLI-008
#[test]
fn identity_show_reuses_fresh_session_and_isolates_diagnostic_ids() {
    let sandbox = unique_temp_dir("sellkit-cli-identity");
    let db = sandbox.join("browser.sqlite3");

    let first = run_json(["--db", path_str(&db), "identity", "show", "--now", T0]);
    validate_schema("identity-show.json", &first);
    assert!(!as_bool(&first, "reused"));

    let second = run_json(["--db", path_str(&db), "identity", "show", "--now", T0_PLUS_1H]);
    assert!(as_bool(&second, "reused"));
    assert_eq!(as_str(&first, "session_id"), as_str(&second, "session_id"));

    let expired = run_json(["--db", path_str(&db), "identity", "show", "--now", T0_PLUS_25H]);
    assert!(!as_bool(&expired, "reused"));
    assert_ne!(as_str(&first, "session_id"), as_str(&expired, "session_id"));

    let diagnostic =
        run_json(["--db", path_str(&db), "identity", "show", "--diagnostic", "--now", T0_PLUS_25H]);
    validate_schema("identity-show.json", &diagnostic);
    assert!(as_str(&diagnostic, "session_id").starts_with("msk_debug_"));
    let stored = diagnostic.get("stored").unwrap_or_else(|| panic!("missing stored: {diagnostic}"));
    assert_eq!(as_str(stored, "id"), as_str(&expired, "session_id"));
}

// Test IDs: TCLI-009
#[test]
fn invalid_inputs_fail_without_json() {
    let sandbox = unique_temp_dir("sellkit-cli-invalid");
    let db = sandbox.join("browser.sqlite3");

    let bad_step = run_sk([
        "--db",
        path_str(&db),
        "visit",
        "--offer",
        OFFER,
        "--url",
        PAGE_URL,
        "--config-file",
        fixture("time_offer.yaml").as_str(),
        "--step",
        "hover:10",
    ]);
    assert!(!bad_step.status.success());

    let no_backend = run_sk(["--db", path_str(&db), "visit", "--offer", OFFER, "--url", PAGE_URL]);
    assert!(!no_backend.status.success());

    let bad_offer = run_sk(["--db", path_str(&db), "ledger", "status", "--offer", "has space"]);
    assert!(!bad_offer.status.success());
}
