mod test_support;

use serde_json::json;
use test_support::Sidecar;

#[test]
fn health_reports_version_and_workspace() {
    let mut s = Sidecar::spawn(&[]);
    let h = s.ok("health", json!({}));
    assert_eq!(h["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(h["workspacePath"], serde_json::Value::Null);
    assert_eq!(h["cacheTtlSecs"], 300);

    let path = s.workspace.path().to_string_lossy().to_string();
    s.ok("workspace.select", json!({ "path": path }));
    let h = s.ok("health", json!({}));
    assert_eq!(h["workspacePath"], path.as_str());
}

#[test]
fn malformed_lines_and_unknown_methods_get_error_envelopes() {
    let mut s = Sidecar::spawn(&[]);
    let r = s.send_raw("{not json");
    assert_eq!(r["ok"], false);
    assert_eq!(r["id"], "");
    assert_eq!(r["error"]["code"], "bad_json");

    let e = s.fail("grades.explode", json!({}));
    assert_eq!(e["code"], "not_implemented");

    let e = s.fail("workspace.select", json!({}));
    assert_eq!(e["code"], "bad_params");

    // The daemon keeps serving after errors.
    s.ok("health", json!({}));
}

#[test]
fn data_methods_need_a_workspace() {
    let mut s = Sidecar::spawn(&[]);
    for method in ["students.list", "grades.overview", "classrooms.list"] {
        let e = s.fail(method, json!({ "studentId": "x" }));
        assert_eq!(e["code"], "no_workspace", "{method}");
        assert_eq!(e["status"], 409);
    }
}

#[test]
fn environment_configures_workspace_and_input_period() {
    let preset = tempfile::tempdir().expect("tempdir");
    let preset_path = preset.path().to_string_lossy().to_string();
    let mut s = Sidecar::spawn(&[
        ("SCHOOLD_WORKSPACE", preset_path.as_str()),
        ("SCHOOLD_GRADES__INPUT_PERIOD__START", "2026-03-02"),
        ("SCHOOLD_GRADES__INPUT_PERIOD__END", "2026-04-10"),
    ]);

    let h = s.ok("health", json!({}));
    assert_eq!(h["workspacePath"], preset_path.as_str());
    assert!(preset.path().join("school.sqlite3").exists());

    let period = s.ok("grades.inputPeriod", json!({}));
    assert_eq!(
        period["semesterPeriod"],
        json!({ "start": "2026-03-02", "end": "2026-04-10" })
    );
    let status = s.ok("grades.managementStatus", json!({}));
    assert_eq!(status["semesterPeriod"]["end"], "2026-04-10");
    assert_eq!(status["students"], json!([]));
}

#[test]
fn switching_workspace_drops_cached_results() {
    let mut s = Sidecar::start();
    s.ok("classrooms.create", json!({ "grade": 1, "classNumber": 1 }));
    let list = s.ok("students.list", json!({}));
    assert_eq!(list["students"], json!([]));

    let other = tempfile::tempdir().expect("tempdir");
    s.ok(
        "workspace.select",
        json!({ "path": other.path().to_string_lossy() }),
    );
    let rooms = s.ok("classrooms.list", json!({}));
    assert_eq!(rooms["classrooms"], json!([]));
    let list = s.ok("students.list", json!({}));
    assert_eq!(list["students"], json!([]));
}
