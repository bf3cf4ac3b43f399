mod test_support;

use serde_json::json;
use test_support::{classroom, student, teacher, Sidecar};

#[test]
fn registering_each_role_creates_a_profile() {
    let mut s = Sidecar::start();
    let room = classroom(&mut s, 2, 3);

    let t = s.ok(
        "users.register",
        json!({
            "username": "kim.t",
            "password": "teach-pass",
            "role": "teacher",
            "name": "Kim Teacher",
            "phone": "010-0000-0001",
            "email": "kim@school.example",
        }),
    );
    assert_eq!(t["role"], "teacher");
    assert!(t["profileId"].is_string());

    let child = student(&mut s, "stu1", "Han Bit", "20240011", 7, Some(&room));
    let p = s.ok(
        "users.register",
        json!({
            "username": "han.mom",
            "password": "parent-pass",
            "role": "parent",
            "name": "Han Mother",
            "phone": "010-0000-0002",
            "birthDate": "1980-04-12",
            "profile": { "children": [{ "studentId": child, "relation": "mother" }] },
        }),
    );

    let user = s.ok("users.get", json!({ "userId": p["userId"] }));
    assert_eq!(user["username"], "han.mom");
    assert_eq!(user["role"], "parent");
    assert_eq!(user["birthDate"], "1980-04-12");
    assert_eq!(user["approvalStatus"], "pending");
    assert_eq!(user["isActive"], true);
    assert_eq!(user["profileId"], p["profileId"]);

    let detail = s.ok("students.get", json!({ "studentId": child }));
    assert_eq!(detail["motherName"], "Han Mother");
    assert_eq!(detail["fatherName"], serde_json::Value::Null);
    assert_eq!(detail["grade"], 2);
    assert_eq!(detail["classNumber"], 3);
}

#[test]
fn duplicates_and_dangling_references_are_rejected() {
    let mut s = Sidecar::start();
    teacher(&mut s, "dup", "First");

    let e = s.fail(
        "users.register",
        json!({
            "username": "dup",
            "password": "another-pass",
            "role": "teacher",
            "name": "Second",
            "phone": "010",
        }),
    );
    assert_eq!(e["code"], "conflict");
    assert_eq!(e["status"], 409);

    student(&mut s, "s1", "One", "20240001", 1, None);
    let e = s.fail(
        "users.register",
        json!({
            "username": "s2",
            "password": "pass1234",
            "role": "student",
            "name": "Two",
            "phone": "010",
            "profile": { "studentNo": "20240001", "number": 2 },
        }),
    );
    assert_eq!(e["code"], "conflict");

    let e = s.fail(
        "users.register",
        json!({
            "username": "s3",
            "password": "pass1234",
            "role": "student",
            "name": "Three",
            "phone": "010",
            "profile": { "studentNo": "20240003", "number": 3, "classroomId": "nowhere" },
        }),
    );
    assert_eq!(e["code"], "not_found");

    let e = s.fail(
        "users.register",
        json!({
            "username": "orphan.dad",
            "password": "pass1234",
            "role": "parent",
            "name": "Dad",
            "phone": "010",
            "profile": { "children": [{ "studentId": "ghost", "relation": "father" }] },
        }),
    );
    assert_eq!(e["code"], "not_found");
    let e = s.fail("users.get", json!({ "userId": "ghost" }));
    assert_eq!(e["code"], "not_found");
}

#[test]
fn registration_validation_lists_every_bad_field() {
    let mut s = Sidecar::start();
    let e = s.fail(
        "users.register",
        json!({
            "username": "  ",
            "password": "short",
            "role": "janitor",
            "phone": "010",
            "birthDate": "12/04/1980",
        }),
    );
    assert_eq!(e["code"], "bad_params");
    let fields: Vec<&str> = e["details"]["errors"]
        .as_array()
        .expect("errors")
        .iter()
        .filter_map(|x| x["field"].as_str())
        .collect();
    for expected in ["username", "password", "role", "name", "birthDate"] {
        assert!(fields.contains(&expected), "missing {expected} in {fields:?}");
    }
}

#[test]
fn update_and_password_change() {
    let mut s = Sidecar::start();
    let r = s.ok(
        "users.register",
        json!({
            "username": "lee",
            "password": "original-pass",
            "role": "teacher",
            "name": "Lee",
            "phone": "010",
        }),
    );
    let user_id = r["userId"].as_str().expect("userId").to_string();

    let updated = s.ok(
        "users.update",
        json!({ "userId": user_id, "name": "Lee Updated", "approvalStatus": "approved", "isActive": false }),
    );
    assert_eq!(updated["name"], "Lee Updated");
    assert_eq!(updated["approvalStatus"], "approved");
    assert_eq!(updated["isActive"], false);

    let e = s.fail("users.update", json!({ "userId": user_id, "role": "parent" }));
    assert_eq!(e["code"], "bad_params");

    let e = s.fail(
        "users.changePassword",
        json!({ "userId": user_id, "currentPassword": "wrong-pass", "newPassword": "next-pass-1" }),
    );
    assert_eq!(e["code"], "unauthorized");
    assert_eq!(e["status"], 401);

    s.ok(
        "users.changePassword",
        json!({ "userId": user_id, "currentPassword": "original-pass", "newPassword": "next-pass-1" }),
    );
    let e = s.fail(
        "users.changePassword",
        json!({ "userId": user_id, "currentPassword": "original-pass", "newPassword": "third-pass" }),
    );
    assert_eq!(e["code"], "unauthorized");
    s.ok(
        "users.changePassword",
        json!({ "userId": user_id, "currentPassword": "next-pass-1", "newPassword": "third-pass" }),
    );
}
