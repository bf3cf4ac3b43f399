#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tempfile::TempDir;

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
    pub workspace: TempDir,
}

impl Sidecar {
    /// Spawn the daemon and select a fresh temporary workspace.
    pub fn start() -> Self {
        let mut s = Self::spawn(&[]);
        let path = s.workspace.path().to_string_lossy().to_string();
        s.ok("workspace.select", json!({ "path": path }));
        s
    }

    /// Spawn without selecting a workspace; `env` is applied to the child.
    pub fn spawn(env: &[(&str, &str)]) -> Self {
        let workspace = tempfile::tempdir().expect("tempdir");
        let exe = env!("CARGO_BIN_EXE_schoold");
        let mut cmd = Command::new(exe);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .current_dir(workspace.path())
            .env_remove("SCHOOLD_WORKSPACE")
            .env_remove("SCHOOLD_CONFIG_FILE");
        for (k, v) in env {
            cmd.env(k, v);
        }
        let mut child = cmd.spawn().expect("spawn schoold");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
            workspace,
        }
    }

    pub fn send_raw(&mut self, line: &str) -> Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {line}");
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    /// Request that must succeed; returns `result`.
    pub fn ok(&mut self, method: &str, params: Value) -> Value {
        let resp = self.request(method, params);
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{method} failed: {resp}"
        );
        resp.get("result").cloned().unwrap_or(Value::Null)
    }

    /// Request that must fail; returns `error`.
    pub fn fail(&mut self, method: &str, params: Value) -> Value {
        let resp = self.request(method, params);
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{method} unexpectedly succeeded: {resp}"
        );
        resp.get("error").cloned().unwrap_or(Value::Null)
    }

    pub fn sql(&self, sql: &str) {
        let conn = rusqlite::Connection::open(self.workspace.path().join("school.sqlite3"))
            .expect("open workspace db");
        conn.execute_batch(sql).expect("execute sql");
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn classroom(s: &mut Sidecar, grade: i64, class_number: i64) -> String {
    let r = s.ok(
        "classrooms.create",
        json!({ "grade": grade, "classNumber": class_number }),
    );
    r["classroomId"].as_str().expect("classroomId").to_string()
}

pub fn subject(s: &mut Sidecar, name: &str) -> String {
    let r = s.ok("subjects.create", json!({ "name": name }));
    r["subjectId"].as_str().expect("subjectId").to_string()
}

pub fn teacher(s: &mut Sidecar, username: &str, name: &str) -> String {
    let r = s.ok(
        "users.register",
        json!({
            "username": username,
            "password": "pass1234",
            "role": "teacher",
            "name": name,
            "phone": "010-1111-2222",
        }),
    );
    r["profileId"].as_str().expect("profileId").to_string()
}

pub fn student(
    s: &mut Sidecar,
    username: &str,
    name: &str,
    student_no: &str,
    number: i64,
    classroom_id: Option<&str>,
) -> String {
    let r = s.ok(
        "users.register",
        json!({
            "username": username,
            "password": "pass1234",
            "role": "student",
            "name": name,
            "phone": "010-3333-4444",
            "profile": {
                "studentNo": student_no,
                "number": number,
                "classroomId": classroom_id,
            },
        }),
    );
    r["profileId"].as_str().expect("profileId").to_string()
}

pub fn submit_scores(s: &mut Sidecar, student_id: &str, updated_at: &str, math: f64, english: f64) {
    s.ok(
        "grades.submit",
        json!({
            "studentId": student_id,
            "grade": "1",
            "semester": "1",
            "gradeStatus": "input_complete",
            "updatedAt": updated_at,
            "subjects": [
                { "subject": "Math", "credits": 3, "midterm": math, "final": math, "performance": math, "totalScore": math },
                { "subject": "English", "credits": 2, "midterm": english, "final": english, "performance": english, "totalScore": english },
            ],
        }),
    );
}
