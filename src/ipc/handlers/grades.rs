use serde_json::{json, Value};

use crate::error::ServiceError;
use crate::grades::{
    self, GradePatch, GradeSubmission, OverviewQuery, StatusFilters, SubjectPatch,
    SubjectSubmission,
};
use crate::ipc::error::{ok, respond};
use crate::ipc::params::Fields;
use crate::ipc::types::{AppState, Request};
use crate::store::{GradeStatus, GradeUpdate, GroupUpdate};

const STATUSES: &[&str] = &["input_complete", "draft", "not_entered"];

fn status_field(f: &mut Fields<'_>, required: bool) -> Option<GradeStatus> {
    let raw = if required {
        f.required_choice("gradeStatus", STATUSES)
    } else {
        f.optional_choice("gradeStatus", STATUSES)
    }?;
    GradeStatus::parse(&raw)
}

fn timestamp_field(f: &mut Fields<'_>, required: bool) -> Option<String> {
    let raw = if required {
        f.required_str("updatedAt")
    } else {
        f.optional_str("updatedAt")
    }?;
    let normalized = grades::normalize_timestamp(&raw);
    if normalized.is_none() {
        f.push("updatedAt", "must be an RFC 3339 timestamp or YYYY-MM-DD date");
    }
    normalized
}

fn parse_submission(params: &Value) -> Result<GradeSubmission, ServiceError> {
    let mut f = Fields::new(params);
    let student_id = f.required_label("studentId");
    let grade = f.required_label("grade");
    let semester = f.required_label("semester");
    let status = status_field(&mut f, true);
    let updated_at = timestamp_field(&mut f, true);

    let mut subjects = Vec::new();
    if let Some(items) = f.required_array("subjects") {
        if items.is_empty() {
            f.push("subjects", "at least one subject is required");
        }
        for (i, item) in items.iter().enumerate() {
            let mut s = f.nested(item, format!("subjects[{i}]"));
            let subject = s.required_str("subject");
            let credits = s.required_positive_i64("credits");
            let midterm = s.required_f64("midterm");
            let final_score = s.required_f64("final");
            let performance = s.required_f64("performance");
            let total_score = s.required_f64("totalScore");
            if let Some(name) = &subject {
                if subjects.iter().any(|x: &SubjectSubmission| &x.subject == name) {
                    s.push("subject", "duplicate subject in submission");
                }
            }
            if let (
                Some(subject),
                Some(credits),
                Some(midterm),
                Some(final_score),
                Some(performance),
                Some(total_score),
            ) = (subject, credits, midterm, final_score, performance, total_score)
            {
                if s.is_clean() {
                    subjects.push(SubjectSubmission {
                        subject,
                        credits,
                        midterm,
                        final_score,
                        performance,
                        total_score,
                    });
                }
            }
            f.absorb(s);
        }
    }
    f.finish()?;

    match (student_id, grade, semester, status, updated_at) {
        (Some(student_id), Some(grade), Some(semester), Some(status), Some(updated_at)) => {
            Ok(GradeSubmission {
                student_id,
                grade,
                semester,
                status,
                updated_at,
                subjects,
            })
        }
        _ => Err(ServiceError::invalid_field("params", "incomplete submission")),
    }
}

fn parse_patch(params: &Value) -> Result<GradePatch, ServiceError> {
    let mut f = Fields::new(params);
    let student_id = f.required_label("studentId");
    let status = status_field(&mut f, false);
    let updated_at = timestamp_field(&mut f, false);

    let subjects = f.optional_array("subjects").map(|items| {
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let mut s = f.nested(item, format!("subjects[{i}]"));
            let subject = s.required_str("subject");
            let update = GradeUpdate {
                credits: s.optional_positive_i64("credits"),
                midterm: s.optional_f64("midterm"),
                final_score: s.optional_f64("final"),
                performance: s.optional_f64("performance"),
                total_score: s.optional_f64("totalScore"),
            };
            if let Some(subject) = subject {
                out.push(SubjectPatch { subject, update });
            }
            f.absorb(s);
        }
        out
    });
    f.finish()?;

    let student_id =
        student_id.ok_or_else(|| ServiceError::invalid_field("studentId", "required"))?;
    Ok(GradePatch {
        student_id,
        group: GroupUpdate { status, updated_at },
        subjects,
    })
}

fn handle_overview(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let student_id = f.required_label("studentId");
    let grade = f.optional_label("grade");
    let semester = f.optional_label("semester");
    f.finish()?;
    let query = OverviewQuery {
        student_id: student_id.unwrap_or_default(),
        grade,
        semester,
    };
    let conn = state.conn()?;
    grades::overview(conn, state.cache.as_ref(), state.ttl(), &query)
}

fn handle_submit(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let submission = parse_submission(params)?;
    let conn = state.conn()?;
    grades::submit(conn, state.cache.as_ref(), &submission)
}

fn handle_patch(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let patch = parse_patch(params)?;
    let conn = state.conn()?;
    grades::patch(conn, state.cache.as_ref(), &patch)
}

fn handle_management_status(state: &mut AppState, params: &Value) -> Result<Value, ServiceError> {
    let mut f = Fields::new(params);
    let filters = StatusFilters {
        grade: f.optional_label("grade"),
        class: f.optional_label("class"),
        semester: f.optional_label("semester"),
    };
    f.finish()?;
    let conn = state.conn()?;
    grades::management_status(
        conn,
        state.cache.as_ref(),
        state.ttl(),
        &state.config.grades.input_period,
        &filters,
    )
}

fn handle_input_period(state: &mut AppState, req: &Request) -> Value {
    let period = &state.config.grades.input_period;
    ok(
        &req.id,
        json!({ "semesterPeriod": { "start": period.start, "end": period.end } }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "grades.overview" => handle_overview(state, &req.params),
        "grades.submit" => handle_submit(state, &req.params),
        "grades.patch" => handle_patch(state, &req.params),
        "grades.managementStatus" => handle_management_status(state, &req.params),
        "grades.inputPeriod" => return Some(handle_input_period(state, req)),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_errors_are_itemized_per_subject() {
        let params = json!({
            "studentId": "s1",
            "grade": "1",
            "semester": 1,
            "gradeStatus": "finished",
            "updatedAt": "not a date",
            "subjects": [
                { "subject": "Math", "credits": 3, "midterm": 90, "final": 90, "performance": 90, "totalScore": 90 },
                { "subject": "Math", "credits": 0, "midterm": 90, "final": 90, "performance": 90, "totalScore": "A" },
            ],
        });
        let err = parse_submission(&params).unwrap_err();
        assert_eq!(err.code(), "bad_params");
        let details = err.details().expect("details");
        let fields: Vec<&str> = details["errors"]
            .as_array()
            .expect("errors")
            .iter()
            .filter_map(|e| e["field"].as_str())
            .collect();
        assert_eq!(
            fields,
            vec![
                "gradeStatus",
                "updatedAt",
                "subjects[1].credits",
                "subjects[1].totalScore",
                "subjects[1].subject",
            ]
        );
    }

    #[test]
    fn valid_submission_normalizes_timestamp() {
        let params = json!({
            "studentId": "s1",
            "grade": "1학년",
            "semester": "1",
            "gradeStatus": "draft",
            "updatedAt": "2025-05-02",
            "subjects": [
                { "subject": "Math", "credits": 3, "midterm": 90, "final": 88.5, "performance": 91, "totalScore": 90 },
            ],
        });
        let s = parse_submission(&params).expect("valid");
        assert_eq!(s.updated_at, "2025-05-02T00:00:00Z");
        assert_eq!(s.status, GradeStatus::Draft);
        assert_eq!(s.subjects[0].final_score, 88.5);
    }

    #[test]
    fn empty_subject_list_is_rejected() {
        let params = json!({
            "studentId": "s1", "grade": "1", "semester": "1",
            "gradeStatus": "draft", "updatedAt": "2025-05-02", "subjects": [],
        });
        let err = parse_submission(&params).unwrap_err();
        assert_eq!(err.details().expect("details")["errors"][0]["field"], "subjects");
    }

    #[test]
    fn patch_keeps_only_provided_fields() {
        let params = json!({
            "studentId": "s1",
            "subjects": [{ "subject": "Math", "totalScore": 95 }],
        });
        let p = parse_patch(&params).expect("patch");
        assert!(p.group.is_empty());
        let subjects = p.subjects.expect("subjects");
        assert_eq!(subjects[0].update.total_score, Some(95.0));
        assert_eq!(subjects[0].update.credits, None);
    }
}
