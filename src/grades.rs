use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

use crate::cache::{self, keys, Cache};
use crate::calc::{self, RadarChart, SubjectInput, SubjectResult, SubjectScores};
use crate::config::InputPeriod;
use crate::error::ServiceError;
use crate::store::{GradeStatus, GradeUpdate, GroupUpdate, NewGrade, NewGradeGroup, Store};

pub const GRADE_LABEL_SUFFIX: &str = "학년";
pub const SEMESTER_LABEL_SUFFIX: &str = "학기";

fn with_suffix(raw: &str, suffix: &str) -> String {
    let t = raw.trim();
    if t.contains(suffix) {
        t.to_string()
    } else {
        format!("{t}{suffix}")
    }
}

/// `"1"` -> `"1학년"`; labels that already carry the suffix are kept.
pub fn grade_label(raw: &str) -> String {
    with_suffix(raw, GRADE_LABEL_SUFFIX)
}

pub fn semester_label(raw: &str) -> String {
    with_suffix(raw, SEMESTER_LABEL_SUFFIX)
}

/// Accepts RFC 3339, naive `YYYY-MM-DDTHH:MM:SS` (taken as UTC) or a bare
/// date, and returns the stored UTC form.
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    let t = raw.trim();
    let parsed: DateTime<Utc> = if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        dt.with_timezone(&Utc)
    } else if let Ok(ndt) = NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S") {
        ndt.and_utc()
    } else if let Ok(ndt) = NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S") {
        ndt.and_utc()
    } else {
        NaiveDate::parse_from_str(t, "%Y-%m-%d")
            .ok()?
            .and_hms_opt(0, 0, 0)?
            .and_utc()
    };
    Some(parsed.to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverviewQuery {
    pub student_id: String,
    pub grade: Option<String>,
    pub semester: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewTotals {
    pub total_credits: i64,
    pub sum_midterm: f64,
    pub sum_final: f64,
    pub sum_performance: f64,
    pub sum_total_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalSummary {
    pub total_students: usize,
    pub final_rank: String,
    pub final_converted_grade: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeOverview {
    pub student_id: String,
    pub student_name: String,
    pub grade: Option<i64>,
    pub class_number: Option<i64>,
    pub number: i64,
    pub subjects: Vec<SubjectResult>,
    pub totals: OverviewTotals,
    pub final_summary: FinalSummary,
    pub radar_chart: RadarChart,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectSubmission {
    pub subject: String,
    pub credits: i64,
    pub midterm: f64,
    pub final_score: f64,
    pub performance: f64,
    pub total_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradeSubmission {
    pub student_id: String,
    pub grade: String,
    pub semester: String,
    pub status: GradeStatus,
    pub updated_at: String,
    pub subjects: Vec<SubjectSubmission>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectPatch {
    pub subject: String,
    pub update: GradeUpdate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradePatch {
    pub student_id: String,
    pub group: GroupUpdate,
    pub subjects: Option<Vec<SubjectPatch>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusFilters {
    pub grade: Option<String>,
    pub class: Option<String>,
    pub semester: Option<String>,
}

pub fn overview<S: Store + ?Sized>(
    store: &S,
    cache: &dyn Cache,
    ttl: Duration,
    query: &OverviewQuery,
) -> Result<serde_json::Value, ServiceError> {
    let key = keys::grade_overview(
        &query.student_id,
        query.grade.as_deref(),
        query.semester.as_deref(),
    );
    cache::get_or_compute(cache, &key, ttl, || {
        let payload = compute_overview(store, query)?;
        Ok(serde_json::to_value(payload).map_err(anyhow::Error::from)?)
    })
}

pub fn compute_overview<S: Store + ?Sized>(
    store: &S,
    query: &OverviewQuery,
) -> Result<GradeOverview, ServiceError> {
    let student = store
        .find_student(&query.student_id)?
        .ok_or_else(|| ServiceError::not_found("student not found"))?;

    let grade = query.grade.as_deref().map(grade_label);
    let semester = query.semester.as_deref().map(semester_label);
    let group = store
        .latest_group(&student.id, grade.as_deref(), semester.as_deref())?
        .ok_or_else(|| ServiceError::not_found("no grade data"))?;

    let rows = store.group_grades(&group.id)?;
    let mut inputs: Vec<SubjectInput> = Vec::with_capacity(rows.len());
    for row in &rows {
        let cohort = store.cohort_scores(&row.subject_id, &group.grade, &group.semester)?;
        inputs.push(SubjectInput {
            scores: SubjectScores {
                name: row.subject_name.clone(),
                credits: row.credits,
                midterm: row.midterm,
                final_score: row.final_score,
                performance: row.performance,
                total_score: row.total_score,
            },
            cohort,
        });
    }
    let summary = calc::summarize_group(&inputs)?;

    let mut cohort_averages: Vec<f64> = Vec::new();
    if let Some(level) = student.classroom_grade {
        for peer in store.list_students(Some(level), None)? {
            let Some(peer_group) =
                store.latest_group(&peer.id, Some(&group.grade), Some(&group.semester))?
            else {
                continue;
            };
            let peer_rows = store.group_grades(&peer_group.id)?;
            if let Some(avg) =
                calc::weighted_average(peer_rows.iter().map(|g| (g.credits, g.total_score)))
            {
                cohort_averages.push(avg);
            }
        }
    }

    let own_average = summary.totals.weighted_total_score;
    let (rank, total_students) = match calc::final_rank(own_average, &cohort_averages) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(
                student_id = %student.id,
                group_id = %group.id,
                own_average,
                cohort_size = cohort_averages.len(),
                "final rank not found in cohort averages"
            );
            return Err(e.into());
        }
    };

    let radar_chart = summary.radar_chart();
    let t = summary.totals;
    Ok(GradeOverview {
        student_id: student.student_no,
        student_name: student.name,
        grade: student.classroom_grade,
        class_number: student.class_number,
        number: student.number,
        subjects: summary.subjects,
        totals: OverviewTotals {
            total_credits: t.total_credits,
            sum_midterm: calc::round_to(t.avg_midterm, 1),
            sum_final: calc::round_to(t.avg_final, 1),
            sum_performance: calc::round_to(t.avg_performance, 1),
            sum_total_score: calc::round_to(t.weighted_total_score, 1),
        },
        final_summary: FinalSummary {
            total_students,
            final_rank: format!("{rank}/{total_students}"),
            final_converted_grade: t.converted_grade,
        },
        radar_chart,
    })
}

/// Drop every cached view a grade write can change for this student.
fn invalidate_student_grades(cache: &dyn Cache, student_id: &str) {
    let overview = cache.delete_prefix(&keys::grade_overview_prefix(student_id));
    let status = cache.delete_prefix(keys::GRADE_STATUS_PREFIX);
    tracing::debug!(student_id, overview, status, "invalidated grade caches");
}

pub fn submit<S: Store + ?Sized>(
    store: &S,
    cache: &dyn Cache,
    submission: &GradeSubmission,
) -> Result<serde_json::Value, ServiceError> {
    if store.find_student(&submission.student_id)?.is_none() {
        return Err(ServiceError::not_found("student not found"));
    }

    let mut grades: Vec<NewGrade> = Vec::with_capacity(submission.subjects.len());
    for s in &submission.subjects {
        let subject_id = store
            .subject_id_by_name(&s.subject)?
            .ok_or_else(|| ServiceError::not_found(format!("subject not found: {}", s.subject)))?;
        grades.push(NewGrade {
            subject_id,
            credits: s.credits,
            midterm: s.midterm,
            final_score: s.final_score,
            performance: s.performance,
            total_score: s.total_score,
        });
    }

    let group_id = store.create_group(&NewGradeGroup {
        student_id: submission.student_id.clone(),
        grade: grade_label(&submission.grade),
        semester: semester_label(&submission.semester),
        status: submission.status,
        updated_at: submission.updated_at.clone(),
        grades,
    })?;

    invalidate_student_grades(cache, &submission.student_id);
    Ok(json!({
        "message": "Grades submitted successfully",
        "gradeGroupId": group_id,
    }))
}

pub fn patch<S: Store + ?Sized>(
    store: &S,
    cache: &dyn Cache,
    patch: &GradePatch,
) -> Result<serde_json::Value, ServiceError> {
    if store.find_student(&patch.student_id)?.is_none() {
        return Err(ServiceError::not_found("student not found"));
    }
    let group = store
        .latest_group(&patch.student_id, None, None)?
        .ok_or_else(|| ServiceError::not_found("no grade data"))?;

    if !patch.group.is_empty() {
        store.update_group(&group.id, &patch.group)?;
    }

    let mut updated = 0_usize;
    if let Some(subjects) = &patch.subjects {
        let rows = store.group_grades(&group.id)?;
        for s in subjects {
            let Some(row) = rows.iter().find(|r| r.subject_name == s.subject) else {
                tracing::debug!(subject = %s.subject, group_id = %group.id, "patched subject not in group, skipped");
                continue;
            };
            store.update_grade(&row.id, &s.update)?;
            updated += 1;
        }
    }

    invalidate_student_grades(cache, &patch.student_id);
    Ok(json!({
        "message": "Grades patched successfully",
        "gradeGroupId": group.id,
        "updatedSubjects": updated,
    }))
}

pub fn management_status<S: Store + ?Sized>(
    store: &S,
    cache: &dyn Cache,
    ttl: Duration,
    period: &InputPeriod,
    filters: &StatusFilters,
) -> Result<serde_json::Value, ServiceError> {
    let key = keys::grade_status(
        filters.grade.as_deref(),
        filters.class.as_deref(),
        filters.semester.as_deref(),
    );
    cache::get_or_compute(cache, &key, ttl, || {
        let grade = parse_filter_number("grade", filters.grade.as_deref())?;
        let class = parse_filter_number("class", filters.class.as_deref())?;
        let semester = filters.semester.as_deref().map(semester_label);

        let mut students = Vec::new();
        for s in store.list_students(grade, class)? {
            let status = store
                .latest_group(&s.id, None, semester.as_deref())?
                .map(|g| g.status)
                .unwrap_or(GradeStatus::NotEntered);
            students.push(json!({
                "id": s.id,
                "name": s.name,
                "studentId": s.student_no,
                "grade": s.classroom_grade,
                "classNumber": s.class_number,
                "number": s.number,
                "profileImage": s.profile_image,
                "gradeStatus": status,
            }));
        }
        Ok(json!({
            "semesterPeriod": { "start": period.start, "end": period.end },
            "students": students,
        }))
    })
}

fn parse_filter_number(field: &str, raw: Option<&str>) -> Result<Option<i64>, ServiceError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => v
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ServiceError::invalid_field(field, "must be an integer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::db;
    use rusqlite::Connection;

    const TTL: Duration = Duration::from_secs(300);

    struct Fixture {
        conn: Connection,
        cache: MemoryCache,
    }

    impl Fixture {
        fn new() -> Self {
            let conn = db::open_in_memory().expect("db");
            conn.execute(
                "INSERT INTO classrooms(id, grade, class_number) VALUES('c1', 1, 1), ('c2', 2, 1)",
                [],
            )
            .expect("classrooms");
            conn.execute(
                "INSERT INTO subjects(id, name) VALUES('math', 'Math'), ('eng', 'English')",
                [],
            )
            .expect("subjects");
            Self {
                conn,
                cache: MemoryCache::new(),
            }
        }

        fn student(&self, id: &str, classroom: Option<&str>, number: i64) {
            self.conn
                .execute(
                    "INSERT INTO users(id, username, password_hash, role, name, phone, created_at)
                     VALUES(?, ?, 'x', 'student', ?, '010', '2025-01-01T00:00:00Z')",
                    (format!("u-{id}"), format!("user-{id}"), format!("Student {id}")),
                )
                .expect("user");
            self.conn
                .execute(
                    "INSERT INTO students(id, user_id, classroom_id, student_no, number)
                     VALUES(?, ?, ?, ?, ?)",
                    (id, format!("u-{id}"), classroom, format!("2025{id}"), number),
                )
                .expect("student");
        }

        fn submit(&self, student: &str, updated_at: &str, math: f64, eng: f64) {
            submit(
                &self.conn,
                &self.cache,
                &GradeSubmission {
                    student_id: student.to_string(),
                    grade: "1".to_string(),
                    semester: "1".to_string(),
                    status: GradeStatus::InputComplete,
                    updated_at: updated_at.to_string(),
                    subjects: vec![
                        SubjectSubmission {
                            subject: "Math".to_string(),
                            credits: 3,
                            midterm: math,
                            final_score: math,
                            performance: math,
                            total_score: math,
                        },
                        SubjectSubmission {
                            subject: "English".to_string(),
                            credits: 2,
                            midterm: eng,
                            final_score: eng,
                            performance: eng,
                            total_score: eng,
                        },
                    ],
                },
            )
            .expect("submit");
        }

        fn query(&self, student: &str) -> OverviewQuery {
            OverviewQuery {
                student_id: student.to_string(),
                grade: Some("1".to_string()),
                semester: Some("1".to_string()),
            }
        }
    }

    fn three_student_cohort() -> Fixture {
        let f = Fixture::new();
        f.student("a", Some("c1"), 1);
        f.student("b", Some("c1"), 2);
        f.student("c", Some("c1"), 3);
        f.submit("a", "2025-05-02T00:00:00Z", 90.0, 80.0);
        f.submit("b", "2025-05-02T00:00:00Z", 95.0, 70.0);
        f.submit("c", "2025-05-02T00:00:00Z", 85.0, 75.0);
        f
    }

    #[test]
    fn labels_gain_suffix_once() {
        assert_eq!(grade_label("1"), "1학년");
        assert_eq!(grade_label("1학년"), "1학년");
        assert_eq!(semester_label(" 2 "), "2학기");
    }

    #[test]
    fn timestamps_normalize_to_utc_seconds() {
        assert_eq!(
            normalize_timestamp("2025-05-01T18:30:00+09:00").as_deref(),
            Some("2025-05-01T09:30:00Z")
        );
        assert_eq!(
            normalize_timestamp("2025-05-01T09:30:00").as_deref(),
            Some("2025-05-01T09:30:00Z")
        );
        assert_eq!(
            normalize_timestamp("2025-05-01").as_deref(),
            Some("2025-05-01T00:00:00Z")
        );
        assert_eq!(normalize_timestamp("yesterday"), None);
    }

    #[test]
    fn overview_ranks_subjects_and_student_within_cohort() {
        let f = three_student_cohort();
        let o = compute_overview(&f.conn, &f.query("a")).expect("overview");

        assert_eq!(o.student_id, "2025a");
        assert_eq!(o.grade, Some(1));
        assert_eq!(o.subjects.len(), 2);
        assert_eq!(o.subjects[0].name, "Math");
        assert_eq!(o.subjects[0].rank, "2/3");
        assert_eq!(o.subjects[1].name, "English");
        assert_eq!(o.subjects[1].rank, "1/3");
        assert_eq!(o.totals.total_credits, 5);
        assert_eq!(o.totals.sum_total_score, 86.0);
        assert_eq!(o.final_summary.total_students, 3);
        assert_eq!(o.final_summary.final_rank, "1/3");
        assert_eq!(o.final_summary.final_converted_grade, 5.2);
        assert_eq!(o.radar_chart.labels, vec!["Math", "English"]);
        assert_eq!(o.radar_chart.data, vec![90.0, 80.0]);
    }

    #[test]
    fn unknown_student_and_missing_period_are_not_found() {
        let f = three_student_cohort();
        let e = compute_overview(&f.conn, &f.query("nobody")).unwrap_err();
        assert_eq!(e.code(), "not_found");

        let mut q = f.query("a");
        q.semester = Some("2".to_string());
        let e = compute_overview(&f.conn, &q).unwrap_err();
        assert_eq!(e.code(), "not_found");
    }

    #[test]
    fn student_without_classroom_cannot_be_ranked() {
        let f = Fixture::new();
        f.student("lone", None, 1);
        f.submit("lone", "2025-05-02T00:00:00Z", 90.0, 80.0);
        let e = compute_overview(&f.conn, &f.query("lone")).unwrap_err();
        assert_eq!(e.code(), "inconsistent_state");
        assert_eq!(e.status(), 500);
    }

    #[test]
    fn group_without_subjects_is_no_grade_data() {
        let f = Fixture::new();
        f.student("a", Some("c1"), 1);
        f.conn
            .execute(
                "INSERT INTO grade_groups(id, student_id, grade, semester, status, updated_at)
                 VALUES('g-empty', 'a', '1학년', '1학기', 'draft', '2025-05-01T00:00:00Z')",
                [],
            )
            .expect("group");
        let e = compute_overview(&f.conn, &f.query("a")).unwrap_err();
        assert_eq!(e.code(), "not_found");
        assert_eq!(e.to_string(), "no grade data");
    }

    #[test]
    fn most_recent_duplicate_group_wins() {
        let f = three_student_cohort();
        f.submit("a", "2025-06-01T00:00:00Z", 60.0, 60.0);
        let o = compute_overview(&f.conn, &f.query("a")).expect("overview");
        assert_eq!(o.totals.sum_total_score, 60.0);
        // the older group's scores still sit in the subject cohort
        assert_eq!(o.subjects[0].rank, "4/4");
        assert_eq!(o.final_summary.final_rank, "3/3");
    }

    #[test]
    fn cached_overview_is_served_until_a_write_invalidates_it() {
        let f = three_student_cohort();
        let first = overview(&f.conn, &f.cache, TTL, &f.query("a")).expect("first");
        let unfiltered = OverviewQuery {
            student_id: "a".to_string(),
            ..OverviewQuery::default()
        };
        overview(&f.conn, &f.cache, TTL, &unfiltered).expect("unfiltered");

        // Out-of-band change is invisible while the entry is live.
        f.conn
            .execute("UPDATE grades SET total_score = 10 WHERE subject_id = 'math'", [])
            .expect("update");
        let cached = overview(&f.conn, &f.cache, TTL, &f.query("a")).expect("cached");
        assert_eq!(cached, first);

        patch(
            &f.conn,
            &f.cache,
            &GradePatch {
                student_id: "a".to_string(),
                group: GroupUpdate {
                    status: Some(GradeStatus::Draft),
                    updated_at: None,
                },
                subjects: None,
            },
        )
        .expect("patch");

        assert!(f
            .cache
            .get(&keys::grade_overview("a", Some("1"), Some("1")))
            .is_none());
        assert!(f.cache.get(&keys::grade_overview("a", None, None)).is_none());

        let fresh = overview(&f.conn, &f.cache, TTL, &f.query("a")).expect("fresh");
        assert_ne!(fresh, first);
        assert_eq!(fresh["subjects"][0]["totalScore"], json!(10.0));
    }

    #[test]
    fn patch_updates_named_subjects_and_skips_unknown_ones() {
        let f = three_student_cohort();
        let result = patch(
            &f.conn,
            &f.cache,
            &GradePatch {
                student_id: "a".to_string(),
                group: GroupUpdate::default(),
                subjects: Some(vec![
                    SubjectPatch {
                        subject: "Math".to_string(),
                        update: GradeUpdate {
                            total_score: Some(99.0),
                            ..GradeUpdate::default()
                        },
                    },
                    SubjectPatch {
                        subject: "History".to_string(),
                        update: GradeUpdate {
                            credits: Some(4),
                            ..GradeUpdate::default()
                        },
                    },
                ]),
            },
        )
        .expect("patch");
        assert_eq!(result["updatedSubjects"], json!(1));

        let o = compute_overview(&f.conn, &f.query("a")).expect("overview");
        assert_eq!(o.subjects[0].total_score, 99.0);
        assert_eq!(o.subjects[0].midterm, 90.0);
        assert_eq!(o.subjects[0].rank, "1/3");
    }

    #[test]
    fn submit_rejects_unknown_subject_without_writing() {
        let f = Fixture::new();
        f.student("a", Some("c1"), 1);
        let e = submit(
            &f.conn,
            &f.cache,
            &GradeSubmission {
                student_id: "a".to_string(),
                grade: "1".to_string(),
                semester: "1".to_string(),
                status: GradeStatus::Draft,
                updated_at: "2025-05-02T00:00:00Z".to_string(),
                subjects: vec![SubjectSubmission {
                    subject: "Alchemy".to_string(),
                    credits: 1,
                    midterm: 1.0,
                    final_score: 1.0,
                    performance: 1.0,
                    total_score: 1.0,
                }],
            },
        )
        .unwrap_err();
        assert_eq!(e.code(), "not_found");
        assert!(f.conn.latest_group("a", None, None).expect("query").is_none());
    }

    #[test]
    fn management_status_reports_latest_status_or_not_entered() {
        let f = three_student_cohort();
        f.student("d", Some("c1"), 4);
        f.student("e", Some("c2"), 1);
        let period = InputPeriod::default();
        let filters = StatusFilters {
            grade: Some("1".to_string()),
            ..StatusFilters::default()
        };
        let v = management_status(&f.conn, &f.cache, TTL, &period, &filters).expect("status");
        let students = v["students"].as_array().expect("students");
        assert_eq!(students.len(), 4);
        assert_eq!(students[0]["gradeStatus"], "input_complete");
        assert_eq!(students[3]["gradeStatus"], "not_entered");
        assert_eq!(v["semesterPeriod"]["start"], "2025-05-01");

        let bad = StatusFilters {
            class: Some("first".to_string()),
            ..StatusFilters::default()
        };
        let e = management_status(&f.conn, &f.cache, TTL, &period, &bad).unwrap_err();
        assert_eq!(e.code(), "bad_params");
    }
}
