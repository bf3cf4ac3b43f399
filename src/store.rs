//! Typed access to the grade records the overview engine reads and writes.
//!
//! The engine only ever talks to [`Store`]; the SQLite workspace connection
//! is the production implementation.

use anyhow::{anyhow, Context};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeStatus {
    InputComplete,
    Draft,
    NotEntered,
}

impl GradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InputComplete => "input_complete",
            Self::Draft => "draft",
            Self::NotEntered => "not_entered",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "input_complete" => Some(Self::InputComplete),
            "draft" => Some(Self::Draft),
            "not_entered" => Some(Self::NotEntered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentRecord {
    pub id: String,
    /// School-issued student number, shown to clients as `studentId`.
    pub student_no: String,
    pub name: String,
    pub classroom_grade: Option<i64>,
    pub class_number: Option<i64>,
    pub number: i64,
    pub profile_image: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradeGroupRecord {
    pub id: String,
    pub student_id: String,
    pub grade: String,
    pub semester: String,
    pub status: GradeStatus,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradeRecord {
    pub id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub credits: i64,
    pub midterm: f64,
    pub final_score: f64,
    pub performance: f64,
    pub total_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewGrade {
    pub subject_id: String,
    pub credits: i64,
    pub midterm: f64,
    pub final_score: f64,
    pub performance: f64,
    pub total_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewGradeGroup {
    pub student_id: String,
    pub grade: String,
    pub semester: String,
    pub status: GradeStatus,
    pub updated_at: String,
    pub grades: Vec<NewGrade>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupUpdate {
    pub status: Option<GradeStatus>,
    pub updated_at: Option<String>,
}

impl GroupUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.updated_at.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradeUpdate {
    pub credits: Option<i64>,
    pub midterm: Option<f64>,
    pub final_score: Option<f64>,
    pub performance: Option<f64>,
    pub total_score: Option<f64>,
}

pub trait Store {
    fn find_student(&self, student_id: &str) -> anyhow::Result<Option<StudentRecord>>;

    /// Students filtered by classroom grade and class number, in class order.
    fn list_students(
        &self,
        classroom_grade: Option<i64>,
        class_number: Option<i64>,
    ) -> anyhow::Result<Vec<StudentRecord>>;

    /// Most recently updated group for the student, optionally restricted to
    /// one grade label and/or semester label.
    fn latest_group(
        &self,
        student_id: &str,
        grade: Option<&str>,
        semester: Option<&str>,
    ) -> anyhow::Result<Option<GradeGroupRecord>>;

    fn group_grades(&self, group_id: &str) -> anyhow::Result<Vec<GradeRecord>>;

    /// Every total score recorded for a subject within one grade and
    /// semester, across all groups.
    fn cohort_scores(&self, subject_id: &str, grade: &str, semester: &str)
        -> anyhow::Result<Vec<f64>>;

    fn subject_id_by_name(&self, name: &str) -> anyhow::Result<Option<String>>;

    fn create_group(&self, group: &NewGradeGroup) -> anyhow::Result<String>;

    fn update_group(&self, group_id: &str, update: &GroupUpdate) -> anyhow::Result<()>;

    fn update_grade(&self, grade_id: &str, update: &GradeUpdate) -> anyhow::Result<()>;
}

const STUDENT_SELECT: &str = "SELECT s.id, s.student_no, u.name, c.grade, c.class_number, s.number, s.profile_image
     FROM students s
     JOIN users u ON u.id = s.user_id
     LEFT JOIN classrooms c ON c.id = s.classroom_id";

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRecord> {
    Ok(StudentRecord {
        id: r.get(0)?,
        student_no: r.get(1)?,
        name: r.get(2)?,
        classroom_grade: r.get(3)?,
        class_number: r.get(4)?,
        number: r.get(5)?,
        profile_image: r.get(6)?,
    })
}

fn group_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(GradeGroupRecord, String)> {
    let status: String = r.get(4)?;
    Ok((
        GradeGroupRecord {
            id: r.get(0)?,
            student_id: r.get(1)?,
            grade: r.get(2)?,
            semester: r.get(3)?,
            status: GradeStatus::NotEntered,
            updated_at: r.get(5)?,
        },
        status,
    ))
}

impl Store for Connection {
    fn find_student(&self, student_id: &str) -> anyhow::Result<Option<StudentRecord>> {
        let sql = format!("{STUDENT_SELECT} WHERE s.id = ?");
        let row = self
            .query_row(&sql, [student_id], student_from_row)
            .optional()?;
        Ok(row)
    }

    fn list_students(
        &self,
        classroom_grade: Option<i64>,
        class_number: Option<i64>,
    ) -> anyhow::Result<Vec<StudentRecord>> {
        let sql = format!(
            "{STUDENT_SELECT}
             WHERE (?1 IS NULL OR c.grade = ?1)
               AND (?2 IS NULL OR c.class_number = ?2)
             ORDER BY c.grade, c.class_number, s.number, s.rowid"
        );
        let mut stmt = self.prepare(&sql)?;
        let rows = stmt
            .query_map((classroom_grade, class_number), student_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn latest_group(
        &self,
        student_id: &str,
        grade: Option<&str>,
        semester: Option<&str>,
    ) -> anyhow::Result<Option<GradeGroupRecord>> {
        let row = self
            .query_row(
                "SELECT id, student_id, grade, semester, status, updated_at
                 FROM grade_groups
                 WHERE student_id = ?1
                   AND (?2 IS NULL OR grade = ?2)
                   AND (?3 IS NULL OR semester = ?3)
                 ORDER BY updated_at DESC, rowid DESC
                 LIMIT 1",
                (student_id, grade, semester),
                group_from_row,
            )
            .optional()?;
        let Some((mut group, status)) = row else {
            return Ok(None);
        };
        group.status = GradeStatus::parse(&status)
            .ok_or_else(|| anyhow!("grade group {} has unknown status {status:?}", group.id))?;
        Ok(Some(group))
    }

    fn group_grades(&self, group_id: &str) -> anyhow::Result<Vec<GradeRecord>> {
        let mut stmt = self.prepare(
            "SELECT g.id, g.subject_id, sub.name, g.credits, g.midterm, g.final, g.performance, g.total_score
             FROM grades g
             JOIN subjects sub ON sub.id = g.subject_id
             WHERE g.grade_group_id = ?
             ORDER BY g.sort_order",
        )?;
        let rows = stmt
            .query_map([group_id], |r| {
                Ok(GradeRecord {
                    id: r.get(0)?,
                    subject_id: r.get(1)?,
                    subject_name: r.get(2)?,
                    credits: r.get(3)?,
                    midterm: r.get(4)?,
                    final_score: r.get(5)?,
                    performance: r.get(6)?,
                    total_score: r.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn cohort_scores(
        &self,
        subject_id: &str,
        grade: &str,
        semester: &str,
    ) -> anyhow::Result<Vec<f64>> {
        let mut stmt = self.prepare(
            "SELECT g.total_score
             FROM grades g
             JOIN grade_groups gg ON gg.id = g.grade_group_id
             WHERE g.subject_id = ? AND gg.grade = ? AND gg.semester = ?",
        )?;
        let scores = stmt
            .query_map((subject_id, grade, semester), |r| r.get::<_, f64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(scores)
    }

    fn subject_id_by_name(&self, name: &str) -> anyhow::Result<Option<String>> {
        let id = self
            .query_row("SELECT id FROM subjects WHERE name = ?", [name], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(id)
    }

    fn create_group(&self, group: &NewGradeGroup) -> anyhow::Result<String> {
        let tx = self.unchecked_transaction()?;
        let group_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO grade_groups(id, student_id, grade, semester, status, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                &group_id,
                &group.student_id,
                &group.grade,
                &group.semester,
                group.status.as_str(),
                &group.updated_at,
            ),
        )
        .context("insert grade_groups")?;
        for (i, g) in group.grades.iter().enumerate() {
            tx.execute(
                "INSERT INTO grades(id, grade_group_id, subject_id, credits, midterm, final, performance, total_score, sort_order)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &group_id,
                    &g.subject_id,
                    g.credits,
                    g.midterm,
                    g.final_score,
                    g.performance,
                    g.total_score,
                    i as i64,
                ),
            )
            .context("insert grades")?;
        }
        tx.commit()?;
        Ok(group_id)
    }

    fn update_group(&self, group_id: &str, update: &GroupUpdate) -> anyhow::Result<()> {
        if let Some(status) = update.status {
            self.execute(
                "UPDATE grade_groups SET status = ? WHERE id = ?",
                (status.as_str(), group_id),
            )?;
        }
        if let Some(updated_at) = &update.updated_at {
            self.execute(
                "UPDATE grade_groups SET updated_at = ? WHERE id = ?",
                (updated_at, group_id),
            )?;
        }
        Ok(())
    }

    fn update_grade(&self, grade_id: &str, update: &GradeUpdate) -> anyhow::Result<()> {
        if let Some(credits) = update.credits {
            self.execute(
                "UPDATE grades SET credits = ? WHERE id = ?",
                (credits, grade_id),
            )?;
        }
        if let Some(midterm) = update.midterm {
            self.execute(
                "UPDATE grades SET midterm = ? WHERE id = ?",
                (midterm, grade_id),
            )?;
        }
        if let Some(final_score) = update.final_score {
            self.execute(
                "UPDATE grades SET final = ? WHERE id = ?",
                (final_score, grade_id),
            )?;
        }
        if let Some(performance) = update.performance {
            self.execute(
                "UPDATE grades SET performance = ? WHERE id = ?",
                (performance, grade_id),
            )?;
        }
        if let Some(total_score) = update.total_score {
            self.execute(
                "UPDATE grades SET total_score = ? WHERE id = ?",
                (total_score, grade_id),
            )?;
        }
        Ok(())
    }
}
