use serde::Serialize;
use std::cmp::Ordering;
use thiserror::Error;

/// Tolerance used when locating a student's own weighted average inside the
/// cohort-wide list. Two students closer than this share the first position.
pub const RANK_MATCH_TOLERANCE: f64 = 1e-6;

/// Upper percentile bound (inclusive) for grade levels 1..=8; anything above
/// the last bound is level 9.
const GRADE_LEVEL_BOUNDS: [(f64, u8); 8] = [
    (0.04, 1),
    (0.11, 2),
    (0.23, 3),
    (0.40, 4),
    (0.60, 5),
    (0.77, 6),
    (0.89, 7),
    (0.96, 8),
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalcError {
    #[error("cohort for subject {subject} is empty")]
    EmptyCohort { subject: String },
    #[error("no grade data")]
    NoGradeData,
    #[error("cannot compute rank")]
    RankNotComputable,
}

/// Round to `places` decimals from the exact binary value, ties to even.
///
/// Float formatting already rounds this way, so `86.25` becomes `86.2` and
/// `1.15` (stored just below) becomes `1.1`.
pub fn round_to(x: f64, places: usize) -> f64 {
    if !x.is_finite() {
        return x;
    }
    format!("{x:.places$}").parse().unwrap_or(x)
}

pub fn grade_level_for_percentile(percentile: f64) -> u8 {
    GRADE_LEVEL_BOUNDS
        .iter()
        .find(|(bound, _)| percentile <= *bound)
        .map(|(_, level)| *level)
        .unwrap_or(9)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CohortRank {
    pub rank: usize,
    pub cohort_size: usize,
    pub percentile: f64,
    pub grade_level: u8,
}

impl CohortRank {
    pub fn label(&self) -> String {
        format!("{}/{}", self.rank, self.cohort_size)
    }
}

/// Competition ranking: a score's rank is the number of strictly greater
/// scores plus one. `cohort` must include the score itself.
pub fn rank_in_cohort(score: f64, cohort: &[f64]) -> Option<CohortRank> {
    if cohort.is_empty() {
        return None;
    }
    let greater = cohort.iter().filter(|s| **s > score).count();
    let rank = greater + 1;
    let percentile = rank as f64 / cohort.len() as f64;
    Some(CohortRank {
        rank,
        cohort_size: cohort.len(),
        percentile,
        grade_level: grade_level_for_percentile(percentile),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectScores {
    pub name: String,
    pub credits: i64,
    pub midterm: f64,
    pub final_score: f64,
    pub performance: f64,
    pub total_score: f64,
}

/// One subject of a grade group together with every total score recorded for
/// that subject in the same grade and semester.
#[derive(Debug, Clone)]
pub struct SubjectInput {
    pub scores: SubjectScores,
    pub cohort: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub name: String,
    pub credits: i64,
    pub midterm: f64,
    #[serde(rename = "final")]
    pub final_score: f64,
    pub performance: f64,
    pub total_score: f64,
    pub rank: String,
    pub grade_level: u8,
}

/// Unrounded aggregates over one grade group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupTotals {
    pub total_credits: i64,
    pub avg_midterm: f64,
    pub avg_final: f64,
    pub avg_performance: f64,
    pub weighted_total_score: f64,
    pub converted_grade: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupSummary {
    pub subjects: Vec<SubjectResult>,
    pub totals: GroupTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RadarChart {
    pub labels: Vec<String>,
    pub data: Vec<f64>,
}

impl GroupSummary {
    pub fn radar_chart(&self) -> RadarChart {
        RadarChart {
            labels: self.subjects.iter().map(|s| s.name.clone()).collect(),
            data: self.subjects.iter().map(|s| s.total_score).collect(),
        }
    }
}

/// Credit-weighted mean of `(credits, total_score)` pairs, `None` when the
/// credits do not add up to a positive number.
pub fn weighted_average<I>(rows: I) -> Option<f64>
where
    I: IntoIterator<Item = (i64, f64)>,
{
    let mut credits_sum: i64 = 0;
    let mut weighted_sum = 0.0_f64;
    for (credits, total) in rows {
        credits_sum += credits;
        weighted_sum += total * credits as f64;
    }
    if credits_sum > 0 {
        Some(weighted_sum / credits_sum as f64)
    } else {
        None
    }
}

pub fn summarize_group(inputs: &[SubjectInput]) -> Result<GroupSummary, CalcError> {
    if inputs.is_empty() {
        return Err(CalcError::NoGradeData);
    }

    let mut subjects: Vec<SubjectResult> = Vec::with_capacity(inputs.len());
    let mut total_credits: i64 = 0;
    let mut weighted_total = 0.0_f64;
    let mut weighted_levels = 0.0_f64;

    for input in inputs {
        let s = &input.scores;
        let Some(rank) = rank_in_cohort(s.total_score, &input.cohort) else {
            return Err(CalcError::EmptyCohort {
                subject: s.name.clone(),
            });
        };

        total_credits += s.credits;
        weighted_total += s.total_score * s.credits as f64;
        weighted_levels += f64::from(rank.grade_level) * s.credits as f64;

        subjects.push(SubjectResult {
            name: s.name.clone(),
            credits: s.credits,
            midterm: s.midterm,
            final_score: s.final_score,
            performance: s.performance,
            total_score: s.total_score,
            rank: rank.label(),
            grade_level: rank.grade_level,
        });
    }

    if total_credits <= 0 {
        return Err(CalcError::NoGradeData);
    }

    // Component averages are plain means over subjects, not credit-weighted.
    let n = inputs.len() as f64;
    let avg_midterm = inputs.iter().map(|i| i.scores.midterm).sum::<f64>() / n;
    let avg_final = inputs.iter().map(|i| i.scores.final_score).sum::<f64>() / n;
    let avg_performance = inputs.iter().map(|i| i.scores.performance).sum::<f64>() / n;

    Ok(GroupSummary {
        subjects,
        totals: GroupTotals {
            total_credits,
            avg_midterm,
            avg_final,
            avg_performance,
            weighted_total_score: weighted_total / total_credits as f64,
            converted_grade: round_to(weighted_levels / total_credits as f64, 2),
        },
    })
}

/// Position (1-based) of `own` in the descending list of cohort averages,
/// returned together with the cohort size.
///
/// Matching is by value within [`RANK_MATCH_TOLERANCE`], so a student whose
/// own group is absent from `cohort_averages` yields
/// [`CalcError::RankNotComputable`] rather than a guessed position.
pub fn final_rank(own: f64, cohort_averages: &[f64]) -> Result<(usize, usize), CalcError> {
    let mut sorted = cohort_averages.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    sorted
        .iter()
        .position(|v| (v - own).abs() < RANK_MATCH_TOLERANCE)
        .map(|idx| (idx + 1, sorted.len()))
        .ok_or(CalcError::RankNotComputable)
}
