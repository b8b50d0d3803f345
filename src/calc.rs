use serde::Serialize;
use serde_json::json;
use thiserror::Error;

pub const TOPIC_SLOTS: usize = 5;
pub const WW_MAX_SLOTS: usize = 10;
pub const PT_SLOTS: usize = 10;

pub const WW_WEIGHT: f64 = 0.4;
pub const PT_WEIGHT: f64 = 0.4;
pub const QA_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradeError {
    #[error("invalid input for {field}: {reason}")]
    InvalidInput { field: String, reason: String },
}

impl GradeError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        GradeError::InvalidInput {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GradeError::InvalidInput { .. } => "invalid_input",
        }
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            GradeError::InvalidInput { field, .. } => json!({ "field": field }),
        }
    }
}

/// One student's raw scores for a single class-record period.
///
/// Scores are `None` until graded. Maxima have no "ungraded" state; an
/// unset maximum is zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreRecord {
    pub topics: [Option<f64>; TOPIC_SLOTS],
    pub ww_max: [f64; WW_MAX_SLOTS],
    pub pt: [Option<f64>; PT_SLOTS],
    pub pt_max: [f64; PT_SLOTS],
    pub qa: Option<f64>,
    pub qa_max: f64,
}

/// Which cell of a [`ScoreRecord`] a client-facing field name addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreField {
    Topic(usize),
    WwMax(usize),
    Pt(usize),
    PtMax(usize),
    Qa,
    QaMax,
}

impl ScoreField {
    /// Parses `topic1`, `wwMax10`, `pt3`, `ptMax3`, `qa1`, `qaMax1`.
    pub fn parse(name: &str) -> Option<Self> {
        fn slot(rest: &str, limit: usize) -> Option<usize> {
            let n: usize = rest.parse().ok()?;
            (1..=limit).contains(&n).then_some(n - 1)
        }
        if name == "qa1" {
            return Some(ScoreField::Qa);
        }
        if name == "qaMax1" {
            return Some(ScoreField::QaMax);
        }
        if let Some(rest) = name.strip_prefix("topic") {
            return slot(rest, TOPIC_SLOTS).map(ScoreField::Topic);
        }
        if let Some(rest) = name.strip_prefix("wwMax") {
            return slot(rest, WW_MAX_SLOTS).map(ScoreField::WwMax);
        }
        if let Some(rest) = name.strip_prefix("ptMax") {
            return slot(rest, PT_SLOTS).map(ScoreField::PtMax);
        }
        if let Some(rest) = name.strip_prefix("pt") {
            return slot(rest, PT_SLOTS).map(ScoreField::Pt);
        }
        None
    }

    pub fn name(self) -> String {
        match self {
            ScoreField::Topic(i) => format!("topic{}", i + 1),
            ScoreField::WwMax(i) => format!("wwMax{}", i + 1),
            ScoreField::Pt(i) => format!("pt{}", i + 1),
            ScoreField::PtMax(i) => format!("ptMax{}", i + 1),
            ScoreField::Qa => "qa1".to_string(),
            ScoreField::QaMax => "qaMax1".to_string(),
        }
    }

    /// Storage column in the `records` table.
    pub fn column(self) -> String {
        match self {
            ScoreField::Topic(i) => format!("topic{}", i + 1),
            ScoreField::WwMax(i) => format!("ww_max{}", i + 1),
            ScoreField::Pt(i) => format!("pt{}", i + 1),
            ScoreField::PtMax(i) => format!("pt_max{}", i + 1),
            ScoreField::Qa => "qa1".to_string(),
            ScoreField::QaMax => "qa_max1".to_string(),
        }
    }

    pub fn is_maximum(self) -> bool {
        matches!(
            self,
            ScoreField::WwMax(_) | ScoreField::PtMax(_) | ScoreField::QaMax
        )
    }

    pub fn all() -> Vec<ScoreField> {
        let mut out = Vec::with_capacity(TOPIC_SLOTS + WW_MAX_SLOTS + 2 * PT_SLOTS + 2);
        out.extend((0..TOPIC_SLOTS).map(ScoreField::Topic));
        out.extend((0..WW_MAX_SLOTS).map(ScoreField::WwMax));
        out.extend((0..PT_SLOTS).map(ScoreField::Pt));
        out.extend((0..PT_SLOTS).map(ScoreField::PtMax));
        out.push(ScoreField::Qa);
        out.push(ScoreField::QaMax);
        out
    }
}

impl ScoreRecord {
    pub fn get(&self, field: ScoreField) -> Option<f64> {
        match field {
            ScoreField::Topic(i) => self.topics[i],
            ScoreField::WwMax(i) => Some(self.ww_max[i]),
            ScoreField::Pt(i) => self.pt[i],
            ScoreField::PtMax(i) => Some(self.pt_max[i]),
            ScoreField::Qa => self.qa,
            ScoreField::QaMax => Some(self.qa_max),
        }
    }

    /// Sets a cell. A `None` maximum is stored as zero.
    pub fn set(&mut self, field: ScoreField, value: Option<f64>) {
        match field {
            ScoreField::Topic(i) => self.topics[i] = value,
            ScoreField::WwMax(i) => self.ww_max[i] = value.unwrap_or(0.0),
            ScoreField::Pt(i) => self.pt[i] = value,
            ScoreField::PtMax(i) => self.pt_max[i] = value.unwrap_or(0.0),
            ScoreField::Qa => self.qa = value,
            ScoreField::QaMax => self.qa_max = value.unwrap_or(0.0),
        }
    }

    /// Strict constructor from the client's flat object shape
    /// (`topic1`, `wwMax1`, `pt1`, `ptMax1`, `qa1`, `qaMax1`).
    ///
    /// Absent or null fields are ungraded (scores) or zero (maxima). Anything
    /// present that is not a finite number is rejected.
    pub fn from_json(raw: &serde_json::Value) -> Result<Self, GradeError> {
        let Some(obj) = raw.as_object() else {
            return Err(GradeError::invalid("record", "record must be an object"));
        };
        let mut record = ScoreRecord::default();
        for field in ScoreField::all() {
            let name = field.name();
            let value = match obj.get(&name) {
                None => None,
                Some(v) if v.is_null() => None,
                Some(v) => {
                    let Some(n) = v.as_f64() else {
                        return Err(GradeError::invalid(&name, "must be a number or null"));
                    };
                    if !n.is_finite() {
                        return Err(GradeError::invalid(&name, "must be finite"));
                    }
                    Some(n)
                }
            };
            record.set(field, value);
        }
        Ok(record)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        for field in ScoreField::all() {
            obj.insert(field.name(), json!(self.get(field)));
        }
        serde_json::Value::Object(obj)
    }

    /// Count of ungraded score cells (topics, tasks and the assessment).
    pub fn missed_count(&self) -> usize {
        self.topics.iter().filter(|t| t.is_none()).count()
            + self.pt.iter().filter(|p| p.is_none()).count()
            + usize::from(self.qa.is_none())
    }
}

fn sum_scores(scores: &[Option<f64>]) -> f64 {
    scores.iter().map(|s| s.unwrap_or(0.0)).sum()
}

fn ratio_percent(total: f64, max: f64) -> f64 {
    if max == 0.0 {
        0.0
    } else {
        (total / max) * 100.0
    }
}

/// Σ topic1..5 over Σ wwMax1..10. Not clamped; scores above the declared
/// maxima produce a percentage above 100.
pub fn written_work_percent(record: &ScoreRecord) -> f64 {
    ratio_percent(sum_scores(&record.topics), record.ww_max.iter().sum())
}

pub fn written_work_weighted(record: &ScoreRecord) -> f64 {
    written_work_percent(record) * WW_WEIGHT
}

pub fn performance_task_percent(record: &ScoreRecord) -> f64 {
    ratio_percent(sum_scores(&record.pt), record.pt_max.iter().sum())
}

pub fn performance_task_weighted(record: &ScoreRecord) -> f64 {
    performance_task_percent(record) * PT_WEIGHT
}

pub fn quality_assessment_percent(record: &ScoreRecord) -> f64 {
    ratio_percent(record.qa.unwrap_or(0.0), record.qa_max)
}

pub fn quality_assessment_weighted(record: &ScoreRecord) -> f64 {
    quality_assessment_percent(record) * QA_WEIGHT
}

pub fn initial_grade(record: &ScoreRecord) -> f64 {
    written_work_percent(record) * WW_WEIGHT
        + performance_task_percent(record) * PT_WEIGHT
        + quality_assessment_percent(record) * QA_WEIGHT
}

/// Rounds an initial grade half away from zero (74.5 -> 75).
pub fn round_grade(initial: f64) -> i64 {
    initial.round() as i64
}

pub fn quarterly_grade(record: &ScoreRecord) -> i64 {
    round_grade(initial_grade(record))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBreakdown {
    pub ww_percent: f64,
    pub ww_weighted: f64,
    pub pt_percent: f64,
    pub pt_weighted: f64,
    pub qa_percent: f64,
    pub qa_weighted: f64,
    pub initial_grade: f64,
    pub quarterly_grade: i64,
}

pub fn grade_breakdown(record: &ScoreRecord) -> GradeBreakdown {
    GradeBreakdown {
        ww_percent: written_work_percent(record),
        ww_weighted: written_work_weighted(record),
        pt_percent: performance_task_percent(record),
        pt_weighted: performance_task_weighted(record),
        qa_percent: quality_assessment_percent(record),
        qa_weighted: quality_assessment_weighted(record),
        initial_grade: initial_grade(record),
        quarterly_grade: quarterly_grade(record),
    }
}
