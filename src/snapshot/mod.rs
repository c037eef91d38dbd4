pub mod differ;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use differ::{diff, DiffResult, FieldChange};

/// Dashboard fields, declared in canonical order. `Ord` follows declaration order,
/// so any map keyed by `Field` iterates canonically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    AcademicPlanning,
    Resumption,
    StudentAffairs,
    CourseControl,
    Attendance,
    ExamConduct,
    ResultUpload,
    ResultProcessing,
}

impl Field {
    pub const ALL: [Field; 8] = [
        Field::AcademicPlanning,
        Field::Resumption,
        Field::StudentAffairs,
        Field::CourseControl,
        Field::Attendance,
        Field::ExamConduct,
        Field::ResultUpload,
        Field::ResultProcessing,
    ];

    pub fn as_slug(&self) -> &'static str {
        match self {
            Self::AcademicPlanning => "academic_planning",
            Self::Resumption => "resumption",
            Self::StudentAffairs => "student_affairs",
            Self::CourseControl => "course_control",
            Self::Attendance => "attendance",
            Self::ExamConduct => "exam_conduct",
            Self::ResultUpload => "result_upload",
            Self::ResultProcessing => "result_processing",
        }
    }

    /// Element id the portal uses for this field unless configured otherwise.
    pub fn default_element_id(&self) -> &'static str {
        match self {
            Self::AcademicPlanning => "academic-planning",
            Self::Resumption => "resumption",
            Self::StudentAffairs => "student-affairs",
            Self::CourseControl => "course-control",
            Self::Attendance => "attendance",
            Self::ExamConduct => "exam-conduct",
            Self::ResultUpload => "result-upload",
            Self::ResultProcessing => "result-processing",
        }
    }
}

impl Display for Field {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let display = match self {
            Self::AcademicPlanning => "Academic Planning",
            Self::Resumption => "Resumption",
            Self::StudentAffairs => "Student Affairs",
            Self::CourseControl => "Course Control",
            Self::Attendance => "Attendance",
            Self::ExamConduct => "Exam Conduct",
            Self::ResultUpload => "Result Upload",
            Self::ResultProcessing => "Result Processing",
        };
        write!(f, "{display}")
    }
}

#[derive(Debug, Error)]
#[error("unknown dashboard field: {0}")]
pub struct FieldParseError(pub String);

impl FromStr for Field {
    type Err = FieldParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Field::ALL
            .into_iter()
            .find(|field| field.as_slug() == normalized)
            .ok_or_else(|| FieldParseError(s.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Unavailable,
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{text}"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// One complete capture of the dashboard. Every field is present; fields the page
/// did not expose are `Unavailable`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    fetched_at: DateTime<Utc>,
    fields: BTreeMap<Field, FieldValue>,
    digest: String,
}

impl Snapshot {
    pub fn from_fields(values: impl IntoIterator<Item = (Field, FieldValue)>) -> Self {
        Self::captured_at(Utc::now(), values)
    }

    pub fn captured_at(
        fetched_at: DateTime<Utc>,
        values: impl IntoIterator<Item = (Field, FieldValue)>,
    ) -> Self {
        let mut fields: BTreeMap<Field, FieldValue> = Field::ALL
            .into_iter()
            .map(|field| (field, FieldValue::Unavailable))
            .collect();
        fields.extend(values);
        let digest = content_digest(&fields);
        Self {
            fetched_at,
            fields,
            digest,
        }
    }

    pub fn get(&self, field: Field) -> &FieldValue {
        self.fields.get(&field).unwrap_or(&FieldValue::Unavailable)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Field, &FieldValue)> {
        self.fields.iter().map(|(field, value)| (*field, value))
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn available_count(&self) -> usize {
        self.fields
            .values()
            .filter(|value| matches!(value, FieldValue::Text(_)))
            .count()
    }
}

/// Equality covers field content only; capture time is ignored.
impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for Snapshot {}

fn content_digest(fields: &BTreeMap<Field, FieldValue>) -> String {
    let mut hasher = Sha256::new();
    for (field, value) in fields {
        hasher.update(field.as_slug().as_bytes());
        hasher.update([0u8]);
        match value {
            FieldValue::Text(text) => {
                hasher.update([1u8]);
                hasher.update((text.len() as u64).to_le_bytes());
                hasher.update(text.as_bytes());
            }
            FieldValue::Unavailable => hasher.update([2u8]),
        }
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}
