use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

use crate::err::Error;
use crate::worker::{Row, SqlValue};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Student {
    pub matriculation_number: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exam {
    pub pnr: String,
    pub title: String,
    pub exam_date: NaiveDate,
    pub semester: Option<String>,
    pub degree_program: Option<String>,
}

/// A grade joined with the names it refers to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeEntry {
    pub matriculation_number: String,
    pub last_name: String,
    pub first_name: String,
    pub pnr: String,
    pub title: String,
    pub grade: f64,
    pub grade_date: NaiveDate,
}

/// Entry of the "pick a student" list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentChoice {
    pub matriculation_number: String,
    pub display_text: String,
}

impl From<&Student> for StudentChoice {
    fn from(student: &Student) -> Self {
        Self {
            matriculation_number: student.matriculation_number.clone(),
            display_text: format!(
                "{}, {} ({})",
                student.last_name, student.first_name, student.matriculation_number
            ),
        }
    }
}

/// Entry of the "pick an exam" list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExamChoice {
    pub pnr: String,
    pub display_text: String,
}

impl From<&Exam> for ExamChoice {
    fn from(exam: &Exam) -> Self {
        Self {
            pnr: exam.pnr.clone(),
            display_text: format!(
                "{} - {} ({} | {})",
                exam.pnr,
                exam.title,
                exam.exam_date,
                exam.semester.as_deref().unwrap_or("-")
            ),
        }
    }
}

/// Student form as submitted; nothing here has been checked yet.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudentDraft {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub matriculation_number: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExamDraft {
    #[serde(default, deserialize_with = "text_or_number")]
    pub pnr: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub exam_date: Option<NaiveDate>,
    #[serde(default)]
    pub semester: Option<String>,
    #[serde(default)]
    pub degree_program: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GradeDraft {
    #[serde(default, deserialize_with = "optional_text_or_number")]
    pub matriculation_number: Option<String>,
    #[serde(default, deserialize_with = "optional_text_or_number")]
    pub pnr: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub grade: String,
}

/// Forms send numbers either as JSON numbers or as the text typed into the field.
fn text_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Unsigned(u64),
        Float(f64),
        Text(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Unsigned(value) => value.to_string(),
        Raw::Float(value) => value.to_string(),
        Raw::Text(text) => text,
    })
}

fn optional_text_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapped(#[serde(deserialize_with = "text_or_number")] String);

    Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(text)| text))
}

/// Advisory preview of the next free identifier. Another client may insert
/// the same key before this one does; the insert then fails as a duplicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdPreview {
    pub last: Option<String>,
    pub next: String,
}

pub(crate) fn text_at(row: &Row, index: usize, column: &str) -> Result<String, Error> {
    row.get(index)
        .and_then(SqlValue::as_text)
        .map(str::to_string)
        .ok_or_else(|| unexpected_column(column))
}

pub(crate) fn optional_text_at(row: &Row, index: usize, column: &str) -> Result<Option<String>, Error> {
    match row.get(index) {
        Some(SqlValue::Null) => Ok(None),
        Some(SqlValue::Text(text)) => Ok(Some(text.clone())),
        _ => Err(unexpected_column(column)),
    }
}

pub(crate) fn date_at(row: &Row, index: usize, column: &str) -> Result<NaiveDate, Error> {
    row.get(index)
        .and_then(SqlValue::as_date)
        .ok_or_else(|| unexpected_column(column))
}

pub(crate) fn float_at(row: &Row, index: usize, column: &str) -> Result<f64, Error> {
    row.get(index)
        .and_then(SqlValue::as_float)
        .ok_or_else(|| unexpected_column(column))
}

fn unexpected_column(column: &str) -> Error {
    Error::InternalError {
        kind: "DecodeError",
        message: format!("column `{}` is missing or has an unexpected type", column),
    }
}

impl TryFrom<&Row> for Student {
    type Error = Error;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            matriculation_number: text_at(row, 0, "matriculation_number")?,
            first_name: text_at(row, 1, "first_name")?,
            last_name: text_at(row, 2, "last_name")?,
            date_of_birth: date_at(row, 3, "date_of_birth")?,
        })
    }
}

impl TryFrom<&Row> for Exam {
    type Error = Error;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            pnr: text_at(row, 0, "pnr")?,
            title: text_at(row, 1, "title")?,
            exam_date: date_at(row, 2, "exam_date")?,
            semester: optional_text_at(row, 3, "semester")?,
            degree_program: optional_text_at(row, 4, "degree_program")?,
        })
    }
}

impl TryFrom<&Row> for GradeEntry {
    type Error = Error;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            matriculation_number: text_at(row, 0, "matriculation_number")?,
            last_name: text_at(row, 1, "last_name")?,
            first_name: text_at(row, 2, "first_name")?,
            pnr: text_at(row, 3, "pnr")?,
            title: text_at(row, 4, "title")?,
            grade: float_at(row, 5, "grade")?,
            grade_date: date_at(row, 6, "grade_date")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn choice_texts_match_list_format() {
        let student = Student {
            matriculation_number: "0000000007".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            date_of_birth: date(1990, 1, 1),
        };
        assert_eq!(
            StudentChoice::from(&student).display_text,
            "Lovelace, Ada (0000000007)"
        );

        let exam = Exam {
            pnr: "0000000003".into(),
            title: "Algorithms".into(),
            exam_date: date(2025, 6, 1),
            semester: Some("SoSe 25".into()),
            degree_program: Some("CS (B.Sc.)".into()),
        };
        assert_eq!(
            ExamChoice::from(&exam).display_text,
            "0000000003 - Algorithms (2025-06-01 | SoSe 25)"
        );
    }

    #[test]
    fn drafts_accept_numeric_json() {
        let draft: StudentDraft = serde_json::from_str(
            r#"{"first_name": "Ada", "last_name": "Lovelace", "date_of_birth": "1990-01-01", "matriculation_number": 7}"#,
        )
        .unwrap();
        assert_eq!(draft.matriculation_number, "7");

        let grade: GradeDraft = serde_json::from_str(r#"{"grade": 1.7}"#).unwrap();
        assert_eq!(grade.grade, "1.7");
        let grade: GradeDraft = serde_json::from_str(r#"{"grade": "1,3"}"#).unwrap();
        assert_eq!(grade.grade, "1,3");
        assert_eq!(grade.matriculation_number, None);
    }

    #[test]
    fn grade_draft_keys_accept_numbers_text_and_null() {
        let grade: GradeDraft =
            serde_json::from_str(r#"{"matriculation_number": 7, "pnr": 3, "grade": 1.7}"#).unwrap();
        assert_eq!(grade.matriculation_number.as_deref(), Some("7"));
        assert_eq!(grade.pnr.as_deref(), Some("3"));

        let grade: GradeDraft =
            serde_json::from_str(r#"{"matriculation_number": "0000000007", "pnr": null, "grade": "1.7"}"#)
                .unwrap();
        assert_eq!(grade.matriculation_number.as_deref(), Some("0000000007"));
        assert_eq!(grade.pnr, None);
    }

    #[test]
    fn exam_rows_decode_with_null_columns() {
        let row: Row = vec![
            SqlValue::Text("0000000003".into()),
            SqlValue::Text("Algorithms".into()),
            SqlValue::Date(date(2025, 6, 1)),
            SqlValue::Null,
            SqlValue::Text("CS (B.Sc.)".into()),
        ];
        let exam = Exam::try_from(&row).unwrap();
        assert_eq!(exam.semester, None);
        assert_eq!(exam.degree_program.as_deref(), Some("CS (B.Sc.)"));
    }

    #[test]
    fn short_rows_are_decode_errors() {
        let row: Row = vec![SqlValue::Text("0000000007".into())];
        assert!(matches!(
            Student::try_from(&row),
            Err(Error::InternalError { kind: "DecodeError", .. })
        ));
    }
}
