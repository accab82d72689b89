//! Field rules applied before any statement is built.
//!
//! Keys are normalized here and nowhere else: every write and every lookup
//! passes through [`normalize_matriculation_number`] or [`normalize_pnr`], so
//! the database only ever sees the zero-padded form.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};

use crate::err::Error;
use crate::models::{ExamDraft, GradeDraft, StudentDraft};

pub const KEY_WIDTH: usize = 10;
pub const MAX_MATRICULATION_NUMBER: u64 = 999_999_999;
pub const MAX_PNR: u64 = 9_999_999_999;

pub const MIN_AGE_YEARS: i32 = 5;
pub const MAX_AGE_YEARS: i32 = 120;

pub const STUDENT_PLACEHOLDER: &str = "-- Select student --";
pub const EXAM_PLACEHOLDER: &str = "-- Select exam --";
pub const SEMESTER_PLACEHOLDER: &str = "-- Select semester --";
pub const STUDY_PROGRAM_PLACEHOLDER: &str = "-- Select study program --";

pub fn normalize_matriculation_number(raw: &str) -> Result<String, Error> {
    normalize_key("matriculation_number", "a matriculation number", raw, MAX_MATRICULATION_NUMBER)
}

pub fn normalize_pnr(raw: &str) -> Result<String, Error> {
    normalize_key("pnr", "an exam number", raw, MAX_PNR)
}

fn normalize_key(field: &'static str, label: &str, raw: &str, max: u64) -> Result<String, Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::validation(field, format!("Please enter {}", label)));
    }
    if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::validation(
            field,
            format!("'{}' is not a valid number: only digits are allowed", trimmed),
        ));
    }
    let significant = trimmed.trim_start_matches('0');
    let value = if significant.is_empty() {
        0
    } else if significant.len() > KEY_WIDTH {
        u64::MAX
    } else {
        significant.parse::<u64>().unwrap_or(u64::MAX)
    };
    if value > max {
        return Err(Error::validation(
            field,
            format!("'{}' is out of range (at most {})", trimmed, max),
        ));
    }
    Ok(format!("{:0width$}", value, width = KEY_WIDTH))
}

/// Whole years between `birth` and `today`; the year only counts once the
/// birthday (month and day) has been reached.
pub fn age_on(birth: NaiveDate, today: NaiveDate) -> i32 {
    let mut age = today.year() - birth.year();
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    age
}

/// The same calendar day `years` earlier; 29 February falls back to the 28th.
fn years_before(date: NaiveDate, years: i32) -> Option<NaiveDate> {
    let year = date.year() - years;
    NaiveDate::from_ymd_opt(year, date.month(), date.day())
        .or_else(|| NaiveDate::from_ymd_opt(year, date.month(), 28))
}

/// Accepts birth dates from exactly 120 years ago up to exactly 5 years ago.
pub fn validate_birth_date(birth: NaiveDate, today: NaiveDate) -> Result<(), Error> {
    let out_of_range = || Error::validation("date_of_birth", "Birth date is out of range");
    let latest = years_before(today, MIN_AGE_YEARS).ok_or_else(out_of_range)?;
    let earliest = years_before(today, MAX_AGE_YEARS).ok_or_else(out_of_range)?;
    let age = age_on(birth, today);

    if birth > latest {
        return Err(Error::validation(
            "date_of_birth",
            format!(
                "Student must be at least {} years old (calculated age: {})",
                MIN_AGE_YEARS, age
            ),
        ));
    }
    if birth < earliest {
        return Err(Error::validation(
            "date_of_birth",
            format!(
                "Student age cannot exceed {} years (born {}, earliest allowed {})",
                MAX_AGE_YEARS, birth, earliest
            ),
        ));
    }
    Ok(())
}

pub fn require_text(field: &'static str, label: &str, value: &str) -> Result<String, Error> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::validation(field, format!("Please enter {}", label)));
    }
    Ok(trimmed.to_string())
}

/// A choice list value; `None`, blank and the placeholder entry all mean
/// nothing was chosen.
pub fn require_selection(
    field: &'static str,
    label: &str,
    value: Option<&str>,
    placeholder: &str,
) -> Result<String, Error> {
    match value.map(str::trim) {
        Some(chosen) if !chosen.is_empty() && chosen != placeholder => Ok(chosen.to_string()),
        _ => Err(Error::validation(field, format!("Please select {}", label))),
    }
}

/// A grade in tenths, always within 1.0..=6.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GradeValue(u8);

impl GradeValue {
    pub const MIN: GradeValue = GradeValue(10);
    pub const MAX: GradeValue = GradeValue(60);

    /// Parses `"1.7"`, `"1,7"` or `"2"`. More than one fractional digit is rejected.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let invalid = || {
            Error::validation(
                "grade",
                format!("'{}' is not a valid grade (use e.g. 1.7)", raw.trim()),
            )
        };
        let normalized = raw.trim().replace(',', ".");
        if normalized.is_empty() {
            return Err(Error::validation("grade", "Please enter a grade"));
        }

        let (whole, fraction) = match normalized.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (normalized.as_str(), "0"),
        };
        let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(whole) || !all_digits(fraction) || whole.len() > 3 {
            return Err(invalid());
        }
        if fraction.len() > 1 {
            return Err(Error::validation(
                "grade",
                "A grade may have at most one decimal place",
            ));
        }

        let whole: u32 = whole.parse().map_err(|_| invalid())?;
        let fraction: u32 = fraction.parse().map_err(|_| invalid())?;
        let tenths = whole * 10 + fraction;
        if tenths < u32::from(Self::MIN.0) || tenths > u32::from(Self::MAX.0) {
            return Err(Error::validation(
                "grade",
                format!("Grade must be between {} and {}", Self::MIN, Self::MAX),
            ));
        }
        // Bounded by MAX above, so it fits.
        Ok(GradeValue(tenths as u8))
    }

    pub fn tenths(self) -> u8 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.0) / 10.0
    }
}

impl fmt::Display for GradeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0 / 10, self.0 % 10)
    }
}

impl FromStr for GradeValue {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GradeValue::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewStudent {
    matriculation_number: String,
    first_name: String,
    last_name: String,
    date_of_birth: NaiveDate,
}

impl NewStudent {
    pub fn matriculation_number(&self) -> &str {
        &self.matriculation_number
    }

    pub fn first_name(&self) -> &str {
        &self.first_name
    }

    pub fn last_name(&self) -> &str {
        &self.last_name
    }

    pub fn date_of_birth(&self) -> NaiveDate {
        self.date_of_birth
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewExam {
    pnr: String,
    title: String,
    exam_date: NaiveDate,
    semester: String,
    degree_program: String,
}

impl NewExam {
    pub fn pnr(&self) -> &str {
        &self.pnr
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn exam_date(&self) -> NaiveDate {
        self.exam_date
    }

    pub fn semester(&self) -> &str {
        &self.semester
    }

    pub fn degree_program(&self) -> &str {
        &self.degree_program
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewGrade {
    matriculation_number: String,
    pnr: String,
    grade: GradeValue,
}

impl NewGrade {
    pub fn matriculation_number(&self) -> &str {
        &self.matriculation_number
    }

    pub fn pnr(&self) -> &str {
        &self.pnr
    }

    pub fn grade(&self) -> GradeValue {
        self.grade
    }
}

impl StudentDraft {
    /// Checks fields in form order and stops at the first problem.
    pub fn validate(self, today: NaiveDate) -> Result<NewStudent, Error> {
        let first_name = require_text("first_name", "a firstname", &self.first_name)?;
        let last_name = require_text("last_name", "a lastname", &self.last_name)?;
        let date_of_birth = self
            .date_of_birth
            .ok_or_else(|| Error::validation("date_of_birth", "Please enter a birthdate"))?;
        validate_birth_date(date_of_birth, today)?;
        let matriculation_number = normalize_matriculation_number(&self.matriculation_number)?;

        Ok(NewStudent {
            matriculation_number,
            first_name,
            last_name,
            date_of_birth,
        })
    }
}

impl ExamDraft {
    pub fn validate(self) -> Result<NewExam, Error> {
        let pnr = normalize_pnr(&self.pnr)?;
        let title = require_text("title", "an exam title", &self.title)?;
        let exam_date = self
            .exam_date
            .ok_or_else(|| Error::validation("exam_date", "Please enter an exam date"))?;
        let semester = require_selection(
            "semester",
            "a semester",
            self.semester.as_deref(),
            SEMESTER_PLACEHOLDER,
        )?;
        let degree_program = require_selection(
            "degree_program",
            "a study program",
            self.degree_program.as_deref(),
            STUDY_PROGRAM_PLACEHOLDER,
        )?;

        Ok(NewExam {
            pnr,
            title,
            exam_date,
            semester,
            degree_program,
        })
    }
}

impl GradeDraft {
    pub fn validate(self) -> Result<NewGrade, Error> {
        let student = require_selection(
            "matriculation_number",
            "a student",
            self.matriculation_number.as_deref(),
            STUDENT_PLACEHOLDER,
        )?;
        let exam = require_selection("pnr", "an exam", self.pnr.as_deref(), EXAM_PLACEHOLDER)?;
        let grade = GradeValue::parse(&self.grade)?;

        Ok(NewGrade {
            matriculation_number: normalize_matriculation_number(&student)?,
            pnr: normalize_pnr(&exam)?,
            grade,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn field_of(err: Error) -> &'static str {
        match err {
            Error::Validation { field, .. } => field,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn keys_are_zero_padded() {
        assert_eq!(normalize_matriculation_number("42").unwrap(), "0000000042");
        assert_eq!(normalize_matriculation_number(" 0000000042 ").unwrap(), "0000000042");
        assert_eq!(normalize_matriculation_number("0").unwrap(), "0000000000");
        assert_eq!(normalize_pnr("3").unwrap(), "0000000003");
        assert_eq!(normalize_pnr("9999999999").unwrap(), "9999999999");
    }

    #[test]
    fn keys_reject_non_digits_and_overflow() {
        assert!(normalize_matriculation_number("").is_err());
        assert!(normalize_matriculation_number("12a").is_err());
        assert!(normalize_matriculation_number("-1").is_err());
        assert!(normalize_matriculation_number("999999999").is_ok());
        assert!(normalize_matriculation_number("1000000000").is_err());
        assert!(normalize_pnr("10000000000").is_err());
        assert!(normalize_pnr("123456789012345678901234567890").is_err());
    }

    #[test]
    fn age_counts_completed_years() {
        let today = date(2026, 10, 15);
        assert_eq!(age_on(date(2021, 10, 15), today), 5);
        assert_eq!(age_on(date(2021, 10, 16), today), 4);
        assert_eq!(age_on(date(2021, 11, 1), today), 4);
        assert_eq!(age_on(date(1990, 1, 1), today), 36);
    }

    #[test]
    fn birth_date_bounds_are_inclusive_to_the_day() {
        let today = date(2026, 10, 15);
        assert!(validate_birth_date(date(2021, 10, 15), today).is_ok());
        assert!(validate_birth_date(date(2021, 10, 16), today).is_err());
        assert!(validate_birth_date(date(1906, 10, 15), today).is_ok());
        assert!(validate_birth_date(date(1906, 10, 14), today).is_err());
    }

    #[test]
    fn leap_day_anniversary_falls_back_to_the_28th() {
        let today = date(2025, 2, 28);
        assert!(validate_birth_date(date(2020, 2, 28), today).is_ok());
        assert!(validate_birth_date(date(2020, 2, 29), today).is_err());
    }

    #[test]
    fn grades_accept_bounds_and_comma() {
        assert_eq!(GradeValue::parse("1.0").unwrap(), GradeValue::MIN);
        assert_eq!(GradeValue::parse("6.0").unwrap(), GradeValue::MAX);
        assert_eq!(GradeValue::parse("6").unwrap(), GradeValue::MAX);
        let comma = GradeValue::parse("1,3").unwrap();
        assert_eq!(comma.tenths(), 13);
        assert_eq!(comma.to_string(), "1.3");
        assert!((comma.as_f64() - 1.3).abs() < f64::EPSILON);
    }

    #[test]
    fn grades_reject_out_of_range_and_precision() {
        for raw in ["0.9", "6.1", "", "abc", "1.25", "1.", ".5", "-1.0", "1,3,4"] {
            assert!(GradeValue::parse(raw).is_err(), "{} should be rejected", raw);
        }
    }

    #[test]
    fn selections_reject_placeholder() {
        assert!(require_selection("semester", "a semester", None, SEMESTER_PLACEHOLDER).is_err());
        assert!(require_selection("semester", "a semester", Some(" "), SEMESTER_PLACEHOLDER).is_err());
        assert!(require_selection(
            "semester",
            "a semester",
            Some(SEMESTER_PLACEHOLDER),
            SEMESTER_PLACEHOLDER
        )
        .is_err());
        assert_eq!(
            require_selection("semester", "a semester", Some("SoSe 25"), SEMESTER_PLACEHOLDER).unwrap(),
            "SoSe 25"
        );
    }

    #[test]
    fn student_draft_normalizes_and_reports_first_missing_field() {
        let today = date(2026, 10, 15);
        let draft = StudentDraft {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            date_of_birth: Some(date(1990, 1, 1)),
            matriculation_number: "7".into(),
        };
        let student = draft.clone().validate(today).unwrap();
        assert_eq!(student.matriculation_number(), "0000000007");

        let missing_last = StudentDraft {
            last_name: "  ".into(),
            ..draft.clone()
        };
        assert_eq!(field_of(missing_last.validate(today).unwrap_err()), "last_name");

        let no_birth = StudentDraft {
            date_of_birth: None,
            ..draft
        };
        assert_eq!(field_of(no_birth.validate(today).unwrap_err()), "date_of_birth");
    }

    #[test]
    fn exam_draft_requires_real_choices() {
        let draft = ExamDraft {
            pnr: "3".into(),
            title: "Algorithms".into(),
            exam_date: Some(date(2025, 6, 1)),
            semester: Some("SoSe 25".into()),
            degree_program: Some("CS (B.Sc.)".into()),
        };
        let exam = draft.clone().validate().unwrap();
        assert_eq!(exam.pnr(), "0000000003");
        assert_eq!(exam.degree_program(), "CS (B.Sc.)");

        let unselected = ExamDraft {
            degree_program: Some(STUDY_PROGRAM_PLACEHOLDER.into()),
            ..draft
        };
        assert_eq!(field_of(unselected.validate().unwrap_err()), "degree_program");
    }

    #[test]
    fn grade_draft_pads_selected_keys() {
        let grade = GradeDraft {
            matriculation_number: Some("7".into()),
            pnr: Some("0000000003".into()),
            grade: "1,7".into(),
        }
        .validate()
        .unwrap();
        assert_eq!(grade.matriculation_number(), "0000000007");
        assert_eq!(grade.pnr(), "0000000003");
        assert_eq!(grade.grade().to_string(), "1.7");

        let no_exam = GradeDraft {
            matriculation_number: Some("7".into()),
            pnr: Some(EXAM_PLACEHOLDER.into()),
            grade: "1.7".into(),
        };
        assert_eq!(field_of(no_exam.validate().unwrap_err()), "pnr");
    }
}
