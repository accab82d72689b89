//! Student, exam and grade operations on top of the worker pool.
//!
//! Each function validates first and only then submits a statement, so a
//! validation error never costs a connection.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::err::Error;
use crate::models::{Exam, ExamDraft, GradeDraft, GradeEntry, IdPreview, Student, StudentDraft};
use crate::schema::GRADE_UNIQUE_STUDENT_EXAM;
use crate::validation::{
    normalize_matriculation_number, normalize_pnr, KEY_WIDTH, MAX_MATRICULATION_NUMBER, MAX_PNR,
};
use crate::worker::{Row, SqlParam, SqlValue, Statement, WorkerOutcome, WorkerPool};

const INSERT_STUDENT: &str = "INSERT INTO student (matriculation_number, first_name, last_name, date_of_birth) \
     VALUES ($1, $2, $3, $4)";
const INSERT_EXAM: &str = "INSERT INTO exam (pnr, title, exam_date, semester, degree_program) \
     VALUES ($1, $2, $3, $4, $5)";
const INSERT_GRADE: &str = "INSERT INTO grade (matriculation_number, pnr, grade, grade_date) \
     VALUES ($1, $2, $3, CURRENT_DATE)";

const DELETE_STUDENT: &str = "DELETE FROM student WHERE matriculation_number = $1";
const DELETE_EXAM: &str = "DELETE FROM exam WHERE pnr = $1";
const DELETE_GRADE: &str = "DELETE FROM grade WHERE matriculation_number = $1 AND pnr = $2";

const SELECT_STUDENTS: &str = "SELECT matriculation_number, first_name, last_name, date_of_birth FROM student";
const SELECT_EXAMS: &str = "SELECT pnr, title, exam_date, semester, degree_program FROM exam";
const SELECT_GRADES: &str = "SELECT g.matriculation_number, s.last_name, s.first_name, g.pnr, e.title, \
     g.grade::float8, g.grade_date \
     FROM grade g \
     JOIN student s ON s.matriculation_number = g.matriculation_number \
     JOIN exam e ON e.pnr = g.pnr \
     ORDER BY s.last_name, s.first_name, e.title";

const LAST_MATRICULATION_NUMBER: &str = "SELECT MAX(matriculation_number) FROM student";
const LAST_PNR: &str = "SELECT MAX(pnr) FROM exam";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudentOrder {
    /// For "pick a person" lists.
    #[default]
    Alphabetical,
    /// Highest matriculation number first.
    Recent,
}

impl StudentOrder {
    fn order_by(self) -> &'static str {
        match self {
            StudentOrder::Alphabetical => " ORDER BY last_name, first_name, matriculation_number",
            StudentOrder::Recent => " ORDER BY matriculation_number DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteReport {
    pub key: String,
    pub rows_affected: u64,
    pub message: String,
}

fn rows(outcome: WorkerOutcome) -> Result<Vec<Row>, Error> {
    match outcome {
        WorkerOutcome::Rows(rows) => Ok(rows),
        WorkerOutcome::Failed(failure) => Err(failure.into()),
        WorkerOutcome::Written { .. } => Err(Error::InternalError {
            kind: "WorkerError",
            message: "expected rows from a fetch statement".to_string(),
        }),
    }
}

fn rows_affected(outcome: WorkerOutcome) -> Result<u64, Error> {
    match outcome {
        WorkerOutcome::Written { rows_affected } => Ok(rows_affected),
        WorkerOutcome::Failed(failure) => Err(failure.into()),
        WorkerOutcome::Rows(_) => Err(Error::InternalError {
            kind: "WorkerError",
            message: "expected a row count from a write statement".to_string(),
        }),
    }
}

pub async fn create_student(pool: &WorkerPool, draft: StudentDraft, today: NaiveDate) -> Result<WriteReport, Error> {
    let student = draft.validate(today)?;
    let statement = Statement::write(
        INSERT_STUDENT,
        vec![
            student.matriculation_number().into(),
            student.first_name().into(),
            student.last_name().into(),
            student.date_of_birth().into(),
        ],
    );
    let rows_affected = rows_affected(pool.run(statement).await)?;
    Ok(WriteReport {
        key: student.matriculation_number().to_string(),
        rows_affected,
        message: format!(
            "Saved student {} {} ({})",
            student.first_name(),
            student.last_name(),
            student.matriculation_number()
        ),
    })
}

pub async fn create_exam(pool: &WorkerPool, draft: ExamDraft) -> Result<WriteReport, Error> {
    let exam = draft.validate()?;
    let statement = Statement::write(
        INSERT_EXAM,
        vec![
            exam.pnr().into(),
            exam.title().into(),
            exam.exam_date().into(),
            exam.semester().into(),
            exam.degree_program().into(),
        ],
    );
    let rows_affected = rows_affected(pool.run(statement).await)?;
    Ok(WriteReport {
        key: exam.pnr().to_string(),
        rows_affected,
        message: format!("Created exam {} ({})", exam.title(), exam.pnr()),
    })
}

/// Inserts with today's date as `grade_date`. A second grade for the same
/// student and exam is rejected; delete the old one first.
pub async fn create_grade(pool: &WorkerPool, draft: GradeDraft) -> Result<WriteReport, Error> {
    let grade = draft.validate()?;
    let statement = Statement::write(
        INSERT_GRADE,
        vec![
            grade.matriculation_number().into(),
            grade.pnr().into(),
            grade.grade().as_f64().into(),
        ],
    );
    match pool.run(statement).await {
        WorkerOutcome::Failed(failure) if failure.violates_unique(GRADE_UNIQUE_STUDENT_EXAM) => {
            Err(Error::DuplicateGrade {
                matriculation_number: grade.matriculation_number().to_string(),
                pnr: grade.pnr().to_string(),
            })
        }
        outcome => Ok(WriteReport {
            key: format!("{}/{}", grade.matriculation_number(), grade.pnr()),
            rows_affected: rows_affected(outcome)?,
            message: format!(
                "Saved grade {} for student {} in exam {}",
                grade.grade(),
                grade.matriculation_number(),
                grade.pnr()
            ),
        }),
    }
}

/// Removes the student and, through the foreign key, all of their grades.
pub async fn delete_student(pool: &WorkerPool, matriculation_number: &str) -> Result<WriteReport, Error> {
    let key = normalize_matriculation_number(matriculation_number)?;
    let statement = Statement::write(DELETE_STUDENT, vec![key.as_str().into()]);
    let rows_affected = rows_affected(pool.run(statement).await)?;
    if rows_affected == 0 {
        return Err(Error::nothing_matched(format!(
            "There is no student with mat. no {}",
            key
        )));
    }
    Ok(WriteReport {
        message: format!("student with mat. no {} deleted successfully", key),
        key,
        rows_affected,
    })
}

pub async fn delete_exam(pool: &WorkerPool, pnr: &str) -> Result<WriteReport, Error> {
    let key = normalize_pnr(pnr)?;
    let statement = Statement::write(DELETE_EXAM, vec![key.as_str().into()]);
    let rows_affected = rows_affected(pool.run(statement).await)?;
    if rows_affected == 0 {
        return Err(Error::nothing_matched(format!("There is no exam with pnr {}", key)));
    }
    Ok(WriteReport {
        message: format!("exam with pnr {} deleted successfully", key),
        key,
        rows_affected,
    })
}

pub async fn delete_grade(pool: &WorkerPool, matriculation_number: &str, pnr: &str) -> Result<WriteReport, Error> {
    let student = normalize_matriculation_number(matriculation_number)?;
    let exam = normalize_pnr(pnr)?;
    let statement = Statement::write(
        DELETE_GRADE,
        vec![student.as_str().into(), exam.as_str().into()],
    );
    let rows_affected = rows_affected(pool.run(statement).await)?;
    if rows_affected == 0 {
        return Err(Error::nothing_matched(
            "the selected student does not have a grade for the selected exam!",
        ));
    }
    Ok(WriteReport {
        message: format!(
            "grade for student with mat. no. {} for exam with pnr {} deleted successfully",
            student, exam
        ),
        key: format!("{}/{}", student, exam),
        rows_affected,
    })
}

pub async fn list_students(pool: &WorkerPool, order: StudentOrder) -> Result<Vec<Student>, Error> {
    let statement = Statement::fetch(format!("{}{}", SELECT_STUDENTS, order.order_by()), vec![]);
    rows(pool.run(statement).await)?
        .iter()
        .map(Student::try_from)
        .collect()
}

pub async fn find_student(pool: &WorkerPool, matriculation_number: &str) -> Result<Student, Error> {
    let key = normalize_matriculation_number(matriculation_number)?;
    let statement = Statement::fetch(
        format!("{} WHERE matriculation_number = $1", SELECT_STUDENTS),
        vec![key.as_str().into()],
    );
    match rows(pool.run(statement).await)?.first() {
        Some(row) => Student::try_from(row),
        None => Err(Error::NotFound {
            message: format!("There is no student with mat. no {}", key),
        }),
    }
}

pub async fn list_exams(pool: &WorkerPool) -> Result<Vec<Exam>, Error> {
    let statement = Statement::fetch(format!("{} ORDER BY title, pnr", SELECT_EXAMS), vec![]);
    rows(pool.run(statement).await)?
        .iter()
        .map(Exam::try_from)
        .collect()
}

pub async fn find_exam(pool: &WorkerPool, pnr: &str) -> Result<Exam, Error> {
    let key = normalize_pnr(pnr)?;
    let statement = Statement::fetch(format!("{} WHERE pnr = $1", SELECT_EXAMS), vec![key.as_str().into()]);
    match rows(pool.run(statement).await)?.first() {
        Some(row) => Exam::try_from(row),
        None => Err(Error::NotFound {
            message: format!("There is no exam with pnr {}", key),
        }),
    }
}

pub async fn list_grades(pool: &WorkerPool) -> Result<Vec<GradeEntry>, Error> {
    rows(pool.run(Statement::fetch(SELECT_GRADES, vec![])).await)?
        .iter()
        .map(GradeEntry::try_from)
        .collect()
}

pub async fn last_matriculation_number(pool: &WorkerPool) -> Result<IdPreview, Error> {
    let last = max_key(pool, LAST_MATRICULATION_NUMBER).await?;
    preview(last, MAX_MATRICULATION_NUMBER)
}

pub async fn last_pnr(pool: &WorkerPool) -> Result<IdPreview, Error> {
    let last = max_key(pool, LAST_PNR).await?;
    preview(last, MAX_PNR)
}

async fn max_key(pool: &WorkerPool, sql: &str) -> Result<Option<String>, Error> {
    let rows = rows(pool.run(Statement::fetch(sql, Vec::<SqlParam>::new())).await)?;
    Ok(rows
        .first()
        .and_then(|row| row.first())
        .and_then(SqlValue::as_text)
        .map(str::to_string))
}

/// `next` is `last + 1`, or the first key on an empty table. Keys at the
/// upper bound have no successor; `next` then repeats `last`.
pub fn preview(last: Option<String>, max: u64) -> Result<IdPreview, Error> {
    let next = match &last {
        None => 1,
        Some(key) => {
            let value: u64 = key.trim().parse().map_err(|_| Error::InternalError {
                kind: "DecodeError",
                message: format!("stored key '{}' is not numeric", key),
            })?;
            value.saturating_add(1).min(max)
        }
    };
    Ok(IdPreview {
        last,
        next: format!("{:0width$}", next, width = KEY_WIDTH),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_counts_up_from_last_key() {
        let preview = preview(Some("0000000041".into()), MAX_MATRICULATION_NUMBER).unwrap();
        assert_eq!(preview.next, "0000000042");
        assert_eq!(preview.last.as_deref(), Some("0000000041"));
    }

    #[test]
    fn preview_on_empty_table_starts_at_one() {
        let preview = preview(None, MAX_PNR).unwrap();
        assert_eq!(preview.next, "0000000001");
        assert_eq!(preview.last, None);
    }

    #[test]
    fn preview_stops_at_upper_bound() {
        let preview = preview(Some("0999999999".into()), MAX_MATRICULATION_NUMBER).unwrap();
        assert_eq!(preview.next, "0999999999");
    }

    #[test]
    fn preview_rejects_non_numeric_keys() {
        assert!(preview(Some("abc".into()), MAX_PNR).is_err());
    }

    #[test]
    fn student_order_defaults_to_alphabetical() {
        assert_eq!(StudentOrder::default(), StudentOrder::Alphabetical);
        assert!(StudentOrder::Recent.order_by().contains("DESC"));
    }

    #[test]
    fn outcome_shape_mismatch_is_internal() {
        assert_eq!(rows_affected(WorkerOutcome::Written { rows_affected: 0 }).unwrap(), 0);
        assert!(matches!(
            rows(WorkerOutcome::Written { rows_affected: 1 }),
            Err(Error::InternalError { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_input_never_reaches_the_pool() {
        // Points at nothing; any submitted statement would fail as Connectivity.
        let pool = WorkerPool::new(Default::default(), 1);
        let today = NaiveDate::from_ymd_opt(2026, 10, 15).unwrap();

        let err = create_student(&pool, StudentDraft::default(), today).await.unwrap_err();
        assert!(matches!(err, Error::Validation { field: "first_name", .. }));

        let err = delete_grade(&pool, "7", "").await.unwrap_err();
        assert!(matches!(err, Error::Validation { field: "pnr", .. }));

        let err = create_grade(
            &pool,
            GradeDraft {
                matriculation_number: Some("7".into()),
                pnr: Some("3".into()),
                grade: "6,1".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "grade", .. }));
    }
}
