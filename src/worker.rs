//! One-shot execution of a single parameterized statement.
//!
//! Every submitted [`Statement`] runs on its own tokio task with its own
//! connection. The pool only bounds how many run at once; it does not order,
//! batch or retry them. Ordering between concurrent writes is whatever the
//! database decides.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::postgres::{PgArguments, PgConnection, PgDatabaseError, PgRow};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Connection, Postgres, Row as _, TypeInfo};
use thiserror::Error as ThisError;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ConnectionSettings;

/// A value bound to a `$n` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
    Null,
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<NaiveDate> for SqlParam {
    fn from(value: NaiveDate) -> Self {
        SqlParam::Date(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Float(value)
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlParam::Null)
    }
}

/// A decoded result cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    Null,
}

impl SqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            SqlValue::Date(date) => Some(*date),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            SqlValue::Float(value) => Some(*value),
            SqlValue::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

pub type Row = Vec<SqlValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Rows are expected back.
    Fetch,
    /// Only the affected row count matters; runs in a transaction that is committed.
    Write,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlParam>,
    pub mode: Mode,
}

impl Statement {
    pub fn fetch<S: Into<String>>(sql: S, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
            mode: Mode::Fetch,
        }
    }

    pub fn write<S: Into<String>>(sql: S, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
            mode: Mode::Write,
        }
    }

    fn summary(&self) -> String {
        let first_line = self.sql.trim().lines().next().unwrap_or_default();
        format!("{:?} `{}` ({} params)", self.mode, first_line.trim(), self.params.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    Check,
    NotNull,
}

impl ConstraintKind {
    fn from_sqlstate(code: &str) -> Option<Self> {
        match code {
            "23505" => Some(ConstraintKind::Unique),
            "23503" => Some(ConstraintKind::ForeignKey),
            "23514" => Some(ConstraintKind::Check),
            "23502" => Some(ConstraintKind::NotNull),
            _ => None,
        }
    }
}

/// Why a statement did not go through, classified from the SQLSTATE and the
/// constraint name reported by the server.
#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum DbFailure {
    #[error("{message}")]
    Connectivity { message: String },
    #[error("{message}")]
    Constraint {
        kind: ConstraintKind,
        constraint: Option<String>,
        message: String,
    },
    #[error("{message}")]
    Other { message: String },
}

impl DbFailure {
    pub fn other<S: Into<String>>(message: S) -> Self {
        DbFailure::Other {
            message: message.into(),
        }
    }

    /// True when the failure is a unique violation of exactly `name`.
    pub fn violates_unique(&self, name: &str) -> bool {
        matches!(
            self,
            DbFailure::Constraint {
                kind: ConstraintKind::Unique,
                constraint: Some(constraint),
                ..
            } if constraint == name
        )
    }
}

fn is_connectivity_sqlstate(code: &str) -> bool {
    // 08: connection exception, 28: invalid authorization,
    // 3D000: unknown database, 57P0x: server shutting down / not accepting.
    code.starts_with("08")
        || code.starts_with("28")
        || code == "3D000"
        || matches!(code, "57P01" | "57P02" | "57P03")
}

impl From<sqlx::Error> for DbFailure {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                let code = db_err.code().map(|code| code.into_owned()).unwrap_or_default();
                if is_connectivity_sqlstate(&code) {
                    return DbFailure::Connectivity { message };
                }
                match ConstraintKind::from_sqlstate(&code) {
                    Some(kind) => DbFailure::Constraint {
                        kind,
                        constraint: db_err
                            .try_downcast_ref::<PgDatabaseError>()
                            .and_then(|pg| pg.constraint())
                            .map(str::to_string),
                        message,
                    },
                    None => DbFailure::Other { message },
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Configuration(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => DbFailure::Connectivity {
                message: err.to_string(),
            },
            _ => DbFailure::Other {
                message: err.to_string(),
            },
        }
    }
}

/// Result of one worker run. Errors never escape a worker; they arrive here.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Rows(Vec<Row>),
    Written { rows_affected: u64 },
    Failed(DbFailure),
}

impl WorkerOutcome {
    pub fn success(&self) -> bool {
        !matches!(self, WorkerOutcome::Failed(_))
    }

    pub fn message(&self) -> String {
        match self {
            WorkerOutcome::Rows(_) => String::new(),
            WorkerOutcome::Written { .. } => "Success !".to_string(),
            WorkerOutcome::Failed(failure) => format!("Error: {}", failure),
        }
    }

    pub fn rows_affected(&self) -> u64 {
        match self {
            WorkerOutcome::Written { rows_affected } => *rows_affected,
            _ => 0,
        }
    }
}

/// Runs statements on tokio tasks, at most `max_workers` at a time.
#[derive(Clone)]
pub struct WorkerPool {
    settings: Arc<RwLock<ConnectionSettings>>,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(settings: ConnectionSettings, max_workers: usize) -> Self {
        Self {
            settings: Arc::new(RwLock::new(settings)),
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    /// Tasks submitted after this call connect with `settings`.
    pub async fn reconfigure(&self, settings: ConnectionSettings) {
        *self.settings.write().await = settings;
    }

    pub async fn settings(&self) -> ConnectionSettings {
        self.settings.read().await.clone()
    }

    pub fn submit(&self, statement: Statement) -> JoinHandle<WorkerOutcome> {
        let settings = Arc::clone(&self.settings);
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return WorkerOutcome::Failed(DbFailure::other("worker pool is closed")),
            };
            let settings = settings.read().await.clone();
            let id = Uuid::new_v4();
            log::debug!("worker {} started: {}", id, statement.summary());

            // A panic inside the statement task surfaces as a JoinError here
            // instead of tearing down the caller.
            let outcome = match tokio::spawn(run(settings, statement)).await {
                Ok(outcome) => outcome,
                Err(err) => WorkerOutcome::Failed(DbFailure::other(format!("worker aborted: {}", err))),
            };

            match &outcome {
                WorkerOutcome::Failed(failure) => log::warn!("worker {} failed: {}", id, failure),
                WorkerOutcome::Rows(rows) => log::debug!("worker {} fetched {} rows", id, rows.len()),
                WorkerOutcome::Written { rows_affected } => {
                    log::debug!("worker {} affected {} rows", id, rows_affected)
                }
            }
            outcome
        })
    }

    /// Submits and waits for the outcome.
    pub async fn run(&self, statement: Statement) -> WorkerOutcome {
        match self.submit(statement).await {
            Ok(outcome) => outcome,
            Err(err) => WorkerOutcome::Failed(DbFailure::other(format!("worker aborted: {}", err))),
        }
    }

    /// Submits and hands the outcome to `callback` once the statement finished.
    pub fn submit_with<F>(&self, statement: Statement, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(WorkerOutcome) + Send + 'static,
    {
        let handle = self.submit(statement);
        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(err) => WorkerOutcome::Failed(DbFailure::other(format!("worker aborted: {}", err))),
            };
            callback(outcome);
        })
    }
}

async fn run(settings: ConnectionSettings, statement: Statement) -> WorkerOutcome {
    match execute(&settings, &statement).await {
        Ok(outcome) => outcome,
        Err(err) => WorkerOutcome::Failed(DbFailure::from(err)),
    }
}

async fn execute(settings: &ConnectionSettings, statement: &Statement) -> Result<WorkerOutcome, sqlx::Error> {
    let mut conn: PgConnection = settings.connect_options().connect().await?;
    let outcome = match statement.mode {
        Mode::Fetch => {
            let rows = bind_params(sqlx::query(&statement.sql), &statement.params)
                .fetch_all(&mut conn)
                .await?;
            WorkerOutcome::Rows(rows.iter().map(decode_row).collect::<Result<_, _>>()?)
        }
        Mode::Write => {
            let mut tx = conn.begin().await?;
            let done = bind_params(sqlx::query(&statement.sql), &statement.params)
                .execute(&mut tx)
                .await?;
            tx.commit().await?;
            WorkerOutcome::Written {
                rows_affected: done.rows_affected(),
            }
        }
    };
    conn.close().await?;
    Ok(outcome)
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Text(value) => query.bind(value.as_str()),
            SqlParam::Integer(value) => query.bind(*value),
            SqlParam::Float(value) => query.bind(*value),
            SqlParam::Date(value) => query.bind(*value),
            SqlParam::Null => query.bind(Option::<String>::None),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<Row, sqlx::Error> {
    (0..row.columns().len())
        .map(|index| decode_cell(row, index))
        .collect()
}

fn decode_cell(row: &PgRow, index: usize) -> Result<SqlValue, sqlx::Error> {
    let type_name = row.columns()[index].type_info().name().to_ascii_uppercase();
    let value = match type_name.as_str() {
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
            row.try_get::<Option<String>, _>(index)?.map(SqlValue::Text)
        }
        "INT2" => row
            .try_get::<Option<i16>, _>(index)?
            .map(|v| SqlValue::Integer(v.into())),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)?
            .map(|v| SqlValue::Integer(v.into())),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(SqlValue::Integer),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)?
            .map(|v| SqlValue::Float(v.into())),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(SqlValue::Float),
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(SqlValue::Bool),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(index)?.map(SqlValue::Date),
        other => {
            return Err(sqlx::Error::Decode(
                format!("unsupported column type {} at index {}; cast it in the query", other, index).into(),
            ))
        }
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

/// Opens and closes one connection to the configured database.
pub async fn test_connection(settings: &ConnectionSettings) -> Result<(), DbFailure> {
    let conn: PgConnection = settings.connect_options().connect().await?;
    conn.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_values_bind_as_null() {
        assert_eq!(SqlParam::from(None::<String>), SqlParam::Null);
        assert_eq!(SqlParam::from(Some("SoSe 25")), SqlParam::Text("SoSe 25".into()));
    }

    #[test]
    fn constraint_kinds_follow_sqlstate() {
        assert_eq!(ConstraintKind::from_sqlstate("23505"), Some(ConstraintKind::Unique));
        assert_eq!(ConstraintKind::from_sqlstate("23503"), Some(ConstraintKind::ForeignKey));
        assert_eq!(ConstraintKind::from_sqlstate("23514"), Some(ConstraintKind::Check));
        assert_eq!(ConstraintKind::from_sqlstate("42P01"), None);
    }

    #[test]
    fn authentication_failures_count_as_connectivity() {
        assert!(is_connectivity_sqlstate("28P01"));
        assert!(is_connectivity_sqlstate("08006"));
        assert!(is_connectivity_sqlstate("3D000"));
        assert!(!is_connectivity_sqlstate("23505"));
    }

    #[test]
    fn unique_violation_matches_by_constraint_name() {
        let failure = DbFailure::Constraint {
            kind: ConstraintKind::Unique,
            constraint: Some("grade_matriculation_number_pnr_key".into()),
            message: "duplicate key value violates unique constraint".into(),
        };
        assert!(failure.violates_unique("grade_matriculation_number_pnr_key"));
        assert!(!failure.violates_unique("student_pkey"));
    }

    #[test]
    fn outcome_reports_success_flag_and_message() {
        let written = WorkerOutcome::Written { rows_affected: 1 };
        assert!(written.success());
        assert_eq!(written.message(), "Success !");
        assert_eq!(written.rows_affected(), 1);

        let failed = WorkerOutcome::Failed(DbFailure::other("boom"));
        assert!(!failed.success());
        assert_eq!(failed.message(), "Error: boom");
        assert_eq!(failed.rows_affected(), 0);
    }

    #[test]
    fn io_errors_are_connectivity_failures() {
        let err = sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"));
        assert!(matches!(DbFailure::from(err), DbFailure::Connectivity { .. }));
    }

    #[tokio::test]
    async fn unreachable_server_fails_without_panicking() {
        // Nothing listens on a port we just released.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings = ConnectionSettings {
            username: "nobody".into(),
            host: "127.0.0.1".into(),
            port,
            ..ConnectionSettings::default()
        };
        let pool = WorkerPool::new(settings, 2);

        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.submit_with(Statement::fetch("SELECT 1", vec![]), move |outcome| {
            let _ = tx.send(outcome);
        });
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::Failed(DbFailure::Connectivity { .. })));
    }
}
