//! Creates the database and its tables on startup. Safe to run every time.

use serde::Serialize;
use sqlx::postgres::PgConnection;
use sqlx::{ConnectOptions, Connection, Executor};

use crate::config::ConnectionSettings;
use crate::err::Error;
use crate::worker::DbFailure;

/// PostgreSQL's default names for the constraints declared below.
pub const STUDENT_PKEY: &str = "student_pkey";
pub const EXAM_PKEY: &str = "exam_pkey";
pub const GRADE_UNIQUE_STUDENT_EXAM: &str = "grade_matriculation_number_pnr_key";
pub const GRADE_STUDENT_FKEY: &str = "grade_matriculation_number_fkey";
pub const GRADE_EXAM_FKEY: &str = "grade_pnr_fkey";
pub const GRADE_RANGE_CHECK: &str = "grade_grade_check";

pub const CREATE_STUDENT_TABLE: &str = "CREATE TABLE IF NOT EXISTS student (
    matriculation_number VARCHAR(20) PRIMARY KEY,
    first_name VARCHAR(50) NOT NULL,
    last_name VARCHAR(50) NOT NULL,
    date_of_birth DATE NOT NULL
)";

pub const CREATE_EXAM_TABLE: &str = "CREATE TABLE IF NOT EXISTS exam (
    pnr VARCHAR(20) PRIMARY KEY,
    title VARCHAR(100) NOT NULL,
    exam_date DATE NOT NULL,
    semester VARCHAR(20),
    degree_program VARCHAR(100)
)";

pub const CREATE_GRADE_TABLE: &str = "CREATE TABLE IF NOT EXISTS grade (
    id SERIAL PRIMARY KEY,
    matriculation_number VARCHAR(20) NOT NULL REFERENCES student (matriculation_number) ON DELETE CASCADE,
    pnr VARCHAR(20) NOT NULL REFERENCES exam (pnr) ON DELETE CASCADE,
    grade NUMERIC(3,1) CHECK (grade BETWEEN 1.0 AND 6.0),
    grade_date DATE NOT NULL DEFAULT CURRENT_DATE,
    UNIQUE (matriculation_number, pnr)
)";

/// In dependency order.
pub const TABLES: [&str; 3] = [CREATE_STUDENT_TABLE, CREATE_EXAM_TABLE, CREATE_GRADE_TABLE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DatabaseStatus {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchemaStatus {
    pub database: DatabaseStatus,
    pub tables_ready: bool,
}

/// Quotes a database name for use in DDL, where it cannot be bound.
pub fn quote_identifier(name: &str) -> Result<String, Error> {
    if name.trim().is_empty() {
        return Err(Error::validation("database", "Please enter a database name"));
    }
    if name.contains('\0') {
        return Err(Error::validation("database", "Database name contains a NUL byte"));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Creates the target database unless it exists. Runs on a plain
/// connection to `postgres`: `CREATE DATABASE` refuses to run inside a
/// transaction, so nothing here opens one.
pub async fn ensure_database(settings: &ConnectionSettings) -> Result<DatabaseStatus, Error> {
    let quoted = quote_identifier(&settings.database)?;
    let mut conn: PgConnection = settings
        .admin_connect_options()
        .connect()
        .await
        .map_err(DbFailure::from)?;

    let existing = sqlx::query("SELECT 1 FROM pg_database WHERE datname = $1")
        .bind(&settings.database)
        .fetch_optional(&mut conn)
        .await
        .map_err(DbFailure::from)?;

    let status = if existing.is_some() {
        log::info!("Database '{}' already exists. No creation required.", settings.database);
        DatabaseStatus::AlreadyExists
    } else {
        log::info!("Database '{}' does not exist. Creating now...", settings.database);
        match conn.execute(format!("CREATE DATABASE {}", quoted).as_str()).await {
            Ok(_) => {
                log::info!("Database '{}' created successfully.", settings.database);
                DatabaseStatus::Created
            }
            // Someone else created it between the lookup and here.
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("42P04") => {
                DatabaseStatus::AlreadyExists
            }
            Err(err) => return Err(DbFailure::from(err).into()),
        }
    };

    conn.close().await.map_err(DbFailure::from)?;
    Ok(status)
}

pub async fn ensure_tables(settings: &ConnectionSettings) -> Result<(), Error> {
    let mut conn: PgConnection = settings
        .connect_options()
        .connect()
        .await
        .map_err(DbFailure::from)?;
    for ddl in TABLES {
        conn.execute(ddl).await.map_err(DbFailure::from)?;
    }
    conn.close().await.map_err(DbFailure::from)?;
    log::info!("Tables student, exam and grade are ready in '{}'", settings.database);
    Ok(())
}

/// Both provisioning steps. The caller decides whether a failure means
/// running without a database.
pub async fn prepare_database(settings: &ConnectionSettings) -> Result<SchemaStatus, Error> {
    let database = ensure_database(settings).await?;
    ensure_tables(settings).await?;
    Ok(SchemaStatus {
        database,
        tables_ready: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted_and_escaped() {
        assert_eq!(quote_identifier("db_exam_management").unwrap(), "\"db_exam_management\"");
        assert_eq!(quote_identifier("we\"ird").unwrap(), "\"we\"\"ird\"");
        assert!(quote_identifier("  ").is_err());
        assert!(quote_identifier("bad\0name").is_err());
    }

    #[test]
    fn grade_table_is_created_last() {
        assert!(TABLES[2].contains("CREATE TABLE IF NOT EXISTS grade"));
        assert!(TABLES[2].contains("ON DELETE CASCADE"));
        assert!(TABLES[2].contains("UNIQUE (matriculation_number, pnr)"));
        assert!(TABLES.iter().all(|ddl| ddl.contains("IF NOT EXISTS")));
    }

    #[tokio::test]
    async fn unreachable_server_is_reported_not_fatal() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings = ConnectionSettings {
            username: "nobody".into(),
            host: "127.0.0.1".into(),
            port,
            ..ConnectionSettings::default()
        };
        assert!(matches!(
            prepare_database(&settings).await,
            Err(Error::Connectivity { .. })
        ));
    }
}
