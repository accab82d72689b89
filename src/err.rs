#![allow(non_snake_case)]

use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;

use serde::Serialize;
use thiserror::Error as ThisError;

use crate::worker::{ConstraintKind, DbFailure};

pub async fn handler404(path: Uri) -> (StatusCode, Json<Error>) {
    (
        StatusCode::NOT_FOUND,
        Json(Error::NotFound {
            message: format!("Invalid path: {}", path),
        }),
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Maybe<T> {
    Nothing(Error),
    Fine(Success<T>),
}

pub fn Fine<V>(v: V) -> Maybe<V>
where
    V: Serialize,
{
    Maybe::Fine(Success::of(v))
}

pub fn Nothing<V>(err: Error) -> Maybe<V> {
    Maybe::Nothing(err)
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<T> IntoResponse for Maybe<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        match self {
            Maybe::Nothing(err) => Json::into_response(Json(err)),
            Maybe::Fine(success) => Json::into_response(Json(success)),
        }
    }
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

/// Every failure a caller can observe. Serialized with an `error` tag so the
/// front end can switch on the kind without parsing the message.
#[derive(Debug, Clone, Serialize, ThisError)]
#[serde(tag = "error")]
pub enum Error {
    #[error("{message}")]
    NotFound { message: String },

    /// Raised before any statement is built.
    #[error("{message}")]
    Validation { field: &'static str, message: String },

    #[error("Database unreachable: {message}")]
    Connectivity { message: String },

    #[error("A record with this key already exists ({constraint})")]
    Duplicate { constraint: String, message: String },

    #[error("This student already has a grade for this exam! Delete the grade first to update it!")]
    DuplicateGrade {
        matriculation_number: String,
        pnr: String,
    },

    #[error("Referenced record does not exist ({constraint})")]
    UnknownReference { constraint: String, message: String },

    #[error("Value rejected by constraint {constraint}")]
    CheckViolation { constraint: String, message: String },

    /// A delete that matched zero rows. Not a driver failure.
    #[error("{message}")]
    NothingMatched { message: String },

    #[error("{message}")]
    ConfigError { message: String },

    #[error("{message}")]
    DashboardError { message: String },

    #[error("{kind}: {message}")]
    InternalError { kind: &'static str, message: String },

    #[error("{message}")]
    Unknown { message: String },
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        Json::into_response(Json(self))
    }
}

impl Error {
    pub fn unknown<S: Into<String>>(msg: S) -> Error {
        Error::Unknown {
            message: msg.into(),
        }
    }

    pub fn validation<S: Into<String>>(field: &'static str, msg: S) -> Error {
        Error::Validation {
            field,
            message: msg.into(),
        }
    }

    pub fn config<S: Into<String>>(msg: S) -> Error {
        Error::ConfigError {
            message: msg.into(),
        }
    }

    pub fn nothing_matched<S: Into<String>>(msg: S) -> Error {
        Error::NothingMatched {
            message: msg.into(),
        }
    }

    /// User-caused outcomes (bad input, duplicates, empty deletes) are logged
    /// at `warn`, everything else at `error`.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::Validation { .. }
                | Error::Duplicate { .. }
                | Error::DuplicateGrade { .. }
                | Error::UnknownReference { .. }
                | Error::CheckViolation { .. }
                | Error::NothingMatched { .. }
        )
    }
}

impl From<DbFailure> for Error {
    fn from(failure: DbFailure) -> Self {
        match failure {
            DbFailure::Connectivity { message } => Error::Connectivity { message },
            DbFailure::Constraint {
                kind,
                constraint,
                message,
            } => {
                let constraint = constraint.unwrap_or_else(|| "unnamed".to_string());
                match kind {
                    ConstraintKind::Unique => Error::Duplicate {
                        constraint,
                        message,
                    },
                    ConstraintKind::ForeignKey => Error::UnknownReference {
                        constraint,
                        message,
                    },
                    ConstraintKind::Check | ConstraintKind::NotNull => Error::CheckViolation {
                        constraint,
                        message,
                    },
                }
            }
            DbFailure::Other { message } => Error::InternalError {
                kind: "DatabaseError",
                message,
            },
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::InternalError {
            kind: "IOError",
            message: io.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InternalError {
            kind: "SerializationError",
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Unknown {
            message: err.to_string(),
        }
    }
}
