pub mod config;
pub mod dashboard;
pub mod err;
pub mod io;
pub mod models;
pub mod records;
pub mod routes;
pub mod schema;
pub mod validation;
pub mod worker;

use axum::Json;
use serde::Serialize;

use crate::err::{Error, Fine, Maybe, Nothing};

pub type Payload<T> = axum::response::Result<Json<Maybe<T>>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok(Json(Fine(value)))
}

pub fn breaks<V>(err: Error) -> Payload<V>
where
    V: Serialize,
{
    Ok(Json(Nothing(err)))
}
