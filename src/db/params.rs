//! Typed parameter binding for relational statements.
//!
//! Statement text is never rewritten; every [`QueryParam`] travels to the server as a
//! bind argument, in order.

use crate::models::{QueryParam, Statement};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

macro_rules! bound_query {
    ($lt:lifetime, $name:ident, $db:ty, $args:ty, |$json:ident| $encode_json:expr) => {
        /// Prepare the statement with all of its parameters bound.
        pub(crate) fn $name<$lt>(statement: &$lt Statement) -> Query<$lt, $db, $args> {
            statement
                .params
                .iter()
                .fold(sqlx::query(&statement.text), |query, param| match param {
                    QueryParam::Null => query.bind(None::<String>),
                    QueryParam::Bool(v) => query.bind(*v),
                    QueryParam::Int(v) => query.bind(*v),
                    QueryParam::Float(v) => query.bind(*v),
                    QueryParam::String(v) => query.bind(v.as_str()),
                    QueryParam::Bytes(v) => query.bind(v.as_slice()),
                    QueryParam::Json($json) => query.bind($encode_json),
                })
        }
    };
}

bound_query!('q, mysql_query, MySql, MySqlArguments, |v| Json(v));
bound_query!('q, postgres_query, Postgres, PgArguments, |v| Json(v));
// No native JSON type; stored as text
bound_query!('q, sqlite_query, Sqlite, SqliteArguments<'q>, |v| v.to_string());
