//! Session dispatch macros for reducing code duplication.
//!
//! The relational session is an enum over the three sqlx connection types. Most session
//! calls are textually identical across backends; these macros expand the repetitive
//! match statements at compile time.

/// Macro for generating match arms over `SqlSession` variants.
///
/// # Example
///
/// ```ignore
/// sql_dispatch!(session, {
///     MySql(c) => do_mysql(c),
///     Postgres(c) => do_postgres(c),
///     SQLite(c) => do_sqlite(c),
/// });
/// ```
macro_rules! sql_dispatch {
    ($session:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $session {
            $(
                $crate::db::sql::SqlSession::$variant($c) => $body,
            )+
        }
    };
}

/// Same body for every backend.
macro_rules! sql_dispatch_all {
    ($session:expr, $c:ident => $body:expr) => {
        $crate::db::macros::sql_dispatch!($session, {
            MySql($c) => $body,
            Postgres($c) => $body,
            SQLite($c) => $body,
        })
    };
}

pub(crate) use {sql_dispatch, sql_dispatch_all};
