//! The live transaction handle bound to `ExecutionContext::sql_session`
//! while a transaction's body runs (spec.md §4.1, §4.2).

use sqlx::{MySql, Postgres, Transaction};

/// A dialect-erased handle to the application database's open
/// transaction. User transaction bodies downcast to the concrete dialect
/// they expect via [`SqlSession::as_postgres`]/[`SqlSession::as_mysql`].
pub enum SqlSession {
    Postgres(Transaction<'static, Postgres>),
    MySql(Transaction<'static, MySql>),
    /// Used only by [`crate::app_db::InMemoryApplicationDatabase`] in
    /// tests, where there is no real connection to borrow.
    Memory,
}

impl SqlSession {
    pub fn as_postgres_mut(&mut self) -> Option<&mut Transaction<'static, Postgres>> {
        match self {
            SqlSession::Postgres(tx) => Some(tx),
            _ => None,
        }
    }

    pub fn as_mysql_mut(&mut self) -> Option<&mut Transaction<'static, MySql>> {
        match self {
            SqlSession::MySql(tx) => Some(tx),
            _ => None,
        }
    }
}
