//! Dialect tags and the per-dialect expressions the system/application
//! database adapters splice into their SQL. Kept as data, not code, per
//! spec.md §6: the core never branches on dialect anywhere except here.

use serde::{Deserialize, Serialize};

/// The relational dialect a [`crate::system_db::SystemDatabase`] or
/// [`crate::app_db::ApplicationDatabase`] talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    MySql,
}

/// SQL fragments that differ by dialect, captured once instead of
/// scattered through query strings.
#[derive(Debug, Clone, Copy)]
pub struct Expressions {
    /// Expression yielding the current wall-clock time in epoch
    /// milliseconds.
    pub epoch_millis: &'static str,
    /// Expression yielding a fresh UUID as text.
    pub gen_uuid: &'static str,
    /// SQLSTATE that signals a unique-constraint violation.
    pub unique_violation_code: &'static str,
}

pub const POSTGRES: Expressions = Expressions {
    epoch_millis: "(EXTRACT(EPOCH FROM NOW()) * 1000)::bigint",
    gen_uuid: "gen_random_uuid()::text",
    unique_violation_code: "23505",
};

pub const MYSQL: Expressions = Expressions {
    epoch_millis: "(UNIX_TIMESTAMP(NOW(3)) * 1000)",
    gen_uuid: "(UUID())",
    unique_violation_code: "23505",
};

impl Dialect {
    pub fn expressions(self) -> Expressions {
        match self {
            Dialect::Postgres => POSTGRES,
            Dialect::MySql => MYSQL,
        }
    }

    /// Expression capturing the database-native transaction identifier,
    /// read from inside the transaction itself (spec.md §3 invariant 5).
    pub fn current_txid_expr(self) -> &'static str {
        match self {
            Dialect::Postgres => "(select pg_current_xact_id_if_assigned()::text)",
            Dialect::MySql => {
                "(SELECT TRX_ID FROM INFORMATION_SCHEMA.INNODB_TRX WHERE TRX_MYSQL_THREAD_ID = CONNECTION_ID())"
            }
        }
    }
}
