//! Application database adapter (spec.md §3, §4.4): hosts user-defined
//! transactions and the `transaction_outputs` table colocated with the
//! user's own schema, so recording a transaction's checkpoint commits
//! atomically with its effects.

mod memory;
mod mysql;
mod postgres;
mod session;
mod store;

pub use memory::InMemoryApplicationDatabase;
pub use mysql::MySqlApplicationDatabase;
pub use postgres::PostgresApplicationDatabase;
pub use session::SqlSession;
pub use store::{ApplicationDatabase, IsolationLevel, RecordedResult, TransactionOutputInsert};
