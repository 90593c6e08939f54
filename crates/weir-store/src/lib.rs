//! Durable persistence. One SQLite database holds workflow definitions,
//! runs, node runs, and approvals; every engine transition is written here
//! before anything acts on it.

mod store;

pub use store::SqliteRunStore;
