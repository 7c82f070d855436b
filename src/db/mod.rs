pub mod models;
pub mod retry;
pub mod store;

pub use store::{SqliteStore, Store};
