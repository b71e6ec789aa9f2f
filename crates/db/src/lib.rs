pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, open_store, DbPool, OpenStoreError};
pub use repositories::{RepositoryError, SqlIdempotencyStore, SqlRateCounterStore};
