pub mod idempotency;
pub mod records;
pub mod session;
