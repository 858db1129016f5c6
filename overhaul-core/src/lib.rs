pub mod compat;
pub mod errors;
pub mod models;
pub mod payload;
pub mod protocol;
pub mod schema;
pub mod tables;

pub use errors::SyncError;

pub type SyncResult<T> = Result<T, SyncError>;
