pub mod types;

pub use types::{AppError, PushError, SourceError, StoreError};

/// Convenience alias used throughout the crate.
pub type AppResult<T> = Result<T, AppError>;
