pub mod retry;

pub use retry::{RetryConfig, Retryable, with_retry};
