pub mod backoff;
pub mod fingerprint;

pub use backoff::{RetryPolicy, retry_with_backoff};
pub use fingerprint::Fingerprinter;
