//! # pooldeploy-sync
//!
//! File-level primitives used by the deployment pipeline.
//!
//! [`digest`] fingerprints changed files for change records, and
//! [`transfer`] copies or deletes deployment files with a bounded retry
//! policy.

pub mod digest;
pub mod error;
pub mod transfer;

pub use error::TransferError;
pub use transfer::{retry, Attempted, CancelFlag, FileTransfer, RetryPolicy, RetryingTransfer};
