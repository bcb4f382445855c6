//! HTTP attempt mechanics: client, error taxonomy, and retry scheduling.
//!
//! The per-attempt state machine itself (§4.6) lives in [`crate::worker`],
//! which composes these pieces with the governors and broadcaster.

mod client;
mod error;
mod retry;

pub use client::{detect_login_redirect, HttpClient, BROWSER_USER_AGENT};
pub use error::DownloadError;
pub use retry::{classify_error, FailureType, RetryDecision, RetryPolicy};
