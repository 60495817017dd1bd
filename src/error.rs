//! Error taxonomy shared by providers, the engine, and the CLI.
//!
//! Errors are classified by who has to act on them:
//! - [`Error::User`]: the invocation does not apply (wrong state, missing
//!   parameter, unknown node). The node's pipeline aborts; others continue.
//! - [`Error::Communication`]: the control plane or API could not be
//!   reached or refused authentication. Never silently retried here.
//! - [`Error::Consistency`]: the control plane reported something the
//!   state model cannot express, or a resource disappeared mid-pipeline.

use std::time::Duration;

use colored::Colorize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The requested operation does not apply (wrong state, missing
    /// parameter, unknown node or provider).
    #[error("{0}")]
    User(String),

    /// The control plane or API is unreachable or rejected credentials.
    #[error("{0}")]
    Communication(String),

    /// The control plane returned an unrecognized or impossible answer.
    #[error("{0}")]
    Consistency(String),

    /// A disk image could not be fetched.
    #[error("cannot download {url}: {reason}")]
    Download { url: String, reason: String },

    /// A readiness wait exceeded the configured deadline.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self::Communication(message.into())
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency(message.into())
    }

    /// Whether the error is the operator's to fix rather than the system's.
    pub fn is_user(&self) -> bool {
        matches!(self, Self::User(_))
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &Error, verbose: bool) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if verbose {
        eprintln!("{} {:?}", "Detail:".yellow(), err);
    }

    match err {
        Error::Communication(_) => {
            eprintln!(
                "\n{}",
                "Hint: check the provider endpoint and credentials in the manifest.".yellow()
            );
        }
        Error::Timeout { .. } => {
            eprintln!(
                "\n{}",
                "Hint: raise or remove `readinessTimeoutSecs` in the manifest.".yellow()
            );
        }
        _ => {}
    }
}
