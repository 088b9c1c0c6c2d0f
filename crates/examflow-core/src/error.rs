//! Engine error types.
//!
//! Every failure is contained at the component that produced it. The phase
//! controller maps these into notices for the host; none of them ends a
//! session on its own.

use thiserror::Error;

/// Failure to fetch a media resource during preload.
///
/// `Clone` because one in-flight fetch is shared by every caller that asked
/// for the same URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaLoadError {
    /// The fetch did not finish within the preload timeout.
    #[error("timed out loading {url} after {secs}s")]
    Timeout { url: String, secs: u64 },

    /// The server answered with an error status.
    #[error("HTTP {status} loading {url}")]
    Http { url: String, status: u16 },

    /// Connection, DNS or body-read failure.
    #[error("network error loading {url}: {message}")]
    Transport { url: String, message: String },

    /// The fetch was cancelled by session teardown.
    #[error("load of {url} was aborted")]
    Aborted { url: String },
}

impl MediaLoadError {
    pub fn url(&self) -> &str {
        match self {
            MediaLoadError::Timeout { url, .. }
            | MediaLoadError::Http { url, .. }
            | MediaLoadError::Transport { url, .. }
            | MediaLoadError::Aborted { url } => url,
        }
    }
}

/// Inconsistencies between a test definition and its order table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataIntegrityError {
    #[error("question group '{group_id}' has no order-table entry")]
    MissingOrder { group_id: String },

    #[error("gap between '{previous}' and '{next}': expected base {expected}, found {found}")]
    Gap {
        previous: String,
        next: String,
        expected: u32,
        found: u32,
    },

    #[error("'{next}' (base {found}) overlaps '{previous}' which ends at {previous_end}")]
    Overlap {
        previous: String,
        next: String,
        previous_end: u32,
        found: u32,
    },

    #[error("'{group_id}' (base {base}, {count} questions) runs past the largest question number")]
    SpanOverflow {
        group_id: String,
        base: u32,
        count: u32,
    },
}

/// Refused navigation or answer mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NavigationError {
    #[error("question {0} does not exist")]
    NotFound(u32),

    #[error("question {0} is locked")]
    Locked(u32),

    #[error("group {0} does not exist")]
    NoSuchGroup(usize),

    #[error("cannot go back to group {target}: listening groups are closed")]
    BoundaryCrossing { target: usize },

    #[error("already at the {0} group")]
    AtEdge(&'static str),

    #[error("not available in the current phase")]
    NotNavigable,
}

/// Failure to deliver the submission payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("submission transport failed: {0}")]
    Transport(String),

    #[error("submission rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("submission payload invalid: {0}")]
    Invalid(String),
}

/// Structural problems in a test definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("test definition has no question groups")]
    NoGroups,

    #[error("question group '{0}' has no questions")]
    EmptyGroup(String),

    #[error("question group '{0}' has more than one audio file")]
    MultipleAudio(String),

    #[error("question group id '{0}' appears more than once")]
    DuplicateGroup(String),

    #[error("question '{0}' has no answer options")]
    NoAnswers(String),
}

/// The session task has stopped and no longer accepts input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("exam session has ended")]
pub struct SessionClosed;
