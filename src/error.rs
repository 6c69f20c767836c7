use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::demarcator::Response;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not launch `{}`: {source}", executable.display())]
    Launch {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("engine channel is closed")]
    ChannelClosed,

    #[error("engine exited before answering{}: {stderr}", status.map(|s| format!(" (exit code {s})")).unwrap_or_default())]
    EngineCrashed {
        status: Option<i32>,
        /// Whatever the engine printed before it went away.
        partial: String,
        stderr: String,
    },

    #[error("no response from the engine within {}ms", elapsed.as_millis())]
    ChannelTimeout { elapsed: Duration, partial: String },

    #[error("prerequisite `{}` failed: {}", response.command.text(), response.summary())]
    PrerequisiteFailed { response: Box<Response> },

    #[error("`{}` failed: {}", response.command.text(), response.summary())]
    CommandFailed { response: Box<Response> },

    #[error("`{command}` needs a computed result; run a simulation or check first")]
    NoResult { command: String },

    #[error(
        "malformed trace{}: {reason}",
        line.map(|n| format!(" at line {n}")).unwrap_or_default()
    )]
    MalformedTrace {
        /// `None` when the text had no lines at all.
        line: Option<usize>,
        reason: String,
    },

    #[error("malformed engine output: {0}")]
    MalformedOutput(String),

    #[error("no timed-out command to wait for")]
    NothingPending,

    #[error("invalid classification pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors after which the session's engine process is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Launch { .. } | Error::ChannelClosed | Error::EngineCrashed { .. }
        )
    }

    pub(crate) fn malformed_trace(line: impl Into<Option<usize>>, reason: impl Into<String>) -> Self {
        Error::MalformedTrace {
            line: line.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
