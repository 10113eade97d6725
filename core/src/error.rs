use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GaplessErr>;

/// Inclusive range of block numbers, used to tag errors and work units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceRange {
    pub start: u64,
    pub end: u64,
}

impl SequenceRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(GaplessErr::Config(format!(
                "range start {start} is after range end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn count(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    pub fn contains(&self, number: u64) -> bool {
        (self.start..=self.end).contains(&number)
    }
}

impl fmt::Display for SequenceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[derive(Error, Debug)]
pub enum GaplessErr {
    /// Invalid settings. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Upstream fetch failed in a way that may succeed on retry.
    #[error("fetch of {range} failed: {message}")]
    Fetch {
        range: SequenceRange,
        message: String,
    },

    /// Store read or write failed.
    #[error("store {operation} failed: {message}")]
    Store {
        operation: &'static str,
        message: String,
    },

    /// Upstream returned data that cannot be turned into records.
    #[error("malformed upstream data: {0}")]
    Decode(String),

    /// A retryable operation kept failing until the policy gave up.
    #[error("{operation} for {range} gave up after {attempts} attempts: {source}")]
    RetryLimit {
        operation: &'static str,
        range: SequenceRange,
        attempts: u64,
        #[source]
        source: Box<GaplessErr>,
    },

    #[error("failed to read config file {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl GaplessErr {
    /// Whether the operation that produced this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            GaplessErr::Fetch { .. } | GaplessErr::Store { .. } => true,
            GaplessErr::Config(_)
            | GaplessErr::Decode(_)
            | GaplessErr::RetryLimit { .. }
            | GaplessErr::ConfigIo { .. }
            | GaplessErr::ConfigParse { .. } => false,
        }
    }

    pub(crate) fn store(operation: &'static str, err: anyhow::Error) -> Self {
        GaplessErr::Store {
            operation,
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn fetch(range: SequenceRange, message: impl Into<String>) -> Self {
        GaplessErr::Fetch {
            range,
            message: message.into(),
        }
    }
}
