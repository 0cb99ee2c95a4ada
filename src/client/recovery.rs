//! What a session does when a request fails.

use std::time::Duration;

use crate::sync::Fail;

/// Initial retry delay after a transport timeout
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Upper bound on the retry delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Reaction to a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Throw the replica away and fetch the document again
    Restart,
    /// Pull right away; someone pushed first
    Repull,
    /// Retry the same request after a delay
    Backoff,
    /// Give up and report to the caller
    Fatal,
}

pub fn classify(fail: &Fail) -> Recovery {
    match fail {
        Fail::InvalidVersion | Fail::IncorrectManager | Fail::HistoryNotAvailable => {
            Recovery::Restart
        }
        Fail::OutdatedVersion => Recovery::Repull,
        Fail::ManagerUnresponsive => Recovery::Backoff,
        Fail::ApplyFailed(_)
        | Fail::DocumentNotFound(_)
        | Fail::ManagerDestroyed
        | Fail::Storage(_) => Recovery::Fatal,
    }
}

/// Exponential backoff with cap
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            Some(current) => (current * 2).min(self.max),
            None => self.initial.min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}
