//! Monotonic deadlines for socket operations

use std::time::{Duration, Instant};

/// Deadline of a potentially blocking operation
///
/// Derived from the socket timeout once per operation; retry loops recompute
/// the remaining time on every iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Socket is in blocking mode, the engine call itself blocks
    Blocking,
    /// Socket is non-blocking (or there is no socket), never wait
    NonBlocking,
    /// Socket has a timeout; give up at this instant
    At(Instant),
}

/// Time left before a deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Blocking,
    NonBlocking,
    Expired,
    Left(Duration),
}

impl Deadline {
    /// Deadline for an operation starting now on a socket with `timeout`
    ///
    /// `None` means blocking mode, a zero timeout means non-blocking mode.
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            None => Deadline::Blocking,
            Some(t) if t.is_zero() => Deadline::NonBlocking,
            Some(t) => Instant::now()
                .checked_add(t)
                .map_or(Deadline::Blocking, Deadline::At),
        }
    }

    /// Time left, clamped at zero
    pub fn remaining(&self) -> Remaining {
        match self {
            Deadline::Blocking => Remaining::Blocking,
            Deadline::NonBlocking => Remaining::NonBlocking,
            Deadline::At(at) => match at.checked_duration_since(Instant::now()) {
                Some(left) if !left.is_zero() => Remaining::Left(left),
                _ => Remaining::Expired,
            },
        }
    }
}
