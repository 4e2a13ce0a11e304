//! Fibers: lightweight threads of execution inside a service.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

use crate::{frame::Frame, service::ServiceId};

/// Unique fiber identifier, allocated by the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiberId(u64);

impl FiberId {
    #[inline]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Routing address of a caller fiber, carried by messages so responses find
/// their way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerRef {
    pub service: ServiceId,
    pub fiber: FiberId,
}

/// Fiber execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr, Serialize, Deserialize)]
pub enum FiberStatus {
    /// Created by message receipt, never yet dispatched.
    Initial,
    /// Holds the service's single execution slot.
    Running,
    /// Preempted by the op budget; resumed as soon as possible.
    Paused,
    /// Voluntarily released control; lower resumption priority than
    /// `Paused`.
    Yielded,
    /// Blocked on one or more futures.
    Waiting,
}

impl FiberStatus {
    /// Legal successor states.
    #[must_use]
    pub fn may_transition_to(self, next: Self) -> bool {
        match self {
            Self::Initial => matches!(next, Self::Running),
            Self::Running => matches!(next, Self::Paused | Self::Yielded | Self::Waiting),
            Self::Paused | Self::Yielded | Self::Waiting => matches!(next, Self::Running),
        }
    }
}

/// A logical thread of execution owning a frame stack.
pub struct Fiber {
    pub id: FiberId,
    /// Owning service.
    pub service: ServiceId,
    /// The fiber this one was created on behalf of, if any.
    pub caller: Option<CallerRef>,
    status: FiberStatus,
    /// Hint that a response has arrived; set by response routing, cleared
    /// on each re-entry to `Running`. Missing it cannot wedge the fiber:
    /// the scheduler re-examines `Waiting` fibers every tick but never
    /// promotes them without the flag (or an expired deadline).
    pub responded: bool,
    /// Absolute deadline; polled between ops.
    pub deadline: Option<Instant>,
    started_at: Option<Instant>,
    /// Frame stack; index 0 is the synthetic service-entry frame.
    pub frames: Vec<Frame>,
}

impl Fiber {
    pub fn new(id: FiberId, service: ServiceId, caller: Option<CallerRef>, proto: Frame) -> Self {
        Self {
            id,
            service,
            caller,
            status: FiberStatus::Initial,
            responded: false,
            deadline: None,
            started_at: None,
            frames: vec![proto],
        }
    }

    #[inline]
    pub fn status(&self) -> FiberStatus {
        self.status
    }

    /// Transitions the fiber, asserting legality.
    ///
    /// Entering `Running` stamps the start instant; leaving it stops the
    /// clock (the elapsed share is collected via [`Fiber::take_elapsed`]).
    pub fn set_status(&mut self, next: FiberStatus) {
        debug_assert!(
            self.status.may_transition_to(next),
            "illegal fiber transition {} -> {next}",
            self.status
        );
        self.status = next;
        if next == FiberStatus::Running {
            self.started_at = Some(Instant::now());
        }
    }

    /// Elapsed running time since the last `Running` entry; resets the
    /// stamp. Used by the service to accumulate runtime metrics.
    pub fn take_elapsed(&mut self) -> Duration {
        self.started_at.take().map(|t| t.elapsed()).unwrap_or_default()
    }

    /// True when the fiber carries a deadline that has passed.
    pub fn is_timed_out(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_state_machine() {
        use FiberStatus::*;
        let legal = [
            (Initial, Running),
            (Running, Paused),
            (Running, Yielded),
            (Running, Waiting),
            (Paused, Running),
            (Yielded, Running),
            (Waiting, Running),
        ];
        for (from, to) in legal {
            assert!(from.may_transition_to(to), "{from} -> {to} should be legal");
        }
        let illegal = [
            (Initial, Paused),
            (Initial, Yielded),
            (Initial, Waiting),
            (Running, Running),
            (Paused, Yielded),
            (Paused, Waiting),
            (Yielded, Paused),
            (Waiting, Paused),
            (Waiting, Yielded),
        ];
        for (from, to) in illegal {
            assert!(!from.may_transition_to(to), "{from} -> {to} should be illegal");
        }
    }
}
