//! Bounded retry-until-true polling.
//!
//! Every validator synchronises with eventually-consistent cluster state
//! (pods scheduling, claims binding, endpoints answering) through
//! [`ConditionPoller`]. A probe reports [`Check::Ready`] or
//! [`Check::Pending`]; transient errors count as a failed attempt, anything
//! else aborts the loop immediately.
//!
//! Attempt convention: `max_attempts = N` counts retries after the initial
//! probe, so a loop evaluates the probe at most `N + 1` times and sleeps at
//! most `N` times. `N = 0` still probes exactly once.

use std::{
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::error::{AddonError, Result};

/// Time source for poll loops.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`Instant::now`] and [`thread::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

/// Shortest run time handed to an attempt by
/// [`ConditionPoller::poll_within`], even at the deadline.
pub const MIN_ATTEMPT_WINDOW: Duration = Duration::from_secs(1);

/// Budget of a poll loop. At least one of `max_attempts` or `timeout` must
/// be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Retries after the first probe.
    pub max_attempts: Option<u32>,
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

impl PollPolicy {
    /// Budget bounded by a retry count.
    pub const fn attempts(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            interval,
            timeout: None,
        }
    }

    /// Budget bounded by total wall-clock time.
    pub const fn deadline(timeout: Duration, interval: Duration) -> Self {
        Self {
            max_attempts: None,
            interval,
            timeout: Some(timeout),
        }
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reject unbounded policies before any probe runs.
    ///
    /// `u32::MAX` retries cannot be counted in a `u32` attempt total, so it
    /// is refused as well.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts.is_none() && self.timeout.is_none() {
            return Err(AddonError::Config(
                "poll policy needs max_attempts or timeout".into(),
            ));
        }
        if self.max_attempts == Some(u32::MAX) {
            return Err(AddonError::Config(format!(
                "max_attempts must be below {}",
                u32::MAX
            )));
        }
        Ok(())
    }
}

/// Result of one probe evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check<T> {
    Ready(T),
    Pending,
}

impl<T> Check<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Check::Ready(_))
    }
}

impl From<bool> for Check<()> {
    fn from(ready: bool) -> Self {
        if ready { Check::Ready(()) } else { Check::Pending }
    }
}

/// How a poll loop ended. Exhaustion is not an error: the caller decides
/// whether it is fatal.
#[derive(Debug)]
pub enum PollOutcome<T> {
    Ready {
        value: T,
        attempts: u32,
        elapsed: Duration,
    },
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        last_error: Option<AddonError>,
    },
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }

    /// Probe evaluations performed.
    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Ready { attempts, .. }
            | PollOutcome::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            PollOutcome::Ready { elapsed, .. }
            | PollOutcome::Exhausted { elapsed, .. } => *elapsed,
        }
    }

    pub fn ready(self) -> Option<T> {
        match self {
            PollOutcome::Ready { value, .. } => Some(value),
            PollOutcome::Exhausted { .. } => None,
        }
    }

    /// Treat exhaustion as a hard failure.
    pub fn into_result(self, what: impl Into<String>) -> Result<T> {
        match self {
            PollOutcome::Ready { value, .. } => Ok(value),
            PollOutcome::Exhausted {
                attempts, elapsed, ..
            } => Err(AddonError::Exhausted {
                what: what.into(),
                attempts,
                elapsed,
            }),
        }
    }

    /// Like [`into_result`](Self::into_result), but surfaces the last
    /// transient error when there was one.
    pub fn into_last_error(self, what: impl Into<String>) -> Result<T> {
        match self {
            PollOutcome::Exhausted {
                last_error: Some(err),
                ..
            } => Err(err),
            outcome => outcome.into_result(what),
        }
    }
}

/// Repeatedly evaluates a probe until it is ready or the policy's budget is
/// spent.
#[derive(Debug, Clone)]
pub struct ConditionPoller<C = SystemClock> {
    label: String,
    policy: PollPolicy,
    clock: C,
}

impl ConditionPoller<SystemClock> {
    pub fn new(label: impl Into<String>, policy: PollPolicy) -> Self {
        Self {
            label: label.into(),
            policy,
            clock: SystemClock,
        }
    }
}

impl<C: Clock> ConditionPoller<C> {
    pub fn with_clock<D: Clock>(self, clock: D) -> ConditionPoller<D> {
        ConditionPoller {
            label: self.label,
            policy: self.policy,
            clock,
        }
    }

    /// Run the loop. Only non-transient probe errors are returned as `Err`.
    pub fn poll<T, F>(&self, mut probe: F) -> Result<PollOutcome<T>>
    where
        F: FnMut() -> Result<Check<T>>,
    {
        self.poll_within(|_| probe())
    }

    /// Like [`poll`](Self::poll), but each call is told how long it may run:
    /// the time left before the deadline, never less than
    /// [`MIN_ATTEMPT_WINDOW`]. `None` when the policy has no timeout.
    pub fn poll_within<T, F>(&self, mut condition: F) -> Result<PollOutcome<T>>
    where
        F: FnMut(Option<Duration>) -> Result<Check<T>>,
    {
        self.policy.validate()?;

        let start = self.clock.now();
        let deadline = self.policy.timeout.map(|timeout| start + timeout);
        let mut attempts: u32 = 0;
        let mut last_error = None;

        loop {
            attempts = attempts.saturating_add(1);
            let window = deadline.map(|deadline| {
                deadline
                    .saturating_duration_since(self.clock.now())
                    .max(MIN_ATTEMPT_WINDOW)
            });
            match condition(window) {
                Ok(Check::Ready(value)) => {
                    let elapsed = self.clock.now().duration_since(start);
                    debug!(
                        poll = %self.label,
                        attempts,
                        elapsed = ?elapsed,
                        "condition met"
                    );
                    return Ok(PollOutcome::Ready {
                        value,
                        attempts,
                        elapsed,
                    });
                }
                Ok(Check::Pending) => {
                    debug!(poll = %self.label, attempt = attempts, "not yet");
                }
                Err(err) if err.is_transient() => {
                    debug!(
                        poll = %self.label,
                        attempt = attempts,
                        error = %err,
                        "transient probe failure"
                    );
                    last_error = Some(err);
                }
                Err(err) => {
                    warn!(
                        poll = %self.label,
                        attempt = attempts,
                        error = %err,
                        "probe failed, aborting poll"
                    );
                    return Err(err);
                }
            }

            let now = self.clock.now();
            let retries_left = self
                .policy
                .max_attempts
                .is_none_or(|max| attempts <= max);
            let time_left =
                deadline.map(|deadline| deadline.saturating_duration_since(now));

            if !retries_left || time_left.is_some_and(|left| left.is_zero()) {
                let elapsed = now.duration_since(start);
                warn!(
                    poll = %self.label,
                    attempts,
                    elapsed = ?elapsed,
                    "poll budget exhausted"
                );
                return Ok(PollOutcome::Exhausted {
                    attempts,
                    elapsed,
                    last_error,
                });
            }

            let pause = time_left
                .map_or(self.policy.interval, |left| left.min(self.policy.interval));
            self.clock.sleep(pause);
        }
    }
}

/// One-shot helper for `ConditionPoller::new(label, policy).poll(probe)`.
pub fn poll_until<T, F>(
    label: impl Into<String>,
    policy: PollPolicy,
    probe: F,
) -> Result<PollOutcome<T>>
where
    F: FnMut() -> Result<Check<T>>,
{
    ConditionPoller::new(label, policy).poll(probe)
}
