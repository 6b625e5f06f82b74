//! Reconnect policy and connection state machine.
//!
//! The connection lifecycle is an explicit, timer-free state machine so the
//! `disconnected → connecting → connected` transitions are unit-testable:
//! the supervisor decides *whether* and *how long* to wait, and the owner of
//! the connection (e.g. an application reconnect loop driving
//! `SceneClient::start`) performs the actual sleep and dial.

use std::time::Duration;

/// Where the connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Why the connection dropped. Drives the retry decision: authentication
/// rejections must never trigger an automatic reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Transport-level failure or clean server close.
    Transport,
    /// The server rejected the subscribe credential.
    AuthRejected,
    /// Local shutdown; no retry wanted.
    Shutdown,
}

/// What the supervisor wants the caller to do after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait this long, then dial again.
    RetryAfter(Duration),
    /// Stop; surface the failure to the user.
    GiveUp,
}

/// Exponential backoff parameters for automatic reconnection.
///
/// `delay(attempt) = min(base * 2^attempt, max)`, stopping after
/// `max_attempts` failures.
///
/// # Example
///
/// ```
/// use scenelink::reconnect::ReconnectPolicy;
/// use std::time::Duration;
///
/// let policy = ReconnectPolicy::default();
/// assert_eq!(policy.delay(0), Some(Duration::from_millis(1000)));
/// assert_eq!(policy.delay(4), Some(Duration::from_millis(16000)));
/// assert_eq!(policy.delay(5), None);
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Automatic reconnection stops after this many failed attempts.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Set the delay before the first retry.
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the upper bound on any single delay.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the number of failed attempts after which reconnection stops.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The delay before retry number `attempt` (zero-based), or `None` once
    /// the attempt budget is exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exp = self
            .base_delay
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay);
        Some(exp.min(self.max_delay))
    }
}

/// Tracks the connection phase and failed-attempt count, and decides whether
/// a dropped connection should be retried.
///
/// Owned by whoever dials transports; the [`crate::client::SceneClient`]
/// itself only ever sees one transport's lifetime.
#[derive(Debug, Clone, Default)]
pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    phase: ConnectionPhase,
    attempts: u32,
}

impl ReconnectSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            phase: ConnectionPhase::Disconnected,
            attempts: 0,
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A dial is starting.
    pub fn on_connecting(&mut self) {
        self.phase = ConnectionPhase::Connecting;
    }

    /// The dial succeeded; the failure streak resets.
    pub fn on_connected(&mut self) {
        self.phase = ConnectionPhase::Connected;
        self.attempts = 0;
    }

    /// The connection dropped (or the dial failed). Returns what to do next
    /// and moves the machine back to `Disconnected`.
    pub fn on_disconnect(&mut self, reason: DisconnectReason) -> ReconnectDecision {
        self.phase = ConnectionPhase::Disconnected;
        match reason {
            DisconnectReason::AuthRejected | DisconnectReason::Shutdown => {
                ReconnectDecision::GiveUp
            }
            DisconnectReason::Transport => {
                let attempt = self.attempts;
                self.attempts += 1;
                match self.policy.delay(attempt) {
                    Some(delay) => ReconnectDecision::RetryAfter(delay),
                    None => ReconnectDecision::GiveUp,
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (0..5).map(|n| policy.delay(n).unwrap().as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(policy.delay(5), None);
    }

    #[test]
    fn backoff_is_capped_at_max_delay() {
        let policy = ReconnectPolicy::default().with_max_attempts(10);
        assert_eq!(policy.delay(6).unwrap().as_millis(), 30_000);
        assert_eq!(policy.delay(9).unwrap().as_millis(), 30_000);
    }

    #[test]
    fn large_attempt_numbers_do_not_overflow() {
        let policy = ReconnectPolicy::default().with_max_attempts(u32::MAX);
        assert_eq!(policy.delay(40).unwrap(), policy.max_delay);
        assert_eq!(policy.delay(u32::MAX - 1).unwrap(), policy.max_delay);
    }

    #[test]
    fn no_sixth_attempt_by_default() {
        let mut supervisor = ReconnectSupervisor::new(ReconnectPolicy::default());
        let mut observed = Vec::new();
        loop {
            supervisor.on_connecting();
            match supervisor.on_disconnect(DisconnectReason::Transport) {
                ReconnectDecision::RetryAfter(delay) => observed.push(delay.as_millis()),
                ReconnectDecision::GiveUp => break,
            }
        }
        assert_eq!(observed, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(supervisor.phase(), ConnectionPhase::Disconnected);
    }

    #[test]
    fn auth_rejection_never_retries() {
        let mut supervisor = ReconnectSupervisor::new(ReconnectPolicy::default());
        supervisor.on_connecting();
        assert_eq!(
            supervisor.on_disconnect(DisconnectReason::AuthRejected),
            ReconnectDecision::GiveUp
        );
        // Even on the very first failure.
        assert_eq!(supervisor.attempts(), 0);
    }

    #[test]
    fn successful_connection_resets_the_streak() {
        let mut supervisor = ReconnectSupervisor::new(ReconnectPolicy::default());
        supervisor.on_connecting();
        let _ = supervisor.on_disconnect(DisconnectReason::Transport);
        let _ = supervisor.on_disconnect(DisconnectReason::Transport);
        assert_eq!(supervisor.attempts(), 2);

        supervisor.on_connecting();
        supervisor.on_connected();
        assert_eq!(supervisor.phase(), ConnectionPhase::Connected);
        assert_eq!(supervisor.attempts(), 0);

        // The next failure starts over at the base delay.
        match supervisor.on_disconnect(DisconnectReason::Transport) {
            ReconnectDecision::RetryAfter(delay) => {
                assert_eq!(delay, Duration::from_millis(1000));
            }
            ReconnectDecision::GiveUp => panic!("expected a retry"),
        }
    }

    #[test]
    fn shutdown_gives_up_immediately() {
        let mut supervisor = ReconnectSupervisor::new(ReconnectPolicy::default());
        supervisor.on_connecting();
        supervisor.on_connected();
        assert_eq!(
            supervisor.on_disconnect(DisconnectReason::Shutdown),
            ReconnectDecision::GiveUp
        );
    }
}
