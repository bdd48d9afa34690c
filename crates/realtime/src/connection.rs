// Per-channel connection lifecycle.
//
//   idle → connecting → connected
//   connected → reconnecting             (transport drop)
//   reconnecting → connected | error     (error once the retry budget is spent)
//   error → connecting                   (manual retry)
//   any → closed                         (terminal)
//
// The machine is pure: every transition returns an `Effect` that the
// multiplexer carries out against the transport.

use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::config::ReconnectConfig;
use crate::error::RealtimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Closed,
}

impl ConnectionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_connected_state(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Connected)
}

pub fn is_error_state(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Error)
}

/// Input that drives a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Start,
    Subscribed,
    Failed,
    Retry,
    Close,
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Subscribed => "subscribed",
            Self::Failed => "failed",
            Self::Retry => "retry",
            Self::Close => "close",
        };
        f.write_str(name)
    }
}

/// Work the owner of the transport must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Issue the transport subscribe now.
    Subscribe,
    /// Issue the transport subscribe once `delay` has passed.
    ScheduleReconnect { attempt: u32, delay: Duration },
    /// The retry budget is spent; release the dead transport and wait for a manual retry.
    GiveUp,
    /// Release the transport. Returned at most once per machine.
    Unsubscribe,
}

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    label: String,
    state: ConnectionState,
    retry_count: u32,
    last_error: Option<String>,
    policy: ReconnectConfig,
}

impl ConnectionStateMachine {
    pub fn new(label: impl Into<String>, policy: ReconnectConfig) -> Self {
        Self {
            label: label.into(),
            state: ConnectionState::Idle,
            retry_count: 0,
            last_error: None,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn start(&mut self) -> Result<Effect, RealtimeError> {
        match self.state {
            ConnectionState::Idle => {
                self.transition(ConnectionState::Connecting);
                Ok(Effect::Subscribe)
            }
            from => Err(RealtimeError::InvalidTransition { from, event: StateEvent::Start }),
        }
    }

    /// The transport confirmed the subscribe.
    pub fn on_subscribed(&mut self) -> Result<Effect, RealtimeError> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.retry_count = 0;
                self.last_error = None;
                self.transition(ConnectionState::Connected);
                Ok(Effect::None)
            }
            ConnectionState::Connected => Ok(Effect::None),
            from => Err(RealtimeError::InvalidTransition { from, event: StateEvent::Subscribed }),
        }
    }

    /// The subscribe attempt failed or an established transport dropped.
    pub fn on_failure(&mut self, reason: impl Into<String>) -> Result<Effect, RealtimeError> {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => {
                self.last_error = Some(reason.into());
                if self.retry_count >= self.policy.max_attempts {
                    self.transition(ConnectionState::Error);
                    return Ok(Effect::GiveUp);
                }
                self.retry_count += 1;
                let attempt = self.retry_count;
                self.transition(ConnectionState::Reconnecting);
                Ok(Effect::ScheduleReconnect { attempt, delay: self.policy.backoff_delay(attempt) })
            }
            from => Err(RealtimeError::InvalidTransition { from, event: StateEvent::Failed }),
        }
    }

    /// Manual retry after the machine gave up.
    pub fn retry(&mut self) -> Result<Effect, RealtimeError> {
        match self.state {
            ConnectionState::Error => {
                self.retry_count = 0;
                self.transition(ConnectionState::Connecting);
                Ok(Effect::Subscribe)
            }
            from => Err(RealtimeError::InvalidTransition { from, event: StateEvent::Retry }),
        }
    }

    /// Explicit teardown. A second close is a no-op.
    pub fn close(&mut self) -> Effect {
        if self.state == ConnectionState::Closed {
            return Effect::None;
        }
        self.transition(ConnectionState::Closed);
        Effect::Unsubscribe
    }

    fn transition(&mut self, to: ConnectionState) {
        debug!(
            channel = %self.label,
            from = %self.state,
            to = %to,
            retry_count = self.retry_count,
            "channel state transition"
        );
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max_attempts: u32) -> ConnectionStateMachine {
        ConnectionStateMachine::new(
            "test",
            ReconnectConfig { base_delay_ms: 100, max_delay_ms: 400, max_attempts },
        )
    }

    #[test]
    fn predicates_match_only_their_state() {
        assert!(is_connected_state(ConnectionState::Connected));
        assert!(!is_connected_state(ConnectionState::Reconnecting));
        assert!(is_error_state(ConnectionState::Error));
        assert!(!is_error_state(ConnectionState::Closed));
    }

    #[test]
    fn happy_path_reaches_connected() {
        let mut sm = machine(3);
        assert_eq!(sm.state(), ConnectionState::Idle);
        assert_eq!(sm.start().expect("start from idle"), Effect::Subscribe);
        assert_eq!(sm.state(), ConnectionState::Connecting);
        assert_eq!(sm.on_subscribed().expect("subscribed"), Effect::None);
        assert_eq!(sm.state(), ConnectionState::Connected);
        assert_eq!(sm.retry_count(), 0);
        assert!(sm.last_error().is_none());
    }

    #[test]
    fn drop_schedules_backoff_and_success_resets_counters() {
        let mut sm = machine(3);
        sm.start().expect("start");
        sm.on_subscribed().expect("subscribed");

        let effect = sm.on_failure("socket reset").expect("drop while connected");
        assert_eq!(
            effect,
            Effect::ScheduleReconnect { attempt: 1, delay: Duration::from_millis(100) }
        );
        assert_eq!(sm.state(), ConnectionState::Reconnecting);
        assert_eq!(sm.last_error(), Some("socket reset"));

        let effect = sm.on_failure("still down").expect("failed reconnect");
        assert_eq!(
            effect,
            Effect::ScheduleReconnect { attempt: 2, delay: Duration::from_millis(200) }
        );
        assert_eq!(sm.retry_count(), 2);

        sm.on_subscribed().expect("reconnected");
        assert_eq!(sm.state(), ConnectionState::Connected);
        assert_eq!(sm.retry_count(), 0);
        assert!(sm.last_error().is_none());
    }

    #[test]
    fn exhausted_budget_enters_error_and_manual_retry_recovers() {
        let mut sm = machine(2);
        sm.start().expect("start");
        sm.on_failure("refused").expect("attempt 1");
        sm.on_failure("refused").expect("attempt 2");
        assert_eq!(sm.on_failure("refused").expect("budget spent"), Effect::GiveUp);
        assert_eq!(sm.state(), ConnectionState::Error);
        assert_eq!(sm.retry_count(), 2);

        assert!(matches!(
            sm.on_subscribed(),
            Err(RealtimeError::InvalidTransition { from: ConnectionState::Error, .. })
        ));

        assert_eq!(sm.retry().expect("manual retry"), Effect::Subscribe);
        assert_eq!(sm.state(), ConnectionState::Connecting);
        assert_eq!(sm.retry_count(), 0);
        assert_eq!(sm.last_error(), Some("refused"));
    }

    #[test]
    fn backoff_is_capped() {
        let mut sm = machine(10);
        sm.start().expect("start");
        let mut last = Effect::None;
        for _ in 0..5 {
            last = sm.on_failure("down").expect("failure");
        }
        assert_eq!(last, Effect::ScheduleReconnect { attempt: 5, delay: Duration::from_millis(400) });
    }

    #[test]
    fn close_is_terminal_and_idempotent() {
        let mut sm = machine(3);
        sm.start().expect("start");
        assert_eq!(sm.close(), Effect::Unsubscribe);
        assert_eq!(sm.close(), Effect::None);
        assert_eq!(sm.state(), ConnectionState::Closed);

        assert!(sm.start().is_err());
        assert!(sm.on_subscribed().is_err());
        assert!(sm.on_failure("late").is_err());
        assert!(sm.retry().is_err());
    }

    #[test]
    fn retry_is_only_valid_from_error() {
        let mut sm = machine(3);
        assert!(matches!(
            sm.retry(),
            Err(RealtimeError::InvalidTransition { from: ConnectionState::Idle, event: StateEvent::Retry })
        ));
    }
}
