//! Connection lifecycle state machine.
//!
//! [`ConnectionMachine`] performs no I/O. Every input returns the
//! [`Effect`]s the driver must carry out, which keeps the transitions
//! testable without a runtime.
//!
//! ```text
//!  initialized ──connect──▶ connecting ──handshake──▶ connected
//!                           │  ▲   │                      │
//!                   failure │  └───┘ next candidate       │ unexpected close
//!                           ▼                             ▼
//!                      unavailable                   connecting (new cycle)
//!
//!  connecting | connected ──disconnect──▶ disconnecting ──▶ disconnected
//! ```

use herald_transport::Candidate;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Never connected, or reset by a later connect.
    Initialized,
    /// Trying candidates.
    Connecting,
    /// Handshake completed.
    Connected,
    /// Every candidate of the cycle failed.
    Unavailable,
    /// Tearing the transport down on request.
    Disconnecting,
    /// Stopped on request. No reconnection happens.
    Disconnected,
}

impl ConnectionState {
    /// Lowercase state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Unavailable => "unavailable",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a new cycle orders its candidates after a transport failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Start from the first candidate that is not the one that just failed.
    /// The failed transport is tried last.
    #[default]
    SkipLastFailed,
    /// Start from the top of the priority list.
    ClearHistory,
}

/// Identifies one transport attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one negotiation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CycleId(u64);

/// Work the driver must perform.
#[derive(Debug)]
pub enum Effect {
    /// Open `candidate`. Its events must be reported with `attempt`.
    Open {
        /// Attempt id.
        attempt: AttemptId,
        /// Transport to open.
        candidate: Candidate,
    },
    /// Tear down the current transport, if any.
    Close,
    /// Negotiate candidates after `delay` and report them with `cycle`.
    Negotiate {
        /// Cycle id.
        cycle: CycleId,
        /// Wait before negotiating.
        delay: Duration,
        /// Re-probe the environment first.
        refresh: bool,
    },
    /// The connection is usable.
    Established {
        /// Id the service assigned to this connection.
        socket_id: String,
    },
    /// Subscriptions carried by the previous transport are gone.
    SubscriptionsLost,
}

/// The connection state machine.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    max_attempts: usize,
    current: Option<Candidate>,
    attempt: Option<AttemptId>,
    candidates: VecDeque<Candidate>,
    cycle: Option<CycleId>,
    attempts_in_cycle: usize,
    retry_count: u32,
    last_failed: Option<&'static str>,
    socket_id: Option<String>,
    next_id: u64,
}

impl ConnectionMachine {
    /// Create a machine. `max_attempts` of zero means no limit.
    #[must_use]
    pub fn new(policy: ReconnectPolicy, max_attempts: usize) -> Self {
        Self {
            state: ConnectionState::Initialized,
            policy,
            max_attempts,
            current: None,
            attempt: None,
            candidates: VecDeque::new(),
            cycle: None,
            attempts_in_cycle: 0,
            retry_count: 0,
            last_failed: None,
            socket_id: None,
            next_id: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Name of the current transport.
    #[must_use]
    pub fn current_transport(&self) -> Option<&'static str> {
        self.current.as_ref().map(Candidate::name)
    }

    /// The attempt whose events are accepted.
    #[must_use]
    pub fn current_attempt(&self) -> Option<AttemptId> {
        self.attempt
    }

    /// Failed attempts since the last successful handshake.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Socket id of the established connection.
    #[must_use]
    pub fn socket_id(&self) -> Option<&str> {
        self.socket_id.as_deref()
    }

    /// Names of the candidates still queued in this cycle.
    #[must_use]
    pub fn remaining(&self) -> Vec<&'static str> {
        self.candidates.iter().map(Candidate::name).collect()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_current(&self, attempt: AttemptId) -> bool {
        self.attempt == Some(attempt)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "Connection state changed");
            self.state = state;
        }
    }

    fn new_cycle(&mut self, delay: Duration, refresh: bool) -> Effect {
        let cycle = CycleId(self.next_id());
        self.cycle = Some(cycle);
        self.candidates.clear();
        Effect::Negotiate {
            cycle,
            delay,
            refresh,
        }
    }

    /// Forget the current transport, returning the effects that tear it down.
    fn drop_transport(&mut self) -> Vec<Effect> {
        let had_connection = self.socket_id.take().is_some();
        self.current = None;
        self.attempt = None;
        let mut effects = vec![Effect::Close];
        if had_connection {
            effects.push(Effect::SubscriptionsLost);
        }
        effects
    }

    /// Request a connection.
    ///
    /// Ignored while already connecting, connected or disconnecting.
    pub fn connect(&mut self) -> Vec<Effect> {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Disconnecting => {
                debug!(state = %self.state, "Connect ignored");
                Vec::new()
            }
            ConnectionState::Initialized
            | ConnectionState::Unavailable
            | ConnectionState::Disconnected => {
                self.set_state(ConnectionState::Initialized);
                self.retry_count = 0;
                self.last_failed = None;
                self.set_state(ConnectionState::Connecting);
                vec![self.new_cycle(Duration::ZERO, false)]
            }
        }
    }

    /// Negotiation for `cycle` finished with `candidates`, best first.
    pub fn candidates_ready(&mut self, cycle: CycleId, candidates: Vec<Candidate>) -> Vec<Effect> {
        if self.cycle != Some(cycle) || self.state != ConnectionState::Connecting {
            debug!("Stale negotiation result ignored");
            return Vec::new();
        }
        self.cycle = None;

        let mut queue: VecDeque<Candidate> = candidates.into();
        if let (ReconnectPolicy::SkipLastFailed, Some(failed)) = (self.policy, self.last_failed) {
            let (fresh, failed): (VecDeque<_>, VecDeque<_>) =
                queue.into_iter().partition(|c| c.name() != failed);
            queue = fresh;
            queue.extend(failed);
        }

        debug!(
            candidates = ?queue.iter().map(Candidate::name).collect::<Vec<_>>(),
            "Starting connection cycle"
        );
        self.candidates = queue;
        self.attempts_in_cycle = 0;

        if self.candidates.is_empty() {
            warn!("No usable transport in this environment");
        }
        self.advance()
    }

    fn advance(&mut self) -> Vec<Effect> {
        let limit_reached = self.max_attempts > 0 && self.attempts_in_cycle >= self.max_attempts;
        let next = if limit_reached {
            None
        } else {
            self.candidates.pop_front()
        };

        let Some(candidate) = next else {
            if limit_reached {
                warn!(attempts = self.attempts_in_cycle, "Attempt limit reached");
            }
            self.current = None;
            self.attempt = None;
            self.candidates.clear();
            self.set_state(ConnectionState::Unavailable);
            return Vec::new();
        };

        let attempt = AttemptId(self.next_id());
        self.attempts_in_cycle += 1;
        self.attempt = Some(attempt);
        self.current = Some(candidate.clone());
        vec![Effect::Open { attempt, candidate }]
    }

    /// The transport for `attempt` finished its own open.
    ///
    /// The connection still waits for the handshake frame.
    pub fn transport_opened(&mut self, attempt: AttemptId) -> bool {
        self.is_current(attempt) && self.state == ConnectionState::Connecting
    }

    /// The handshake frame arrived on `attempt`.
    pub fn handshake(&mut self, attempt: AttemptId, socket_id: &str) -> Vec<Effect> {
        if !self.is_current(attempt) || self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.socket_id = Some(socket_id.to_string());
        self.retry_count = 0;
        self.last_failed = None;
        self.candidates.clear();
        self.set_state(ConnectionState::Connected);
        vec![Effect::Established {
            socket_id: socket_id.to_string(),
        }]
    }

    /// `attempt` failed or timed out.
    pub fn transport_failed(&mut self, attempt: AttemptId, reason: &str) -> Vec<Effect> {
        if !self.is_current(attempt) {
            return Vec::new();
        }
        match self.state {
            ConnectionState::Connecting => {
                let failed = self.current_transport();
                warn!(transport = failed, %attempt, %reason, "Transport attempt failed");
                self.last_failed = failed;
                self.retry_count += 1;
                let mut effects = self.drop_transport();
                effects.extend(self.advance());
                effects
            }
            ConnectionState::Connected => self.transport_closed(attempt),
            _ => Vec::new(),
        }
    }

    /// The transport of `attempt` closed without being asked to.
    pub fn transport_closed(&mut self, attempt: AttemptId) -> Vec<Effect> {
        if !self.is_current(attempt) {
            return Vec::new();
        }
        match self.state {
            ConnectionState::Connecting => self.transport_failed(attempt, "closed before handshake"),
            ConnectionState::Connected => {
                let failed = self.current_transport();
                warn!(transport = failed, %attempt, "Connection lost, renegotiating");
                self.last_failed = failed;
                let mut effects = self.drop_transport();
                self.set_state(ConnectionState::Connecting);
                effects.push(self.new_cycle(Duration::ZERO, true));
                effects
            }
            _ => Vec::new(),
        }
    }

    /// The service asked for a reconnect after `delay`.
    pub fn reconnect(&mut self, delay: Duration) -> Vec<Effect> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                info!(delay_ms = delay.as_millis() as u64, "Reconnecting");
                let mut effects = self.drop_transport();
                self.set_state(ConnectionState::Connecting);
                effects.push(self.new_cycle(delay, false));
                effects
            }
            _ => Vec::new(),
        }
    }

    /// Request a disconnect.
    ///
    /// From `connecting` or `connected` this enters `disconnecting`; the
    /// driver completes it with [`finish_disconnect`](Self::finish_disconnect)
    /// once the transport is torn down.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        self.cycle = None;
        self.candidates.clear();
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                let effects = self.drop_transport();
                self.set_state(ConnectionState::Disconnecting);
                effects
            }
            ConnectionState::Initialized | ConnectionState::Unavailable => {
                self.set_state(ConnectionState::Disconnected);
                Vec::new()
            }
            ConnectionState::Disconnecting | ConnectionState::Disconnected => Vec::new(),
        }
    }

    /// The transport is gone after a disconnect.
    pub fn finish_disconnect(&mut self) {
        if self.state == ConnectionState::Disconnecting {
            self.set_state(ConnectionState::Disconnected);
        }
    }
}
