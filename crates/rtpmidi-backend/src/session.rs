//! AppleMIDI session state machine.
//!
//! One [`Session`] per apple-mode peer. The session never touches a socket:
//! every handler takes the current time and queues the control packets it
//! wants sent as [`Transmit`]s. Failures are parked until the owning instance
//! collects them with [`Session::take_failure`].
//!
//! Handshake, initiator side:
//!
//! ```text
//!   IN (control) -> OK (control) -> IN (data) -> OK (data)
//!   CK0 -> CK1 -> CK2                              => established
//! ```

use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::debug;

use rtpmidi_protocol::apple::{ControlPacket, Exchange};

#[derive(Debug, Clone)]
pub struct SessionTiming {
    /// Wait for the first invitation answer; doubled on each retry
    pub invite_timeout: Duration,
    pub invite_attempts: u8,
    /// Wait for the peer to finish the data-port invitation or clock sync
    pub sync_timeout: Duration,
    /// Clock sync refresh by the initiator, keep-alive in direct mode
    pub keepalive_interval: Duration,
    /// Silence after which a peer is considered gone
    pub liveness_threshold: Duration,
    /// Delay before a static peer is invited or probed again
    pub reconnect_delay: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            invite_timeout: Duration::from_secs(1),
            invite_attempts: 3,
            sync_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(10),
            liveness_threshold: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl SessionTiming {
    /// Answer timeout for the given 1-based invitation attempt.
    pub fn invite_backoff(&self, attempt: u8) -> Duration {
        let exp = u32::from(attempt.saturating_sub(1)).min(16);
        self.invite_timeout * 2u32.pow(exp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ByUs,
    ByPeer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Invited(Role),
    Synchronizing,
    Established,
    Closed,
    TimedOut,
}

/// Which of the two AppleMIDI ports a packet travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Control,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub port: Port,
    pub packet: ControlPacket,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    #[error("invitation rejected by peer")]
    Rejected,

    #[error("no answer after {0} invitation attempts")]
    InvitationTimeout(u8),

    #[error("clock synchronization timed out")]
    SyncTimeout,

    #[error("session ended by peer")]
    Ended,

    #[error("no traffic within the liveness threshold")]
    TimedOut,
}

/// Local side of the session as of this call.
#[derive(Debug, Clone)]
pub struct Local {
    pub ssrc: u32,
    pub name: String,
    /// Local clock in 100 microsecond ticks
    pub clock: u64,
}

impl Local {
    fn exchange(&self, token: u32) -> Exchange {
        Exchange::new(token, self.ssrc, Some(self.name.clone()))
    }

    fn sync(&self, count: u8, timestamps: [u64; 3]) -> Transmit {
        Transmit {
            port: Port::Data,
            packet: ControlPacket::Sync {
                ssrc: self.ssrc,
                count,
                timestamps,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    initiator: bool,
    token: u32,
    /// Port our pending invitation was sent on
    stage: Port,
    attempts: u8,
    deadline: Option<Instant>,
    next_sync: Option<Instant>,
    retry_at: Option<Instant>,
    /// Remote clock minus local clock, in 100 microsecond ticks
    offset: Option<i64>,
    /// Last measured round trip, in 100 microsecond ticks
    latency: Option<u64>,
    failure: Option<SessionFailure>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            initiator: false,
            token: 0,
            stage: Port::Control,
            attempts: 0,
            deadline: None,
            next_sync: None,
            retry_at: None,
            offset: None,
            latency: None,
            failure: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    pub fn latency(&self) -> Option<u64> {
        self.latency
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn take_failure(&mut self) -> Option<SessionFailure> {
        self.failure.take()
    }

    /// Whether an invitation from us can be started: nothing in flight and
    /// no session up.
    pub fn can_invite(&self) -> bool {
        matches!(
            self.state,
            SessionState::Idle | SessionState::Closed | SessionState::TimedOut
        )
    }

    /// Start an outbound invitation with a fresh initiator token.
    pub fn invite(&mut self, local: &Local, now: Instant, timing: &SessionTiming, out: &mut Vec<Transmit>) {
        self.token = rand::thread_rng().gen();
        self.initiator = true;
        self.stage = Port::Control;
        self.attempts = 1;
        self.state = SessionState::Invited(Role::ByUs);
        self.deadline = Some(now + timing.invite_backoff(1));
        self.next_sync = None;
        self.retry_at = None;
        self.offset = None;
        self.latency = None;

        out.push(Transmit {
            port: Port::Control,
            packet: ControlPacket::Invitation(local.exchange(self.token)),
        });
    }

    /// Rebuild the session after the local SSRC changed from `old_ssrc`.
    ///
    /// Handshakes we initiated are invited again under the new SSRC. A
    /// session the peer already keyed by the old SSRC (established, or one
    /// we were answering) is ended under the old SSRC first. Idle and closed
    /// sessions are left alone.
    pub fn restart(
        &mut self,
        old_ssrc: u32,
        local: &Local,
        now: Instant,
        timing: &SessionTiming,
        out: &mut Vec<Transmit>,
    ) {
        match self.state {
            SessionState::Idle | SessionState::Closed | SessionState::TimedOut => return,
            SessionState::Invited(Role::ByUs) => {}
            SessionState::Synchronizing if self.initiator => {}
            SessionState::Invited(Role::ByPeer)
            | SessionState::Synchronizing
            | SessionState::Established => {
                out.push(Transmit {
                    port: Port::Control,
                    packet: ControlPacket::End(Exchange::new(
                        self.token,
                        old_ssrc,
                        Some(local.name.clone()),
                    )),
                });
            }
        }
        self.invite(local, now, timing, out);
    }

    /// Schedule a fresh invitation after a failure.
    pub fn schedule_retry(&mut self, at: Instant) {
        self.retry_at = Some(at);
    }

    /// Inbound `IN`. Returns whether it was accepted.
    ///
    /// When both sides invite each other, the lower SSRC stays initiator.
    #[allow(clippy::too_many_arguments)]
    pub fn on_invitation(
        &mut self,
        port: Port,
        invitation: &Exchange,
        permitted: bool,
        local: &Local,
        now: Instant,
        timing: &SessionTiming,
        out: &mut Vec<Transmit>,
    ) -> bool {
        let reject = |out: &mut Vec<Transmit>| {
            out.push(Transmit {
                port,
                packet: ControlPacket::Rejected(local.exchange(invitation.token)),
            });
        };

        match port {
            Port::Control => {
                if !permitted {
                    reject(out);
                    return false;
                }
                if self.state == SessionState::Invited(Role::ByUs) {
                    if local.ssrc < invitation.ssrc {
                        debug!(local = local.ssrc, remote = invitation.ssrc, "Invitation race, keeping ours");
                        reject(out);
                        return false;
                    }
                    debug!(local = local.ssrc, remote = invitation.ssrc, "Invitation race, accepting theirs");
                }

                self.token = invitation.token;
                self.initiator = false;
                self.state = SessionState::Invited(Role::ByPeer);
                self.deadline = Some(now + timing.sync_timeout);
                self.next_sync = None;
                self.retry_at = None;
                self.offset = None;
                self.latency = None;
            }
            Port::Data => {
                let expected = matches!(
                    self.state,
                    SessionState::Invited(Role::ByPeer) | SessionState::Synchronizing
                ) && !self.initiator
                    && invitation.token == self.token;
                if !expected {
                    reject(out);
                    return false;
                }
                if self.state != SessionState::Synchronizing {
                    self.state = SessionState::Synchronizing;
                    self.deadline = Some(now + timing.sync_timeout);
                }
            }
        }

        out.push(Transmit {
            port,
            packet: ControlPacket::Accepted(local.exchange(invitation.token)),
        });
        true
    }

    /// Inbound `OK` for our invitation. Returns false when it does not
    /// answer the invitation in flight.
    pub fn on_accepted(
        &mut self,
        port: Port,
        acceptance: &Exchange,
        local: &Local,
        now: Instant,
        timing: &SessionTiming,
        out: &mut Vec<Transmit>,
    ) -> bool {
        if self.state != SessionState::Invited(Role::ByUs)
            || acceptance.token != self.token
            || port != self.stage
        {
            debug!(token = acceptance.token, "Ignoring unexpected acceptance");
            return false;
        }

        match port {
            Port::Control => {
                self.stage = Port::Data;
                self.attempts = 1;
                self.deadline = Some(now + timing.invite_backoff(1));
                out.push(Transmit {
                    port: Port::Data,
                    packet: ControlPacket::Invitation(local.exchange(self.token)),
                });
            }
            Port::Data => {
                self.state = SessionState::Synchronizing;
                self.deadline = Some(now + timing.sync_timeout);
                out.push(local.sync(0, [local.clock, 0, 0]));
            }
        }
        true
    }

    /// Inbound `NO` for our invitation.
    pub fn on_rejected(&mut self, rejection: &Exchange) {
        if self.state == SessionState::Invited(Role::ByUs) && rejection.token == self.token {
            self.fail(SessionFailure::Rejected);
        }
    }

    /// Inbound `BY`.
    pub fn on_end(&mut self) {
        if !matches!(
            self.state,
            SessionState::Idle | SessionState::Closed | SessionState::TimedOut
        ) {
            self.fail(SessionFailure::Ended);
        }
    }

    /// Inbound `CK`. Returns true when this packet completed the first
    /// synchronization.
    pub fn on_sync(
        &mut self,
        count: u8,
        timestamps: [u64; 3],
        local: &Local,
        now: Instant,
        timing: &SessionTiming,
        out: &mut Vec<Transmit>,
    ) -> bool {
        if !matches!(
            self.state,
            SessionState::Synchronizing | SessionState::Established
        ) {
            return false;
        }
        let [t0, t1, t2] = timestamps;
        let first = self.state == SessionState::Synchronizing;

        match (count, self.initiator) {
            (0, false) => {
                out.push(local.sync(1, [t0, local.clock, 0]));
                false
            }
            (1, true) => {
                let t2 = local.clock;
                out.push(local.sync(2, [t0, t1, t2]));
                let round_trip = t2.wrapping_sub(t0);
                self.latency = Some(round_trip);
                self.offset = Some(t1.wrapping_sub(t0.wrapping_add(round_trip / 2)) as i64);
                self.next_sync = Some(now + timing.keepalive_interval);
                self.established();
                first
            }
            (2, false) => {
                let round_trip = t2.wrapping_sub(t0);
                self.latency = Some(round_trip);
                self.offset = Some(t0.wrapping_add(round_trip / 2).wrapping_sub(t1) as i64);
                self.established();
                first
            }
            _ => {
                debug!(count, initiator = self.initiator, "Ignoring out of turn clock sync");
                false
            }
        }
    }

    /// Drive timeouts, retries and keep-alives. `last_activity` is the last
    /// time anything arrived from the peer.
    pub fn poll(
        &mut self,
        local: &Local,
        now: Instant,
        last_activity: Instant,
        timing: &SessionTiming,
        out: &mut Vec<Transmit>,
    ) {
        match self.state {
            SessionState::Idle | SessionState::Closed | SessionState::TimedOut => {
                if due(self.retry_at, now) {
                    self.invite(local, now, timing, out);
                }
            }
            SessionState::Invited(Role::ByUs) => {
                if !due(self.deadline, now) {
                    return;
                }
                if self.attempts < timing.invite_attempts {
                    self.attempts += 1;
                    self.deadline = Some(now + timing.invite_backoff(self.attempts));
                    debug!(attempt = self.attempts, "Resending invitation");
                    out.push(Transmit {
                        port: self.stage,
                        packet: ControlPacket::Invitation(local.exchange(self.token)),
                    });
                } else {
                    self.fail(SessionFailure::InvitationTimeout(self.attempts));
                }
            }
            SessionState::Invited(Role::ByPeer) | SessionState::Synchronizing => {
                if due(self.deadline, now) {
                    self.fail(SessionFailure::SyncTimeout);
                }
            }
            SessionState::Established => {
                if now.saturating_duration_since(last_activity) > timing.liveness_threshold {
                    self.fail(SessionFailure::TimedOut);
                } else if self.initiator && due(self.next_sync, now) {
                    self.next_sync = Some(now + timing.keepalive_interval);
                    out.push(local.sync(0, [local.clock, 0, 0]));
                }
            }
        }
    }

    fn established(&mut self) {
        self.state = SessionState::Established;
        self.deadline = None;
    }

    fn fail(&mut self, failure: SessionFailure) {
        self.state = if failure == SessionFailure::TimedOut {
            SessionState::TimedOut
        } else {
            SessionState::Closed
        };
        self.deadline = None;
        self.next_sync = None;
        self.failure = Some(failure);
    }
}

fn due(at: Option<Instant>, now: Instant) -> bool {
    at.is_some_and(|at| now >= at)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(ssrc: u32, clock: u64) -> Local {
        Local {
            ssrc,
            name: "test".to_string(),
            clock,
        }
    }

    fn token_of(transmit: &Transmit) -> u32 {
        match &transmit.packet {
            ControlPacket::Invitation(ex) | ControlPacket::Accepted(ex) => ex.token,
            other => panic!("unexpected packet {:?}", other),
        }
    }

    fn established_pair(t0: Instant) -> (Session, Session) {
        let timing = SessionTiming::default();
        let mut a = Session::new();
        let mut b = Session::new();
        let mut out = Vec::new();

        a.invite(&local(1, 100), t0, &timing, &mut out);
        let invitation = match out.pop().unwrap().packet {
            ControlPacket::Invitation(ex) => ex,
            other => panic!("unexpected packet {:?}", other),
        };
        assert!(b.on_invitation(Port::Control, &invitation, true, &local(2, 0), t0, &timing, &mut out));
        let ok = Exchange::new(invitation.token, 2, None);
        a.on_accepted(Port::Control, &ok, &local(1, 100), t0, &timing, &mut out);
        assert!(b.on_invitation(Port::Data, &invitation, true, &local(2, 0), t0, &timing, &mut out));
        a.on_accepted(Port::Data, &ok, &local(1, 100), t0, &timing, &mut out);
        out.clear();

        b.on_sync(0, [100, 0, 0], &local(2, 5000), t0, &timing, &mut out);
        assert!(a.on_sync(1, [100, 5000, 0], &local(1, 120), t0, &timing, &mut out));
        assert!(b.on_sync(2, [100, 5000, 120], &local(2, 5010), t0, &timing, &mut out));
        (a, b)
    }

    #[test]
    fn test_invitation_backoff_then_closed() {
        let timing = SessionTiming::default();
        let t0 = Instant::now();
        let mut session = Session::new();
        let mut out = Vec::new();

        session.invite(&local(1, 0), t0, &timing, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(session.state(), SessionState::Invited(Role::ByUs));

        session.poll(&local(1, 0), t0 + Duration::from_millis(999), t0, &timing, &mut out);
        assert_eq!(out.len(), 1);

        // attempt 2 after 1 s, attempt 3 after 2 more, give up after 4 more
        session.poll(&local(1, 0), t0 + Duration::from_secs(1), t0, &timing, &mut out);
        assert_eq!(out.len(), 2);
        session.poll(&local(1, 0), t0 + Duration::from_millis(2999), t0, &timing, &mut out);
        assert_eq!(out.len(), 2);
        session.poll(&local(1, 0), t0 + Duration::from_secs(3), t0, &timing, &mut out);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|t| t.port == Port::Control));

        session.poll(&local(1, 0), t0 + Duration::from_millis(6999), t0, &timing, &mut out);
        assert_eq!(session.state(), SessionState::Invited(Role::ByUs));
        session.poll(&local(1, 0), t0 + Duration::from_secs(7), t0, &timing, &mut out);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.take_failure(), Some(SessionFailure::InvitationTimeout(3)));
        assert_eq!(session.take_failure(), None);
    }

    #[test]
    fn test_full_handshake_and_offsets() {
        let (a, b) = established_pair(Instant::now());

        assert!(a.is_established() && a.is_initiator());
        assert!(b.is_established() && !b.is_initiator());
        // Round trip 20 ticks, remote clock 5000 at local midpoint 110
        assert_eq!(a.latency(), Some(20));
        assert_eq!(a.offset(), Some(4890));
        assert_eq!(b.offset(), Some(-4890));
    }

    #[test]
    fn test_initiator_sends_sync_on_data_acceptance() {
        let timing = SessionTiming::default();
        let t0 = Instant::now();
        let mut session = Session::new();
        let mut out = Vec::new();

        session.invite(&local(1, 42), t0, &timing, &mut out);
        let token = token_of(&out[0]);
        out.clear();

        session.on_accepted(Port::Control, &Exchange::new(token, 2, None), &local(1, 42), t0, &timing, &mut out);
        assert_eq!(out[0].port, Port::Data);
        assert!(matches!(out[0].packet, ControlPacket::Invitation(_)));
        assert_eq!(session.state(), SessionState::Invited(Role::ByUs));

        out.clear();
        session.on_accepted(Port::Data, &Exchange::new(token, 2, None), &local(1, 42), t0, &timing, &mut out);
        assert_eq!(session.state(), SessionState::Synchronizing);
        assert_eq!(
            out,
            vec![Transmit {
                port: Port::Data,
                packet: ControlPacket::Sync {
                    ssrc: 1,
                    count: 0,
                    timestamps: [42, 0, 0],
                },
            }]
        );
    }

    #[test]
    fn test_mismatched_token_ignored() {
        let timing = SessionTiming::default();
        let t0 = Instant::now();
        let mut session = Session::new();
        let mut out = Vec::new();

        session.invite(&local(1, 0), t0, &timing, &mut out);
        let token = token_of(&out[0]);
        out.clear();

        let wrong = Exchange::new(token.wrapping_add(1), 2, None);
        session.on_accepted(Port::Control, &wrong, &local(1, 0), t0, &timing, &mut out);
        session.on_rejected(&wrong);
        assert!(out.is_empty());
        assert_eq!(session.state(), SessionState::Invited(Role::ByUs));

        session.on_rejected(&Exchange::new(token, 2, None));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.take_failure(), Some(SessionFailure::Rejected));
    }

    #[test]
    fn test_not_permitted_invitation_rejected() {
        let timing = SessionTiming::default();
        let mut session = Session::new();
        let mut out = Vec::new();

        let invitation = Exchange::new(77, 2, Some("stranger".into()));
        let accepted = session.on_invitation(Port::Control, &invitation, false, &local(1, 0), Instant::now(), &timing, &mut out);

        assert!(!accepted);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(matches!(&out[0].packet, ControlPacket::Rejected(ex) if ex.token == 77));
    }

    #[test]
    fn test_invitation_race_lower_ssrc_initiates() {
        let timing = SessionTiming::default();
        let t0 = Instant::now();
        let incoming = Exchange::new(99, 0x2222, None);
        let mut out = Vec::new();

        // Lower local SSRC keeps its own invitation
        let mut low = Session::new();
        low.invite(&local(0x1111, 0), t0, &timing, &mut out);
        out.clear();
        assert!(!low.on_invitation(Port::Control, &incoming, true, &local(0x1111, 0), t0, &timing, &mut out));
        assert_eq!(low.state(), SessionState::Invited(Role::ByUs));
        assert!(matches!(out[0].packet, ControlPacket::Rejected(_)));

        // Higher local SSRC abandons its invitation and accepts
        let mut high = Session::new();
        out.clear();
        high.invite(&local(0x3333, 0), t0, &timing, &mut out);
        out.clear();
        assert!(high.on_invitation(Port::Control, &incoming, true, &local(0x3333, 0), t0, &timing, &mut out));
        assert_eq!(high.state(), SessionState::Invited(Role::ByPeer));
        assert!(!high.is_initiator());
        assert!(matches!(&out[0].packet, ControlPacket::Accepted(ex) if ex.token == 99));
    }

    #[test]
    fn test_data_invitation_without_control_rejected() {
        let timing = SessionTiming::default();
        let mut session = Session::new();
        let mut out = Vec::new();

        let accepted = session.on_invitation(Port::Data, &Exchange::new(5, 2, None), true, &local(1, 0), Instant::now(), &timing, &mut out);
        assert!(!accepted);
        assert_eq!(out[0].port, Port::Data);
        assert!(matches!(out[0].packet, ControlPacket::Rejected(_)));
    }

    #[test]
    fn test_sync_timeout_closes_responder() {
        let timing = SessionTiming::default();
        let t0 = Instant::now();
        let mut session = Session::new();
        let mut out = Vec::new();

        session.on_invitation(Port::Control, &Exchange::new(5, 2, None), true, &local(1, 0), t0, &timing, &mut out);
        session.poll(&local(1, 0), t0 + timing.sync_timeout, t0, &timing, &mut out);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.take_failure(), Some(SessionFailure::SyncTimeout));
    }

    #[test]
    fn test_keepalive_and_liveness() {
        let timing = SessionTiming::default();
        let t0 = Instant::now();
        let (mut a, _) = established_pair(t0);
        let mut out = Vec::new();

        a.poll(&local(1, 0), t0 + Duration::from_secs(9), t0, &timing, &mut out);
        assert!(out.is_empty());
        a.poll(&local(1, 0), t0 + Duration::from_secs(10), t0, &timing, &mut out);
        assert!(matches!(out[0].packet, ControlPacket::Sync { count: 0, .. }));

        a.poll(&local(1, 0), t0 + Duration::from_secs(31), t0, &timing, &mut out);
        assert_eq!(a.state(), SessionState::TimedOut);
        assert_eq!(a.take_failure(), Some(SessionFailure::TimedOut));
    }

    #[test]
    fn test_end_and_scheduled_retry() {
        let timing = SessionTiming::default();
        let t0 = Instant::now();
        let (_, mut b) = established_pair(t0);
        let mut out = Vec::new();

        b.on_end();
        assert_eq!(b.state(), SessionState::Closed);
        assert_eq!(b.take_failure(), Some(SessionFailure::Ended));

        b.schedule_retry(t0 + timing.reconnect_delay);
        b.poll(&local(2, 0), t0 + Duration::from_secs(1), t0, &timing, &mut out);
        assert!(out.is_empty());
        b.poll(&local(2, 0), t0 + timing.reconnect_delay, t0, &timing, &mut out);
        assert_eq!(b.state(), SessionState::Invited(Role::ByUs));
        assert!(b.is_initiator());
        assert!(matches!(out[0].packet, ControlPacket::Invitation(_)));
    }

    #[test]
    fn test_restart_established_ends_under_old_ssrc() {
        let timing = SessionTiming::default();
        let t0 = Instant::now();
        let (mut a, mut b) = established_pair(t0);

        for session in [&mut a, &mut b] {
            let mut out = Vec::new();
            session.restart(7, &local(9, 0), t0, &timing, &mut out);

            assert_eq!(out.len(), 2);
            assert_eq!(out[0].port, Port::Control);
            match &out[0].packet {
                ControlPacket::End(ex) => assert_eq!(ex.ssrc, 7),
                other => panic!("unexpected packet {:?}", other),
            }
            match &out[1].packet {
                ControlPacket::Invitation(ex) => assert_eq!(ex.ssrc, 9),
                other => panic!("unexpected packet {:?}", other),
            }
            assert_eq!(session.state(), SessionState::Invited(Role::ByUs));
            assert!(session.is_initiator());
        }
    }

    #[test]
    fn test_restart_own_handshake_reinvites() {
        let timing = SessionTiming::default();
        let t0 = Instant::now();
        let mut a = Session::new();
        let mut out = Vec::new();

        a.invite(&local(1, 0), t0, &timing, &mut out);
        let invitation = match out.pop().unwrap().packet {
            ControlPacket::Invitation(ex) => ex,
            other => panic!("unexpected packet {:?}", other),
        };
        let ok = Exchange::new(invitation.token, 2, None);
        a.on_accepted(Port::Control, &ok, &local(1, 0), t0, &timing, &mut out);
        a.on_accepted(Port::Data, &ok, &local(1, 0), t0, &timing, &mut out);
        assert_eq!(a.state(), SessionState::Synchronizing);
        out.clear();

        a.restart(1, &local(9, 0), t0, &timing, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].port, Port::Control);
        match &out[0].packet {
            ControlPacket::Invitation(ex) => assert_eq!(ex.ssrc, 9),
            other => panic!("unexpected packet {:?}", other),
        }
        assert_eq!(a.state(), SessionState::Invited(Role::ByUs));
    }

    #[test]
    fn test_restart_leaves_closed_session() {
        let timing = SessionTiming::default();
        let mut session = Session::new();
        let mut out = Vec::new();

        session.restart(1, &local(9, 0), Instant::now(), &timing, &mut out);
        assert!(out.is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }
}
