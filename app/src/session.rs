use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Originator,
    Recipient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Outbound call waiting for the peer's answer.
    Calling,
    /// Inbound call waiting for our user.
    Ringing,
    /// Answer exchanged, waiting for the final acknowledgment.
    Connecting,
    Connected,
    Terminated,
}

/// One call through its lifecycle. State moves only through [`transition`],
/// a compare-and-swap against the expected predecessors, so a stale handler
/// firing after teardown cannot resurrect the call.
///
/// [`transition`]: CallSession::transition
#[derive(Debug)]
pub struct CallSession {
    call_id: String,
    role: CallRole,
    state: CallState,
    remote_uri: String,
    remote_text: Option<SocketAddr>,
    t140_pt: u8,
    red_pt: Option<u8>,
    created: Instant,
}

impl CallSession {
    pub fn inbound(call_id: &str, remote_uri: &str) -> Self {
        Self::new(call_id, remote_uri, CallRole::Recipient, CallState::Ringing)
    }

    pub fn outbound(call_id: &str, remote_uri: &str) -> Self {
        Self::new(call_id, remote_uri, CallRole::Originator, CallState::Calling)
    }

    fn new(call_id: &str, remote_uri: &str, role: CallRole, state: CallState) -> Self {
        Self {
            call_id: call_id.to_string(),
            role,
            state,
            remote_uri: remote_uri.to_string(),
            remote_text: None,
            t140_pt: sdp::DEFAULT_T140_PT,
            red_pt: None,
            created: Instant::now(),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn remote_uri(&self) -> &str {
        &self.remote_uri
    }

    pub fn is_active(&self) -> bool {
        self.state != CallState::Terminated
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    /// Move to `to` only when the current state is one of `from`. Returns
    /// whether the transition happened.
    pub fn transition(&mut self, from: &[CallState], to: CallState) -> bool {
        if from.contains(&self.state) {
            log::debug!("call {}: {:?} -> {to:?}", self.call_id, self.state);
            self.state = to;
            true
        } else {
            log::debug!(
                "call {}: refusing {:?} -> {to:?}",
                self.call_id,
                self.state
            );
            false
        }
    }

    /// Idempotent: terminating a dead session is a no-op, not an error.
    /// Returns whether the session was still active.
    pub fn terminate(&mut self) -> bool {
        let was_active = self.is_active();
        self.state = CallState::Terminated;
        was_active
    }

    pub fn set_media(&mut self, remote: SocketAddr, t140_pt: u8, red_pt: Option<u8>) {
        self.remote_text = Some(remote);
        self.t140_pt = t140_pt;
        self.red_pt = red_pt;
    }

    pub fn remote_text(&self) -> Option<SocketAddr> {
        self.remote_text
    }

    pub fn t140_pt(&self) -> u8 {
        self.t140_pt
    }

    pub fn red_pt(&self) -> Option<u8> {
        self.red_pt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_call_walks_the_lifecycle() {
        let mut session = CallSession::inbound("c1", "sip:bob@example.com");
        assert_eq!(session.state(), CallState::Ringing);
        assert_eq!(session.role(), CallRole::Recipient);

        assert!(session.transition(&[CallState::Ringing], CallState::Connecting));
        assert!(session.transition(&[CallState::Connecting], CallState::Connected));
        assert!(session.is_active());

        assert!(session.terminate());
        assert_eq!(session.state(), CallState::Terminated);
    }

    #[test]
    fn outbound_call_starts_in_calling() {
        let session = CallSession::outbound("c2", "sip:bob@example.com");
        assert_eq!(session.state(), CallState::Calling);
        assert_eq!(session.role(), CallRole::Originator);
    }

    #[test]
    fn stale_transition_is_refused() {
        let mut session = CallSession::inbound("c3", "sip:bob@example.com");
        session.terminate();

        // a late ACK handler must not revive the call
        assert!(!session.transition(&[CallState::Connecting], CallState::Connected));
        assert_eq!(session.state(), CallState::Terminated);
    }

    #[test]
    fn terminate_is_idempotent() {
        let mut session = CallSession::inbound("c4", "sip:bob@example.com");
        assert!(session.terminate());
        assert!(!session.terminate());
    }
}
