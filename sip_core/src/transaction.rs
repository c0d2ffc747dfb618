use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::message::{cseq_method, cseq_number, header_value, Request, Response};

// Timer values from RFC 3261 (assuming UDP/unreliable transport)
const T1: Duration = Duration::from_millis(500);
const T2: Duration = Duration::from_secs(4);
const TIMER_H: Duration = Duration::from_millis(500 * 64); // 64 * T1
const TIMER_I: Duration = Duration::from_secs(5); // Time to keep transaction after ACK

/// How an incoming INVITE relates to what we have already seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteArrival {
    /// First time this transaction shows up.
    New,
    /// A retransmission; when we already answered, the response to replay.
    Retransmission(Option<Response>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InviteServerTxState {
    Proceeding,
    Completed,
    Confirmed,
}

#[derive(Debug, Clone)]
struct InviteServerTransaction {
    call_id: String,
    cseq: u32,
    remote: SocketAddr,
    last_response: Option<Response>,
    state: InviteServerTxState,
    timer_g_interval: Duration,
    next_timer_g: Option<Instant>,
    deadline_h: Option<Instant>,
    deadline_i: Option<Instant>,
}

impl InviteServerTransaction {
    fn new(call_id: &str, cseq: u32, remote: SocketAddr) -> Self {
        Self {
            call_id: call_id.to_string(),
            cseq,
            remote,
            last_response: None,
            state: InviteServerTxState::Proceeding,
            timer_g_interval: T1,
            next_timer_g: None,
            deadline_h: None,
            deadline_i: None,
        }
    }

    fn matches(&self, call_id: &str, cseq: u32) -> bool {
        self.call_id == call_id && self.cseq == cseq
    }

    fn update_with_response(&mut self, resp: &Response, now: Instant) {
        let status = resp.status_code;
        self.last_response = Some(resp.clone());

        // Provisional response -> stay in Proceeding, no timers.
        if status < 200 {
            return;
        }

        // Final response -> start retransmission timers
        self.state = InviteServerTxState::Completed;
        self.timer_g_interval = T1;
        self.next_timer_g = Some(now + self.timer_g_interval);
        self.deadline_h = Some(now + TIMER_H);
        self.deadline_i = None;
    }

    fn on_ack(&mut self, now: Instant) {
        // ACK stops retransmissions; keep transaction briefly (Timer I)
        self.state = InviteServerTxState::Confirmed;
        self.next_timer_g = None;
        self.deadline_i = Some(now + TIMER_I);
    }

    fn maybe_retransmit(&mut self, now: Instant) -> Option<Response> {
        if self.state != InviteServerTxState::Completed {
            return None;
        }

        let deadline_h = self.deadline_h?;
        if now >= deadline_h {
            // Give up waiting for ACK.
            self.next_timer_g = None;
            return None;
        }

        let next = self.next_timer_g?;
        if now < next {
            return None;
        }

        // Send the last response again, backoff timer G (max T2)
        if let Some(resp) = &self.last_response {
            let out = resp.clone();
            self.timer_g_interval = (self.timer_g_interval * 2).min(T2);
            self.next_timer_g = Some(now + self.timer_g_interval);
            return Some(out);
        }

        None
    }

    fn expired(&self, now: Instant) -> bool {
        match self.state {
            InviteServerTxState::Proceeding => false,
            InviteServerTxState::Completed => {
                self.deadline_h.map(|h| now >= h).unwrap_or(false)
            }
            InviteServerTxState::Confirmed => {
                self.deadline_i.map(|i| now >= i).unwrap_or(false)
            }
        }
    }
}

/// Tracks INVITE server transactions so retransmitted INVITEs are answered
/// with the previous response instead of surfacing as new calls, and final
/// responses are retransmitted until the peer's ACK arrives.
#[derive(Debug, Default)]
pub struct InviteServerTransactionManager {
    transactions: Vec<InviteServerTransaction>,
}

impl InviteServerTransactionManager {
    pub fn new() -> Self {
        Self {
            transactions: Vec::new(),
        }
    }

    /// Classify an incoming INVITE.
    pub fn on_invite(&mut self, req: &Request, remote: SocketAddr) -> InviteArrival {
        let Some(call_id) = header_value(&req.headers, "Call-ID") else {
            return InviteArrival::New;
        };
        let Some(cseq) = cseq_number(&req.headers) else {
            return InviteArrival::New;
        };

        if let Some(tx) = self
            .transactions
            .iter()
            .find(|t| t.matches(call_id, cseq))
        {
            return InviteArrival::Retransmission(tx.last_response.clone());
        }

        self.transactions
            .push(InviteServerTransaction::new(call_id, cseq, remote));
        InviteArrival::New
    }

    /// Record that we sent a response so the manager can retransmit it later.
    pub fn on_outgoing_response(
        &mut self,
        resp: &Response,
        remote: SocketAddr,
        now: Instant,
    ) {
        // Only track responses to INVITE
        if cseq_method(&resp.headers) != Some("INVITE") {
            return;
        }
        let Some(cseq) = cseq_number(&resp.headers) else {
            return;
        };
        let Some(call_id) = header_value(&resp.headers, "Call-ID") else {
            return;
        };

        let tx = self
            .transactions
            .iter_mut()
            .find(|t| t.matches(call_id, cseq));

        match tx {
            Some(t) => t.update_with_response(resp, now),
            None => {
                // If we somehow send a response without seeing the INVITE
                // first, start tracking now.
                let mut t = InviteServerTransaction::new(call_id, cseq, remote);
                t.update_with_response(resp, now);
                self.transactions.push(t);
            }
        }
    }

    pub fn on_ack(&mut self, ack: &Request, now: Instant) {
        let Some(call_id) = header_value(&ack.headers, "Call-ID") else {
            return;
        };
        let Some(cseq) = cseq_number(&ack.headers) else {
            return;
        };

        if let Some(tx) = self
            .transactions
            .iter_mut()
            .find(|t| t.matches(call_id, cseq))
        {
            tx.on_ack(now);
        }
    }

    /// Advance timers and produce any retransmissions that should go out now.
    pub fn poll(&mut self, now: Instant) -> Vec<(Response, SocketAddr)> {
        let mut out = Vec::new();

        for tx in &mut self.transactions {
            if let Some(resp) = tx.maybe_retransmit(now) {
                out.push((resp, tx.remote));
            }
        }

        self.transactions.retain(|tx| !tx.expired(now));

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Header, Method};
    use std::str::FromStr;

    fn sample_invite() -> Request {
        let mut req = Request::new(Method::Invite, "sip:alice@example.com");
        req.add_header(Header::new("Via", "SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bK1"));
        req.add_header(Header::new("From", "<sip:bob@example.com>;tag=from1"));
        req.add_header(Header::new("To", "<sip:alice@example.com>"));
        req.add_header(Header::new("Call-ID", "call123"));
        req.add_header(Header::new("CSeq", "1 INVITE"));
        req.add_header(Header::new("Content-Length", "0"));
        req
    }

    fn sample_response(status: u16) -> Response {
        let mut resp = Response::new(status, "OK");
        resp.add_header(Header::new("Via", "SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bK1"));
        resp.add_header(Header::new("From", "<sip:bob@example.com>;tag=from1"));
        resp.add_header(Header::new("To", "<sip:alice@example.com>;tag=to1"));
        resp.add_header(Header::new("Call-ID", "call123"));
        resp.add_header(Header::new("CSeq", "1 INVITE"));
        resp.add_header(Header::new("Content-Length", "0"));
        resp
    }

    fn sample_ack() -> Request {
        let mut req = Request::new(Method::Ack, "sip:alice@example.com");
        req.add_header(Header::new("Call-ID", "call123"));
        req.add_header(Header::new("CSeq", "1 ACK"));
        req
    }

    #[test]
    fn retransmits_final_response_until_ack() {
        let mut mgr = InviteServerTransactionManager::new();
        let base = Instant::now();
        let remote = SocketAddr::from_str("192.0.2.10:5060").unwrap();
        let invite = sample_invite();

        // First INVITE starts transaction
        assert_eq!(mgr.on_invite(&invite, remote), InviteArrival::New);

        // Final response arms timers
        let resp = sample_response(200);
        mgr.on_outgoing_response(&resp, remote, base);

        // Before T1: no retransmission
        assert!(mgr.poll(base + Duration::from_millis(100)).is_empty());

        // At T1: one retransmission
        let events = mgr.poll(base + T1);
        assert_eq!(events.len(), 1);

        // ACK stops further retransmissions
        mgr.on_ack(&sample_ack(), base + Duration::from_secs(1));
        assert!(mgr.poll(base + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn repeated_invite_replays_last_response() {
        let mut mgr = InviteServerTransactionManager::new();
        let remote = SocketAddr::from_str("192.0.2.10:5060").unwrap();
        let invite = sample_invite();
        assert_eq!(mgr.on_invite(&invite, remote), InviteArrival::New);

        // retransmission before any response: recognized, nothing to replay
        assert_eq!(
            mgr.on_invite(&invite, remote),
            InviteArrival::Retransmission(None)
        );

        let resp = sample_response(180);
        mgr.on_outgoing_response(&resp, remote, Instant::now());

        match mgr.on_invite(&invite, remote) {
            InviteArrival::Retransmission(Some(r)) => assert_eq!(r.status_code, 180),
            other => panic!("unexpected arrival: {other:?}"),
        }
    }
}
