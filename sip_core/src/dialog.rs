use core::fmt::Write;

use crate::{
    header_value,
    message::{Header, Method, Request, Response},
    Result, SipError,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    #[default]
    Idle,
    Inviting,
    Ringing,
    Established,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogRole {
    Uac, // we initiated the call
    Uas, // remote initiated the call
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipDialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

/// Outcome of a final or provisional response to our INVITE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteOutcome {
    /// Not for this dialog, or already resolved.
    Ignored,
    /// Peer is ringing (180/183).
    PeerRinging,
    /// Peer accepted; send the ACK, the body holds the answer.
    Accepted { ack: Request },
    /// Peer rejected with `status`; the ACK still has to go out.
    Rejected { status: u16, ack: Request },
}

/// Responses owed after an incoming CANCEL: 200 for the CANCEL itself and,
/// when the INVITE was still unanswered, its 487.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub cancel_ok: Response,
    pub invite_487: Option<Response>,
}

/// One INVITE dialog, UAC or UAS side. The application creates a fresh
/// `Dialog` per call attempt and drives it from parsed messages; no I/O
/// happens here.
#[derive(Debug, Default)]
pub struct Dialog {
    pub state: DialogState,
    pub role: Option<DialogRole>,
    pub id: Option<SipDialogId>,
    cseq: u32,

    // Header values reused verbatim on in-dialog messages. `local_header`
    // is our From (UAC) / To (UAS) value including tag; `remote_header` the
    // peer's, once its tag is known.
    local_header: String,
    remote_header: String,
    remote_target: String,
    contact_uri: String,
    via_host: String,
    via_port: u16,

    invite_cseq: u32,
    invite_branch: String,
    last_invite: Option<Request>,

    next_tag_counter: u32,
    branch_counter: u32,
}

impl Dialog {
    pub fn new() -> Self {
        Self {
            next_tag_counter: 1,
            branch_counter: 1,
            ..Self::default()
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.id.as_ref().map(|id| id.call_id.as_str())
    }

    fn allocate_tag(&mut self) -> String {
        let idx = self.next_tag_counter;
        self.next_tag_counter = self.next_tag_counter.wrapping_add(1);
        format!("dlg{idx:x}")
    }

    fn next_branch(&mut self) -> String {
        let idx = self.branch_counter;
        self.branch_counter = self.branch_counter.wrapping_add(1);
        format!("z9hG4bK{idx:08x}")
    }

    fn via_header(&mut self) -> Header {
        let branch = self.next_branch();
        Header::new(
            "Via",
            &format!(
                "SIP/2.0/UDP {}:{};branch={};rport",
                self.via_host, self.via_port, branch
            ),
        )
    }

    // --- UAC side -----------------------------------------------------------

    /// Start an outgoing INVITE toward `target`, carrying `body` as SDP.
    pub fn start_outgoing(
        &mut self,
        target: &str,
        local_uri: &str,
        contact_uri: &str,
        via_host: &str,
        via_port: u16,
        call_id: &str,
        body: &str,
    ) -> Result<Request> {
        if self.state != DialogState::Idle && self.state != DialogState::Terminated {
            return Err(SipError::InvalidState("dialog busy"));
        }
        self.state = DialogState::Inviting;
        self.role = Some(DialogRole::Uac);
        self.via_host = via_host.to_string();
        self.via_port = via_port;
        self.contact_uri = contact_uri.to_string();

        let local_tag = self.allocate_tag();
        self.local_header = format!("<{local_uri}>;tag={local_tag}");
        self.remote_header = format!("<{target}>");
        self.remote_target = target.to_string();
        self.id = Some(SipDialogId {
            call_id: call_id.to_string(),
            local_tag,
            remote_tag: String::new(),
        });

        self.cseq = self.cseq.wrapping_add(1);
        self.invite_cseq = self.cseq;
        self.invite_branch = self.next_branch();

        let mut req = Request::new(Method::Invite, target);
        req.add_header(Header::new(
            "Via",
            &format!(
                "SIP/2.0/UDP {via_host}:{via_port};branch={};rport",
                self.invite_branch
            ),
        ));
        req.add_header(Header::new("Max-Forwards", "70"));
        req.add_header(Header::new("From", &self.local_header));
        req.add_header(Header::new("To", &self.remote_header));
        req.add_header(Header::new("Call-ID", call_id));
        req.add_header(Header::new("CSeq", &format!("{} INVITE", self.cseq)));
        req.add_header(Header::new("Contact", &format!("<{contact_uri}>")));
        req.set_body(body, "application/sdp");

        self.last_invite = Some(req.clone());
        Ok(req)
    }

    /// Route a response to our INVITE through the dialog state machine.
    pub fn handle_invite_response(&mut self, resp: &Response) -> InviteOutcome {
        if self.role != Some(DialogRole::Uac) {
            return InviteOutcome::Ignored;
        }
        if !matches!(self.state, DialogState::Inviting | DialogState::Ringing) {
            return InviteOutcome::Ignored;
        }
        let Some(id) = &self.id else {
            return InviteOutcome::Ignored;
        };
        if header_value(&resp.headers, "Call-ID") != Some(id.call_id.as_str()) {
            return InviteOutcome::Ignored;
        }

        match resp.status_code {
            180 | 183 => {
                self.state = DialogState::Ringing;
                InviteOutcome::PeerRinging
            }
            100..=199 => InviteOutcome::Ignored,
            200..=299 => {
                self.capture_remote(resp);
                self.state = DialogState::Established;
                match self.build_ack() {
                    Ok(ack) => InviteOutcome::Accepted { ack },
                    Err(_) => InviteOutcome::Ignored,
                }
            }
            status => {
                self.capture_remote(resp);
                self.state = DialogState::Terminated;
                match self.build_ack() {
                    Ok(ack) => InviteOutcome::Rejected { status, ack },
                    Err(_) => InviteOutcome::Ignored,
                }
            }
        }
    }

    /// Remember the peer's To tag and Contact from a final response.
    fn capture_remote(&mut self, resp: &Response) {
        if let Some(to) = header_value(&resp.headers, "To") {
            self.remote_header = to.to_string();
            if let (Some(id), Some(tag)) = (self.id.as_mut(), parse_tag_param(to)) {
                id.remote_tag = tag.to_string();
            }
        }
        if let Some(contact) = header_value(&resp.headers, "Contact") {
            self.remote_target = strip_angle_brackets(contact).to_string();
        }
    }

    /// ACK for the INVITE's final response (RFC 3261 17.1.1.3: same CSeq
    /// number, method ACK).
    fn build_ack(&mut self) -> Result<Request> {
        let id = self.id.clone().ok_or(SipError::InvalidState("no dialog"))?;
        let target = self.remote_target.clone();
        let via = self.via_header();
        let mut req = Request::new(Method::Ack, &target);
        req.add_header(via);
        req.add_header(Header::new("Max-Forwards", "70"));
        req.add_header(Header::new("From", &self.local_header));
        req.add_header(Header::new("To", &self.remote_header));
        req.add_header(Header::new("Call-ID", &id.call_id));
        req.add_header(Header::new("CSeq", &format!("{} ACK", self.invite_cseq)));
        req.add_header(Header::new("Content-Length", "0"));
        Ok(req)
    }

    /// CANCEL our own unanswered INVITE. Same branch and CSeq number as the
    /// INVITE, method CANCEL.
    pub fn build_cancel(&mut self) -> Result<Request> {
        if self.role != Some(DialogRole::Uac)
            || !matches!(self.state, DialogState::Inviting | DialogState::Ringing)
        {
            return Err(SipError::InvalidState("nothing to cancel"));
        }
        let invite = self
            .last_invite
            .as_ref()
            .ok_or(SipError::InvalidState("no invite"))?;

        let mut req = Request::new(Method::Cancel, &invite.uri);
        for name in ["Via", "From", "To", "Call-ID"] {
            if let Some(value) = header_value(&invite.headers, name) {
                req.add_header(Header::new(name, value));
            }
        }
        req.add_header(Header::new("Max-Forwards", "70"));
        req.add_header(Header::new(
            "CSeq",
            &format!("{} CANCEL", self.invite_cseq),
        ));
        req.add_header(Header::new("Content-Length", "0"));
        self.state = DialogState::Terminated;
        Ok(req)
    }

    // --- UAS side -----------------------------------------------------------

    /// Interpret an incoming INVITE as a dialog start and remember what we
    /// need to answer it and to send in-dialog requests later.
    pub fn classify_incoming_invite(&mut self, req: &Request) -> Result<SipDialogId> {
        let call_id = header_value(&req.headers, "Call-ID")
            .ok_or(SipError::Invalid("missing Call-ID"))?
            .to_string();
        let from = header_value(&req.headers, "From")
            .ok_or(SipError::Invalid("missing From"))?
            .to_string();
        let to = header_value(&req.headers, "To")
            .ok_or(SipError::Invalid("missing To"))?
            .to_string();
        let remote_tag = parse_tag_param(&from).unwrap_or("").to_string();

        let local_tag = self.allocate_tag();
        self.local_header = format!("{to};tag={local_tag}");
        self.remote_header = from.clone();
        self.remote_target = header_value(&req.headers, "Contact")
            .map(|c| strip_angle_brackets(c).to_string())
            .unwrap_or_else(|| strip_angle_brackets(&from).to_string());

        let id = SipDialogId {
            call_id,
            local_tag,
            remote_tag,
        };
        self.id = Some(id.clone());
        self.role = Some(DialogRole::Uas);
        self.state = DialogState::Ringing;
        self.last_invite = Some(req.clone());

        Ok(id)
    }

    /// Build a response (180, 200, 486, ...) for an incoming request,
    /// copying the correlation headers and tagging To with our local tag.
    pub fn build_response_for_request(
        &mut self,
        req: &Request,
        status: u16,
        reason: &str,
        body: Option<&str>,
    ) -> Result<Response> {
        let mut resp = Response::new(status, reason);

        let via = header_value(&req.headers, "Via")
            .ok_or(SipError::Invalid("missing Via"))?;
        resp.add_header(Header::new("Via", via));

        let from = header_value(&req.headers, "From")
            .ok_or(SipError::Invalid("missing From"))?;
        resp.add_header(Header::new("From", from));

        let raw_to = header_value(&req.headers, "To")
            .ok_or(SipError::Invalid("missing To"))?;
        let mut to_value = raw_to.to_string();
        if !raw_to.to_ascii_lowercase().contains("tag=") {
            let tag = match &self.id {
                Some(id) if !id.local_tag.is_empty() => id.local_tag.clone(),
                _ => self.allocate_tag(),
            };
            let _ = write!(to_value, ";tag={tag}");
        }
        resp.add_header(Header::new("To", &to_value));

        let call_id = header_value(&req.headers, "Call-ID")
            .ok_or(SipError::Invalid("missing Call-ID"))?;
        resp.add_header(Header::new("Call-ID", call_id));

        let cseq = header_value(&req.headers, "CSeq")
            .ok_or(SipError::Invalid("missing CSeq"))?;
        resp.add_header(Header::new("CSeq", cseq));

        if !self.contact_uri.is_empty() {
            resp.add_header(Header::new(
                "Contact",
                &format!("<{}>", self.contact_uri),
            ));
        }

        match body {
            Some(b) => resp.set_body(b, "application/sdp"),
            None => resp.add_header(Header::new("Content-Length", "0")),
        }

        Ok(resp)
    }

    /// Contact URI advertised in our responses and in-dialog requests.
    pub fn set_contact(&mut self, contact_uri: &str) {
        self.contact_uri = contact_uri.to_string();
    }

    pub fn set_via(&mut self, host: &str, port: u16) {
        self.via_host = host.to_string();
        self.via_port = port;
    }

    /// ACK from the peer confirms our 200; the call is up.
    pub fn handle_incoming_ack(&mut self, req: &Request) -> Result<()> {
        self.require_same_call(req)?;
        if self.role == Some(DialogRole::Uas) && self.state == DialogState::Ringing {
            self.state = DialogState::Established;
        }
        Ok(())
    }

    /// CANCEL of the peer's own unanswered INVITE.
    pub fn handle_incoming_cancel(&mut self, req: &Request) -> Result<CancelOutcome> {
        self.require_same_call(req)?;

        let cancel_ok = self.build_response_for_request(req, 200, "OK", None)?;

        let invite_487 = if self.role == Some(DialogRole::Uas)
            && self.state == DialogState::Ringing
        {
            let invite = self
                .last_invite
                .clone()
                .ok_or(SipError::InvalidState("no invite"))?;
            self.state = DialogState::Terminated;
            Some(self.build_response_for_request(
                &invite,
                487,
                "Request Terminated",
                None,
            )?)
        } else {
            None
        };

        Ok(CancelOutcome {
            cancel_ok,
            invite_487,
        })
    }

    /// BYE from the peer. Duplicates after termination still get their 200
    /// (retransmitting peers must not fault us).
    pub fn handle_incoming_bye(&mut self, req: &Request) -> Result<Response> {
        self.require_same_call(req)?;
        let resp = self.build_response_for_request(req, 200, "OK", None)?;
        self.state = DialogState::Terminated;
        Ok(resp)
    }

    /// BYE for an established call, either role.
    pub fn build_bye(&mut self) -> Result<Request> {
        if self.state != DialogState::Established {
            return Err(SipError::InvalidState("no established call"));
        }
        let id = self
            .id
            .clone()
            .ok_or(SipError::InvalidState("no dialog"))?;

        self.cseq = self.cseq.wrapping_add(1);
        let mut req = Request::new(Method::Bye, &self.remote_target.clone());
        let via = self.via_header();
        req.add_header(via);
        req.add_header(Header::new("Max-Forwards", "70"));
        req.add_header(Header::new("From", &self.local_header));
        req.add_header(Header::new("To", &self.remote_header));
        req.add_header(Header::new("Call-ID", &id.call_id));
        req.add_header(Header::new("CSeq", &format!("{} BYE", self.cseq)));
        req.add_header(Header::new("Content-Length", "0"));
        self.state = DialogState::Terminated;
        Ok(req)
    }

    fn require_same_call(&self, req: &Request) -> Result<()> {
        let call_id = header_value(&req.headers, "Call-ID")
            .ok_or(SipError::Invalid("missing Call-ID"))?;
        match &self.id {
            Some(id) if id.call_id == call_id => Ok(()),
            _ => Err(SipError::InvalidState("foreign dialog")),
        }
    }
}

/// Response to a request outside any dialog we track (486 for a second
/// caller, 200 for OPTIONS, ...). Correlation headers are copied verbatim.
pub fn stateless_response(req: &Request, status: u16, reason: &str) -> Result<Response> {
    let mut resp = Response::new(status, reason);
    for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
        let value =
            header_value(&req.headers, name).ok_or(SipError::Invalid("missing header"))?;
        resp.add_header(Header::new(name, value));
    }
    resp.add_header(Header::new("Content-Length", "0"));
    Ok(resp)
}

fn parse_tag_param(input: &str) -> Option<&str> {
    let lower = input.to_ascii_lowercase();
    let pos = lower.find("tag=")?;
    let rest = &input[pos + 4..];
    let end = rest.find(';').unwrap_or(rest.len());
    Some(&rest[..end])
}

fn strip_angle_brackets(input: &str) -> &str {
    let input = input.trim();
    match (input.find('<'), input.find('>')) {
        (Some(open), Some(close)) if open < close => &input[open + 1..close],
        _ => input.split(';').next().unwrap_or(input),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::header_value;

    fn outgoing_dialog() -> (Dialog, Request) {
        let mut dialog = Dialog::new();
        let invite = dialog
            .start_outgoing(
                "sip:bob@example.com",
                "sip:alice@example.com",
                "sip:alice@192.0.2.1:5060",
                "192.0.2.1",
                5060,
                "call-abc",
                "v=0\r\n",
            )
            .unwrap();
        (dialog, invite)
    }

    fn answer_for(invite: &Request, status: u16) -> Response {
        let mut resp = Response::new(status, "X");
        for name in ["Via", "From", "Call-ID", "CSeq"] {
            resp.add_header(Header::new(
                name,
                header_value(&invite.headers, name).unwrap(),
            ));
        }
        let to = header_value(&invite.headers, "To").unwrap();
        resp.add_header(Header::new("To", &format!("{to};tag=peer1")));
        resp.add_header(Header::new("Contact", "<sip:bob@198.51.100.2:5060>"));
        resp
    }

    #[test]
    fn outgoing_invite_carries_dialog_headers() {
        let (dialog, invite) = outgoing_dialog();
        assert_eq!(dialog.state, DialogState::Inviting);
        assert_eq!(invite.method, Method::Invite);
        assert!(header_value(&invite.headers, "From").unwrap().contains("tag="));
        assert_eq!(header_value(&invite.headers, "Call-ID"), Some("call-abc"));
        assert!(header_value(&invite.headers, "CSeq").unwrap().ends_with("INVITE"));
        assert_eq!(
            header_value(&invite.headers, "Content-Type"),
            Some("application/sdp")
        );
    }

    #[test]
    fn accepted_invite_produces_ack_and_establishes() {
        let (mut dialog, invite) = outgoing_dialog();

        assert_eq!(
            dialog.handle_invite_response(&answer_for(&invite, 180)),
            InviteOutcome::PeerRinging
        );
        assert_eq!(dialog.state, DialogState::Ringing);

        match dialog.handle_invite_response(&answer_for(&invite, 200)) {
            InviteOutcome::Accepted { ack } => {
                assert_eq!(ack.method, Method::Ack);
                assert_eq!(ack.uri, "sip:bob@198.51.100.2:5060");
                assert!(header_value(&ack.headers, "CSeq").unwrap().ends_with("ACK"));
                assert!(header_value(&ack.headers, "To").unwrap().contains("tag=peer1"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(dialog.state, DialogState::Established);
        assert_eq!(dialog.id.unwrap().remote_tag, "peer1");
    }

    #[test]
    fn rejected_invite_still_acks() {
        let (mut dialog, invite) = outgoing_dialog();
        match dialog.handle_invite_response(&answer_for(&invite, 488)) {
            InviteOutcome::Rejected { status, ack } => {
                assert_eq!(status, 488);
                assert_eq!(ack.method, Method::Ack);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(dialog.state, DialogState::Terminated);
    }

    #[test]
    fn foreign_call_id_response_is_ignored() {
        let (mut dialog, invite) = outgoing_dialog();
        let mut resp = answer_for(&invite, 200);
        for header in &mut resp.headers {
            if header.name == "Call-ID" {
                header.value = "other-call".into();
            }
        }
        assert_eq!(dialog.handle_invite_response(&resp), InviteOutcome::Ignored);
        assert_eq!(dialog.state, DialogState::Inviting);
    }

    #[test]
    fn cancel_reuses_invite_identity() {
        let (mut dialog, invite) = outgoing_dialog();
        let cancel = dialog.build_cancel().unwrap();
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(
            header_value(&cancel.headers, "Via"),
            header_value(&invite.headers, "Via")
        );
        assert!(header_value(&cancel.headers, "CSeq").unwrap().ends_with("CANCEL"));
        assert_eq!(dialog.state, DialogState::Terminated);
    }

    fn sample_invite() -> Request {
        let mut req = Request::new(Method::Invite, "sip:alice@example.com");
        req.add_header(Header::new("Via", "SIP/2.0/UDP 198.51.100.2:5060;branch=z9hG4bK1"));
        req.add_header(Header::new("From", "<sip:bob@example.com>;tag=from1"));
        req.add_header(Header::new("To", "<sip:alice@example.com>"));
        req.add_header(Header::new("Call-ID", "call123"));
        req.add_header(Header::new("CSeq", "1 INVITE"));
        req.add_header(Header::new("Contact", "<sip:bob@198.51.100.2:5060>"));
        req
    }

    #[test]
    fn incoming_invite_then_ack_establishes() {
        let mut dialog = Dialog::new();
        let id = dialog.classify_incoming_invite(&sample_invite()).unwrap();
        assert_eq!(id.call_id, "call123");
        assert_eq!(id.remote_tag, "from1");
        assert_eq!(dialog.state, DialogState::Ringing);

        let ok = dialog
            .build_response_for_request(&sample_invite(), 200, "OK", Some("v=0\r\n"))
            .unwrap();
        assert!(header_value(&ok.headers, "To").unwrap().contains("tag="));
        assert_eq!(ok.body, "v=0\r\n");

        let mut ack = Request::new(Method::Ack, "sip:alice@example.com");
        ack.add_header(Header::new("Call-ID", "call123"));
        dialog.handle_incoming_ack(&ack).unwrap();
        assert_eq!(dialog.state, DialogState::Established);
    }

    #[test]
    fn incoming_cancel_yields_ok_and_487() {
        let mut dialog = Dialog::new();
        dialog.classify_incoming_invite(&sample_invite()).unwrap();

        let mut cancel = sample_invite();
        cancel.method = Method::Cancel;
        let outcome = dialog.handle_incoming_cancel(&cancel).unwrap();
        assert_eq!(outcome.cancel_ok.status_code, 200);
        assert_eq!(outcome.invite_487.unwrap().status_code, 487);
        assert_eq!(dialog.state, DialogState::Terminated);
    }

    #[test]
    fn duplicate_bye_is_absorbed() {
        let mut dialog = Dialog::new();
        dialog.classify_incoming_invite(&sample_invite()).unwrap();
        let mut ack = Request::new(Method::Ack, "sip:alice@example.com");
        ack.add_header(Header::new("Call-ID", "call123"));
        dialog.handle_incoming_ack(&ack).unwrap();

        let mut bye = sample_invite();
        bye.method = Method::Bye;
        assert_eq!(dialog.handle_incoming_bye(&bye).unwrap().status_code, 200);
        assert_eq!(dialog.state, DialogState::Terminated);
        // retransmitted BYE
        assert_eq!(dialog.handle_incoming_bye(&bye).unwrap().status_code, 200);
    }

    #[test]
    fn uas_bye_uses_peer_identity() {
        let mut dialog = Dialog::new();
        dialog.set_via("192.0.2.1", 5060);
        dialog.classify_incoming_invite(&sample_invite()).unwrap();
        let mut ack = Request::new(Method::Ack, "sip:alice@example.com");
        ack.add_header(Header::new("Call-ID", "call123"));
        dialog.handle_incoming_ack(&ack).unwrap();

        let bye = dialog.build_bye().unwrap();
        assert_eq!(bye.uri, "sip:bob@198.51.100.2:5060");
        assert!(header_value(&bye.headers, "To").unwrap().contains("tag=from1"));
        assert!(header_value(&bye.headers, "From").unwrap().contains("tag=dlg"));
        assert_eq!(dialog.state, DialogState::Terminated);
    }
}
