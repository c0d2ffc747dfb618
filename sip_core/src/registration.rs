use crate::{
    auth::DigestChallenge,
    header_value,
    message::{Header, Method, Request},
    Result, SipError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registering,
    Registered,
    Unregistering,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationResult {
    Registered(u32),
    Unregistered,
    AuthRequired,
    Failed(u16),
}

/// The REGISTER refresh cycle toward one registrar. Builds requests and
/// digests responses; the application schedules and sends.
#[derive(Debug)]
pub struct RegistrationTransaction {
    state: RegistrationState,
    cseq: u32,
    call_id: String,
    from_tag: String,
    branch_counter: u32,
    last_expires: u32,
    last_challenge: Option<DigestChallenge>,
}

impl Default for RegistrationTransaction {
    fn default() -> Self {
        Self {
            state: RegistrationState::Unregistered,
            cseq: 0,
            call_id: simple_token("reg", 1),
            from_tag: simple_token("from", 1),
            branch_counter: 1,
            last_expires: 3600,
            last_challenge: None,
        }
    }
}

impl RegistrationTransaction {
    pub fn build_register(
        &mut self,
        registrar_uri: &str,
        contact_uri: &str,
        via_host: &str,
        via_port: u16,
        expires: u32,
        auth_header: Option<Header>,
    ) -> Result<Request> {
        if matches!(
            self.state,
            RegistrationState::Registering | RegistrationState::Unregistering
        ) {
            return Err(SipError::InvalidState("register in flight"));
        }

        self.cseq = self.cseq.wrapping_add(1);
        self.state = if expires == 0 {
            RegistrationState::Unregistering
        } else {
            RegistrationState::Registering
        };

        let mut req = Request::new(Method::Register, registrar_uri);
        req.add_header(build_via(via_host, via_port, self.next_branch()));
        req.add_header(Header::new("Max-Forwards", "70"));
        req.add_header(build_tagged(
            "From",
            contact_uri,
            &self.from_tag,
        ));
        req.add_header(Header::new("To", &format!("<{contact_uri}>")));
        req.add_header(Header::new("Call-ID", &self.call_id));
        req.add_header(Header::new("CSeq", &format!("{} REGISTER", self.cseq)));
        req.add_header(Header::new("Contact", &format!("<{contact_uri}>")));
        req.add_header(Header::new("Expires", &expires.to_string()));
        if let Some(auth) = auth_header {
            req.add_header(auth);
        }
        req.add_header(Header::new("Content-Length", "0"));

        Ok(req)
    }

    /// Drop the binding (REGISTER with Expires: 0).
    pub fn build_unregister(
        &mut self,
        registrar_uri: &str,
        contact_uri: &str,
        via_host: &str,
        via_port: u16,
        auth_header: Option<Header>,
    ) -> Result<Request> {
        // An in-flight refresh does not block an explicit unregister.
        if self.state == RegistrationState::Registering {
            self.state = RegistrationState::Registered;
        }
        self.build_register(registrar_uri, contact_uri, via_host, via_port, 0, auth_header)
    }

    pub fn handle_response(&mut self, resp: &crate::message::Response) -> RegistrationResult {
        match resp.status_code {
            200 => {
                if self.state == RegistrationState::Unregistering {
                    self.state = RegistrationState::Unregistered;
                    return RegistrationResult::Unregistered;
                }
                self.state = RegistrationState::Registered;
                let expires = header_value(&resp.headers, "Expires")
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(self.last_expires);
                self.last_expires = expires;
                RegistrationResult::Registered(expires)
            }
            401 | 407 => {
                let challenge = resp
                    .headers
                    .iter()
                    .find(|h| {
                        h.name.eq_ignore_ascii_case("WWW-Authenticate")
                            || h.name.eq_ignore_ascii_case("Proxy-Authenticate")
                    })
                    .and_then(|h| crate::auth::parse_www_authenticate(&h.value).ok());
                if let Some(challenge) = challenge {
                    self.last_challenge = Some(challenge);
                }
                self.state = RegistrationState::Unregistered;
                RegistrationResult::AuthRequired
            }
            code => {
                self.state = RegistrationState::Error;
                RegistrationResult::Failed(code)
            }
        }
    }

    /// Forget any in-flight attempt, e.g. after a send timeout or a local
    /// address change. The next timer tick starts over.
    pub fn reset_to_unregistered(&mut self) {
        self.state = RegistrationState::Unregistered;
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn last_expires(&self) -> u32 {
        self.last_expires
    }

    pub fn last_challenge(&self) -> Option<DigestChallenge> {
        self.last_challenge.clone()
    }

    pub fn next_branch(&mut self) -> String {
        let counter = self.branch_counter;
        self.branch_counter = self.branch_counter.wrapping_add(1);
        format!("z9hG4bK{counter:08x}")
    }

    /// Refresh at 80% of the granted lifetime.
    pub fn next_refresh_interval_secs(&self) -> u64 {
        let expires = self.last_expires.max(5);
        (expires as u64 * 8) / 10
    }
}

fn simple_token(prefix: &str, counter: u32) -> String {
    format!("{prefix}-{counter:x}")
}

fn build_via(host: &str, port: u16, branch: String) -> Header {
    Header::new(
        "Via",
        &format!("SIP/2.0/UDP {host}:{port};branch={branch};rport"),
    )
}

fn build_tagged(name: &str, uri: &str, tag: &str) -> Header {
    Header::new(name, &format!("<{uri}>;tag={tag}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Method, Response};

    #[test]
    fn registration_flow() {
        let mut reg = RegistrationTransaction::default();
        let req = reg
            .build_register(
                "sip:example.com",
                "sip:user@example.com",
                "192.0.2.1",
                5060,
                120,
                None,
            )
            .unwrap();
        assert_eq!(req.method, Method::Register);
        assert_eq!(reg.state(), RegistrationState::Registering);

        let mut resp = Response::new(200, "OK");
        resp.add_header(Header::new("Expires", "120"));
        assert_eq!(reg.handle_response(&resp), RegistrationResult::Registered(120));
        assert_eq!(reg.state(), RegistrationState::Registered);
        assert_eq!(reg.next_refresh_interval_secs(), 96);
    }

    #[test]
    fn challenge_is_remembered_for_retry() {
        let mut reg = RegistrationTransaction::default();
        reg.build_register("sip:r", "sip:u@r", "h", 5060, 60, None)
            .unwrap();

        let mut resp = Response::new(401, "Unauthorized");
        resp.add_header(Header::new(
            "WWW-Authenticate",
            r#"Digest realm="r", nonce="n1", algorithm=MD5"#,
        ));
        assert_eq!(reg.handle_response(&resp), RegistrationResult::AuthRequired);
        assert_eq!(reg.last_challenge().unwrap().nonce, "n1");
        // the failed attempt no longer blocks a retry
        assert!(reg.build_register("sip:r", "sip:u@r", "h", 5060, 60, None).is_ok());
    }

    #[test]
    fn unregister_sends_expires_zero() {
        let mut reg = RegistrationTransaction::default();
        reg.build_register("sip:r", "sip:u@r", "h", 5060, 60, None)
            .unwrap();
        reg.handle_response(&Response::new(200, "OK"));

        let req = reg
            .build_unregister("sip:r", "sip:u@r", "h", 5060, None)
            .unwrap();
        assert_eq!(header_value(&req.headers, "Expires"), Some("0"));
        assert_eq!(reg.state(), RegistrationState::Unregistering);

        assert_eq!(
            reg.handle_response(&Response::new(200, "OK")),
            RegistrationResult::Unregistered
        );
        assert_eq!(reg.state(), RegistrationState::Unregistered);
    }

    #[test]
    fn in_flight_attempt_blocks_duplicates_until_reset() {
        let mut reg = RegistrationTransaction::default();
        reg.build_register("sip:r", "sip:u@r", "h", 5060, 60, None)
            .unwrap();
        assert!(reg.build_register("sip:r", "sip:u@r", "h", 5060, 60, None).is_err());

        reg.reset_to_unregistered();
        assert!(reg.build_register("sip:r", "sip:u@r", "h", 5060, 60, None).is_ok());
    }
}
