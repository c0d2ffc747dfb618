use core::fmt::Write;

use crate::{Result, SipError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
        }
    }
}

impl core::fmt::Display for Method {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const SIP_2_0: Version = Version { major: 2, minor: 0 };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: &str, value: &str) -> Self {
        Header {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: Vec<Header>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: Version,
    pub status_code: u16,
    pub reason: String,
    pub headers: Vec<Header>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Request {
    pub fn new(method: Method, uri: &str) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            version: Version::SIP_2_0,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn add_header(&mut self, header: Header) {
        self.headers.push(header);
    }

    /// Attach a body with its Content-Type; Content-Length is set to match.
    /// With no prior body-related headers this is the normal way to carry
    /// SDP on an INVITE.
    pub fn set_body(&mut self, body: &str, content_type: &str) {
        self.body = body.to_string();
        self.add_header(Header::new("Content-Type", content_type));
        self.add_header(Header::new("Content-Length", &body.len().to_string()));
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(512 + self.body.len());
        let _ = write!(
            out,
            "{} {} SIP/{}.{}\r\n",
            self.method, self.uri, self.version.major, self.version.minor
        );
        render_headers_and_body(&mut out, &self.headers, &self.body);
        out
    }
}

impl Response {
    pub fn new(status_code: u16, reason: &str) -> Self {
        Self {
            version: Version::SIP_2_0,
            status_code,
            reason: reason.to_string(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn add_header(&mut self, header: Header) {
        self.headers.push(header);
    }

    pub fn set_body(&mut self, body: &str, content_type: &str) {
        self.body = body.to_string();
        self.add_header(Header::new("Content-Type", content_type));
        self.add_header(Header::new("Content-Length", &body.len().to_string()));
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(512 + self.body.len());
        let _ = write!(
            out,
            "SIP/{}.{} {} {}\r\n",
            self.version.major, self.version.minor, self.status_code, self.reason
        );
        render_headers_and_body(&mut out, &self.headers, &self.body);
        out
    }
}

fn render_headers_and_body(out: &mut String, headers: &[Header], body: &str) {
    for header in headers {
        let _ = write!(out, "{}: {}\r\n", header.name, header.value);
    }
    let _ = write!(out, "\r\n{}", body);
}

/// Basic parser: decide request vs response by first line.
pub fn parse_message(input: &str) -> Result<Message> {
    let mut lines = input.split("\r\n");
    let first = lines.next().ok_or(SipError::Invalid("empty message"))?;

    if first.starts_with("SIP/") {
        parse_response(first, &mut lines)
    } else {
        parse_request(first, &mut lines)
    }
}

fn parse_request<'a, I>(start_line: &str, lines: &mut I) -> Result<Message>
where
    I: Iterator<Item = &'a str>,
{
    let mut parts = start_line.split_whitespace();
    let method = parts.next().ok_or(SipError::Invalid("missing method"))?;
    let uri = parts.next().ok_or(SipError::Invalid("missing uri"))?;
    let _version = parts.next().ok_or(SipError::Invalid("missing version"))?;

    let mut req = Request::new(parse_method(method)?, uri);
    parse_headers_and_body(lines, &mut req.headers, &mut req.body)?;
    Ok(Message::Request(req))
}

fn parse_response<'a, I>(start_line: &str, lines: &mut I) -> Result<Message>
where
    I: Iterator<Item = &'a str>,
{
    let mut parts = start_line.split_whitespace();
    let version = parts.next().ok_or(SipError::Invalid("missing version"))?;
    if !version.starts_with("SIP/2.0") {
        return Err(SipError::Invalid("unsupported version"));
    }
    let status: u16 = parts
        .next()
        .ok_or(SipError::Invalid("missing status"))?
        .parse()
        .map_err(|_| SipError::Invalid("status parse"))?;

    let reason = parts.collect::<Vec<_>>().join(" ");

    let mut resp = Response::new(status, &reason);
    parse_headers_and_body(lines, &mut resp.headers, &mut resp.body)?;
    Ok(Message::Response(resp))
}

fn parse_headers_and_body<'a, I>(
    lines: &mut I,
    headers: &mut Vec<Header>,
    body: &mut String,
) -> Result<()>
where
    I: Iterator<Item = &'a str>,
{
    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
        let mut parts = line.splitn(2, ':');
        let name = parts.next().ok_or(SipError::Invalid("header name"))?;
        let value = parts
            .next()
            .ok_or(SipError::Invalid("header value"))?
            .trim();
        headers.push(Header::new(name, value));
    }

    body.clear();
    let mut first = true;
    for line in lines {
        if !first {
            body.push_str("\r\n");
        }
        first = false;
        body.push_str(line);
    }

    Ok(())
}

fn parse_method(input: &str) -> Result<Method> {
    match input {
        "REGISTER" => Ok(Method::Register),
        "INVITE" => Ok(Method::Invite),
        "ACK" => Ok(Method::Ack),
        "BYE" => Ok(Method::Bye),
        "CANCEL" => Ok(Method::Cancel),
        "OPTIONS" => Ok(Method::Options),
        _ => Err(SipError::Invalid("unknown method")),
    }
}

pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// CSeq sequence number, e.g. `"2 INVITE"` -> `2`.
pub(crate) fn cseq_number(headers: &[Header]) -> Option<u32> {
    header_value(headers, "CSeq")?
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
}

/// CSeq method name, e.g. `"2 INVITE"` -> `"INVITE"`.
pub(crate) fn cseq_method(headers: &[Header]) -> Option<&str> {
    header_value(headers, "CSeq")?.split_whitespace().nth(1)
}
