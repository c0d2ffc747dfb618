use core::fmt::Write;

use md5::Digest;

use crate::{Header, Result, SipError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Parse a `WWW-Authenticate`/`Proxy-Authenticate` Digest challenge.
/// Parameters we don't use (qop, opaque, stale) are skipped.
pub fn parse_www_authenticate(input: &str) -> Result<DigestChallenge> {
    let mut parts = input.trim().splitn(2, ' ');
    let scheme = parts.next().ok_or(SipError::Invalid("auth scheme"))?;
    if !scheme.eq_ignore_ascii_case("digest") {
        return Err(SipError::Invalid("auth scheme"));
    }
    let params = parts.next().ok_or(SipError::Invalid("auth params"))?;

    let mut realm: Option<String> = None;
    let mut nonce: Option<String> = None;
    let mut algorithm = String::from("MD5");

    for param in params.split(',') {
        let Some((key, raw_value)) = param.trim().split_once('=') else {
            continue;
        };
        let value = raw_value.trim().trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value.to_string()),
            "nonce" => nonce = Some(value.to_string()),
            "algorithm" => algorithm = value.to_string(),
            _ => {}
        }
    }

    Ok(DigestChallenge {
        realm: realm.ok_or(SipError::Invalid("realm"))?,
        nonce: nonce.ok_or(SipError::Invalid("nonce"))?,
        algorithm,
    })
}

pub fn authorization_header(
    challenge: &DigestChallenge,
    creds: &DigestCredentials<'_>,
    method: &str,
    uri: &str,
) -> Result<Header> {
    let response = compute_digest_response(challenge, creds, method, uri);
    let value = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=\"{}\"",
        creds.username, challenge.realm, challenge.nonce, uri, response, challenge.algorithm
    );
    Ok(Header::new("Authorization", &value))
}

pub fn compute_digest_response(
    challenge: &DigestChallenge,
    creds: &DigestCredentials<'_>,
    method: &str,
    uri: &str,
) -> String {
    let a1 = format!("{}:{}:{}", creds.username, challenge.realm, creds.password);
    let a2 = format!("{method}:{uri}");

    let ha1 = md5_hex(a1.as_bytes());
    let ha2 = md5_hex(a2.as_bytes());

    md5_hex(format!("{ha1}:{}:{ha2}", challenge.nonce).as_bytes())
}

fn md5_hex(data: &[u8]) -> String {
    let digest = md5::Md5::digest(data);
    let mut out = String::with_capacity(32);
    for b in &digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_auth_header_matches_reference() {
        let challenge = parse_www_authenticate(
            r#"Digest realm="testrealm@host.com", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", algorithm=MD5"#,
        )
        .unwrap();
        let creds = DigestCredentials {
            username: "Mufasa",
            password: "Circle Of Life",
        };
        let header = authorization_header(&challenge, &creds, "GET", "/dir/index.html").unwrap();
        assert!(
            header
                .value
                .contains("response=\"670fd8c2df070c60b045671b8b24ff02\""),
            "unexpected header: {}",
            header.value
        );
    }

    #[test]
    fn md5_round_trip_reference() {
        let digest = md5_hex(b"abc");
        assert_eq!(digest.as_str(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn unknown_params_are_skipped() {
        let challenge = parse_www_authenticate(
            r#"Digest realm="r", qop="auth", nonce="n", opaque="o", stale=FALSE"#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "r");
        assert_eq!(challenge.nonce, "n");
        assert_eq!(challenge.algorithm, "MD5");
    }

    #[test]
    fn basic_scheme_is_rejected() {
        assert!(parse_www_authenticate(r#"Basic realm="r""#).is_err());
    }
}
