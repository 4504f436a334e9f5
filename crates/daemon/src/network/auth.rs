//! Credential check for incoming connections.
//!
//! Clients present the shared token either as a `token` query parameter or
//! as an `Authorization: Bearer` header. Comparison is constant-time. When
//! local trust is enabled, peers whose TCP source address is loopback skip
//! the check; nothing the client sends can claim that status.

use std::net::{IpAddr, SocketAddr};

use subtle::ConstantTimeEq;
use tokio_tungstenite::tungstenite::handshake::server::Request;

use super::GatewayError;

/// How a connection got past the credential check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// The peer is on this host.
    Loopback,
    /// The peer presented the shared token.
    Token,
}

/// Decides whether a connection may proceed.
#[derive(Clone)]
pub struct Authenticator {
    token: String,
    trust_localhost: bool,
}

impl Authenticator {
    pub fn new(token: impl Into<String>, trust_localhost: bool) -> Self {
        Self {
            token: token.into(),
            trust_localhost,
        }
    }

    /// Checks a connection from `peer` that presented `token`.
    pub fn check(&self, peer: SocketAddr, token: Option<&str>) -> Result<AuthMethod, GatewayError> {
        if self.trust_localhost && is_loopback(peer.ip()) {
            return Ok(AuthMethod::Loopback);
        }

        match token {
            Some(presented) if tokens_match(&self.token, presented) => Ok(AuthMethod::Token),
            _ => Err(GatewayError::AuthRejected),
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("token", &"<redacted>")
            .field("trust_localhost", &self.trust_localhost)
            .finish()
    }
}

/// Constant-time token comparison. An empty expected token matches nothing.
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Pulls the token out of the query string or the `Authorization` header.
pub fn extract_token(request: &Request) -> Option<String> {
    if let Some(query) = request.uri().query() {
        let token = url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty());
        if token.is_some() {
            return token;
        }
    }

    let header = request.headers().get("authorization")?.to_str().ok()?;
    let (scheme, value) = header.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !value.trim().is_empty() {
        Some(value.trim().to_string())
    } else {
        None
    }
}

/// Loopback check that also recognizes IPv4-mapped IPv6 addresses.
pub fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.is_loopback(),
            None => v6.is_loopback(),
        },
    }
}
