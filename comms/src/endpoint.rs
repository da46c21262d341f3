//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! Logical call targets.
//!
//! `tls://host:port` addresses a listening peer directly; `poll://<id>`
//! addresses a polling peer through its subscription mailbox on this runtime.
//! Either way the endpoint pins the peer certificate thumbprint the caller
//! expects to reach.

use std::fmt;

use crate::identity::Thumbprint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointTarget {
    /// A listening peer to dial.
    Tls { host: String, port: u16 },
    /// A polling peer serviced through the named subscription queue.
    Poll { subscription_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    target: EndpointTarget,
    expected_peer: Thumbprint,
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("unsupported endpoint scheme '{0}'; expected tls:// or poll://")]
    UnsupportedScheme(String),
    #[error("endpoint '{0}' is missing an authority")]
    MissingAuthority(String),
    #[error("endpoint '{0}' has an invalid port")]
    InvalidPort(String),
    #[error("polling requires a tls:// remote endpoint, got '{0}'")]
    PollRemoteNotTls(String),
}

impl Endpoint {
    pub fn tls(host: impl Into<String>, port: u16, expected_peer: Thumbprint) -> Self {
        Self {
            target: EndpointTarget::Tls {
                host: host.into(),
                port,
            },
            expected_peer,
        }
    }

    pub fn poll(subscription_id: impl Into<String>, expected_peer: Thumbprint) -> Self {
        Self {
            target: EndpointTarget::Poll {
                subscription_id: subscription_id.into(),
            },
            expected_peer,
        }
    }

    /// Parse a `tls://host:port` or `poll://subscription-id` URI.
    pub fn parse(uri: &str, expected_peer: Thumbprint) -> Result<Self, EndpointError> {
        if let Some(authority) = uri.strip_prefix("tls://") {
            if authority.is_empty() {
                return Err(EndpointError::MissingAuthority(uri.to_string()));
            }
            let (host, port) = authority
                .rsplit_once(':')
                .ok_or_else(|| EndpointError::InvalidPort(uri.to_string()))?;
            // Bracketed IPv6 literals: tls://[::1]:9000
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() {
                return Err(EndpointError::MissingAuthority(uri.to_string()));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| EndpointError::InvalidPort(uri.to_string()))?;
            return Ok(Self::tls(host, port, expected_peer));
        }
        if let Some(subscription_id) = uri.strip_prefix("poll://") {
            if subscription_id.is_empty() {
                return Err(EndpointError::MissingAuthority(uri.to_string()));
            }
            return Ok(Self::poll(subscription_id, expected_peer));
        }
        Err(EndpointError::UnsupportedScheme(uri.to_string()))
    }

    pub fn target(&self) -> &EndpointTarget {
        &self.target
    }

    pub fn expected_peer(&self) -> Thumbprint {
        self.expected_peer
    }

    /// Key under which connections to this endpoint are pooled. Distinct
    /// expected thumbprints never share pooled connections.
    pub(crate) fn pool_key(&self) -> String {
        format!("{}#{}", self, self.expected_peer)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            EndpointTarget::Tls { host, port } => write!(f, "tls://{}:{}", host, port),
            EndpointTarget::Poll { subscription_id } => write!(f, "poll://{}", subscription_id),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tp() -> Thumbprint {
        Thumbprint::from_der(b"test peer")
    }

    #[test]
    fn parse_tls() {
        let ep = Endpoint::parse("tls://hub.fleet.example:9000", tp()).unwrap();
        match ep.target() {
            EndpointTarget::Tls { host, port } => {
                assert_eq!(host, "hub.fleet.example");
                assert_eq!(*port, 9000);
            },
            other => panic!("unexpected target {:?}", other),
        }
        assert_eq!(ep.to_string(), "tls://hub.fleet.example:9000");
    }

    #[test]
    fn parse_poll() {
        let ep = Endpoint::parse("poll://agent-7", tp()).unwrap();
        assert_eq!(
            ep.target(),
            &EndpointTarget::Poll {
                subscription_id: "agent-7".to_string()
            }
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            Endpoint::parse("http://x", tp()),
            Err(EndpointError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            Endpoint::parse("tls://", tp()),
            Err(EndpointError::MissingAuthority(_))
        ));
        assert!(matches!(
            Endpoint::parse("tls://host", tp()),
            Err(EndpointError::InvalidPort(_))
        ));
        assert!(matches!(
            Endpoint::parse("tls://host:notaport", tp()),
            Err(EndpointError::InvalidPort(_))
        ));
        assert!(matches!(
            Endpoint::parse("poll://", tp()),
            Err(EndpointError::MissingAuthority(_))
        ));
    }

    #[test]
    fn pool_key_distinguishes_thumbprints() {
        let a = Endpoint::parse("tls://h:1", Thumbprint::from_der(b"a")).unwrap();
        let b = Endpoint::parse("tls://h:1", Thumbprint::from_der(b"b")).unwrap();
        assert_ne!(a.pool_key(), b.pool_key());
    }
}
