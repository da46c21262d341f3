//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! Participant identity and trust.
//!
//! Every fleet participant is identified by an X.509 certificate. The identity
//! token is the certificate's thumbprint: the lowercase hex SHA-1 of its DER
//! encoding. Trust is decided by pinning thumbprints, never by chain
//! validation.

use std::{
    collections::HashSet,
    fmt,
    str::FromStr,
    sync::RwLock,
};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha1::{Digest, Sha1};

const THUMBPRINT_LEN: usize = 20;

/// SHA-1 digest of a certificate's DER encoding. The sole identity token on
/// the wire; compared byte-for-byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Thumbprint([u8; THUMBPRINT_LEN]);

impl Thumbprint {
    /// Compute the thumbprint of a DER-encoded certificate.
    pub fn from_der(cert_der: &[u8]) -> Self {
        let digest = Sha1::digest(cert_der);
        let mut bytes = [0u8; THUMBPRINT_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thumbprint({})", hex::encode(self.0))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ThumbprintParseError {
    #[error("thumbprint must be {expected} hex characters, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("thumbprint is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

impl FromStr for Thumbprint {
    type Err = ThumbprintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != THUMBPRINT_LEN * 2 {
            return Err(ThumbprintParseError::InvalidLength {
                expected: THUMBPRINT_LEN * 2,
                got: s.len(),
            });
        }
        let decoded = hex::decode(s)?;
        let mut bytes = [0u8; THUMBPRINT_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

/// The local identity: a DER certificate, its PKCS#8 private key and the
/// derived thumbprint. Loading the pair from disk is the caller's concern.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    thumbprint: Thumbprint,
}

impl NodeIdentity {
    pub fn new(cert_der: Vec<u8>, key_der: Vec<u8>) -> Self {
        let thumbprint = Thumbprint::from_der(&cert_der);
        Self {
            cert_der,
            key_der,
            thumbprint,
        }
    }

    pub fn thumbprint(&self) -> Thumbprint {
        self.thumbprint
    }

    pub(crate) fn certificate_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }

    pub(crate) fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

/// The set of peer thumbprints this runtime will accept. Read-mostly; lookups
/// take a read lock only.
#[derive(Debug, Default)]
pub struct TrustSet {
    inner: RwLock<HashSet<Thumbprint>>,
}

impl TrustSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn trust(&self, thumbprint: Thumbprint) {
        self.inner.write().unwrap().insert(thumbprint);
    }

    /// Remove a thumbprint. Existing connections are unaffected; trust is
    /// evaluated at handshake time.
    pub fn revoke(&self, thumbprint: &Thumbprint) -> bool {
        self.inner.write().unwrap().remove(thumbprint)
    }

    pub fn is_trusted(&self, thumbprint: &Thumbprint) -> bool {
        self.inner.read().unwrap().contains(thumbprint)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
