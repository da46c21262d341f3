//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("IO error during TLS negotiation: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer did not present a certificate")]
    PeerCertificateMissing,
    #[error("'{0}' is not a valid server name")]
    InvalidServerName(String),
}
