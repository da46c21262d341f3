//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

use std::sync::{Arc, Once};

use log::*;
use rustls::{pki_types::ServerName, ClientConfig, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::{
    error::TlsError,
    verifier::{AcceptAnyServerCert, RequireAnyClientCert},
};
use crate::identity::{NodeIdentity, Thumbprint};

const LOG_TARGET: &str = "comms::tls";

/// A secured socket in either orientation.
pub type SecureStream = tokio_rustls::TlsStream<TcpStream>;

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

fn install_crypto_provider() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS configuration for both connection orientations, built once from the
/// local identity.
#[derive(Clone)]
pub struct TlsConfig {
    identity: Arc<NodeIdentity>,
    server_config: Arc<ServerConfig>,
    client_config: Arc<ClientConfig>,
}

impl TlsConfig {
    pub fn new(identity: Arc<NodeIdentity>) -> Result<Self, TlsError> {
        install_crypto_provider();

        let cert_chain = vec![identity.certificate_der()];

        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(Arc::new(RequireAnyClientCert))
            .with_single_cert(cert_chain.clone(), identity.private_key_der())?;

        let client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_client_auth_cert(cert_chain, identity.private_key_der())?;

        Ok(Self {
            identity,
            server_config: Arc::new(server_config),
            client_config: Arc::new(client_config),
        })
    }

    pub fn local_thumbprint(&self) -> Thumbprint {
        self.identity.thumbprint()
    }

    /// Accept an inbound socket: present the local identity, require a client
    /// certificate and record its thumbprint. The caller enforces the
    /// handshake deadline and the trust decision.
    pub async fn upgrade_inbound(&self, socket: TcpStream) -> Result<(Thumbprint, SecureStream), TlsError> {
        let acceptor = TlsAcceptor::from(self.server_config.clone());
        let stream = acceptor.accept(socket).await?;
        let thumbprint = peer_thumbprint(stream.get_ref().1.peer_certificates())?;
        trace!(
            target: LOG_TARGET,
            "inbound TLS session established with peer '{}'",
            thumbprint
        );
        Ok((thumbprint, stream.into()))
    }

    /// Dial-side upgrade: present the local identity and record the server's
    /// thumbprint without validating it at the TLS layer.
    pub async fn upgrade_outbound(
        &self,
        socket: TcpStream,
        server_name: &str,
    ) -> Result<(Thumbprint, SecureStream), TlsError> {
        let connector = TlsConnector::from(self.client_config.clone());
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;
        let stream = connector.connect(name, socket).await?;
        let thumbprint = peer_thumbprint(stream.get_ref().1.peer_certificates())?;
        trace!(
            target: LOG_TARGET,
            "outbound TLS session established with peer '{}'",
            thumbprint
        );
        Ok((thumbprint, stream.into()))
    }
}

fn peer_thumbprint(
    certificates: Option<&[rustls::pki_types::CertificateDer<'_>]>,
) -> Result<Thumbprint, TlsError> {
    let cert = certificates
        .and_then(|certs| certs.first())
        .ok_or(TlsError::PeerCertificateMissing)?;
    Ok(Thumbprint::from_der(cert.as_ref()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::node_identity::build_node_identity;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    #[tokio::test]
    async fn mutual_upgrade_records_both_thumbprints() {
        let server_identity = build_node_identity();
        let client_identity = build_node_identity();
        let server_tls = TlsConfig::new(server_identity.clone()).unwrap();
        let client_tls = TlsConfig::new(client_identity.clone()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (thumbprint, mut stream) = server_tls.upgrade_inbound(socket).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            thumbprint
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        let (server_thumbprint, mut stream) =
            client_tls.upgrade_outbound(socket, "127.0.0.1").await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();

        let observed_client_thumbprint = server.await.unwrap();
        assert_eq!(server_thumbprint, server_identity.thumbprint());
        assert_eq!(observed_client_thumbprint, client_identity.thumbprint());
    }

    #[tokio::test]
    async fn server_refuses_clients_without_a_certificate() {
        let server_identity = build_node_identity();
        let server_tls = TlsConfig::new(server_identity).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            server_tls.upgrade_inbound(socket).await
        });

        // A client configured without client auth
        install_crypto_provider();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(super::super::verifier::AcceptAnyServerCert))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let socket = TcpStream::connect(addr).await.unwrap();
        let name = ServerName::try_from("127.0.0.1".to_string()).unwrap();
        // The handshake fails on one side or the other; the server must not
        // yield an authenticated stream.
        let _ = connector.connect(name, socket).await;
        assert!(server.await.unwrap().is_err());
    }
}
