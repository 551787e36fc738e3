//! TLS sub-layer: rustls configuration and the record engine driver.
//!
//! The engine runs over an [`InnerStream`]: ciphertext from the transport is
//! pushed into it, ciphertext produced by the engine leaves through the
//! stream's write callback, and plaintext is exchanged with the application
//! session through the driver task below.

use anyhow::{Context as AnyhowContext, Result};
use bytes::Bytes;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::AppSession;
use crate::error::SendError;
use crate::inner_stream::InnerStream;
use crate::session::SessionState;

const ALPN_PROTOCOL: &[u8] = b"mq/1";

/// Which side of the handshake a session plays, with its configuration
#[derive(Clone)]
pub enum TlsSettings {
    /// Accept handshakes
    Server(Arc<ServerConfig>),
    /// Initiate handshakes towards `server_name`
    Client {
        /// Client configuration
        config: Arc<ClientConfig>,
        /// Name verified against the server certificate
        server_name: ServerName<'static>,
    },
}

impl TlsSettings {
    /// Server side settings
    pub fn server(config: ServerConfig) -> Self {
        TlsSettings::Server(Arc::new(config))
    }

    /// Client side settings; fails when `sni` is not a valid server name
    pub fn client(config: ClientConfig, sni: &str) -> Result<Self> {
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", sni))?;
        Ok(TlsSettings::Client {
            config: Arc::new(config),
            server_name,
        })
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsSettings::Server(_) => f.write_str("TlsSettings::Server"),
            TlsSettings::Client { server_name, .. } => f
                .debug_struct("TlsSettings::Client")
                .field("server_name", server_name)
                .finish(),
        }
    }
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let cert_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_bytes()).collect();
    let certs = cert_results.context("Failed to parse certificate chain")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in certificate chain");
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let key_results: Result<Vec<_>, _> =
        rustls_pemfile::pkcs8_private_keys(&mut pem.as_bytes()).collect();
    let mut keys = key_results.context("Failed to parse private key")?;
    if keys.is_empty() {
        anyhow::bail!("No private key found");
    }
    Ok(PrivateKeyDer::from(keys.remove(0)))
}

fn parse_roots(pem: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for ca_cert in parse_certs(pem).context("Failed to parse CA certificates")? {
        roots
            .add(ca_cert)
            .context("Failed to add CA certificate to root store")?;
    }
    Ok(roots)
}

/// Create a TLS server configuration.
///
/// With `client_ca_pem` set, clients must present a certificate signed by
/// that CA (mTLS).
pub fn make_server_config(
    cert_chain_pem: &str,
    private_key_pem: &str,
    client_ca_pem: Option<&str>,
) -> Result<ServerConfig> {
    // Install default crypto provider if not already set
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = parse_certs(cert_chain_pem)?;
    let key = parse_key(private_key_pem)?;

    let builder = ServerConfig::builder();
    let mut config = match client_ca_pem {
        Some(ca_pem) => {
            let client_verifier =
                rustls::server::WebPkiClientVerifier::builder(Arc::new(parse_roots(ca_pem)?))
                    .build()
                    .context("Failed to build client certificate verifier")?;
            builder
                .with_client_cert_verifier(client_verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .context("Failed to configure server certificate")?;

    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    info!(mtls = client_ca_pem.is_some(), "TLS server configuration created");
    Ok(config)
}

/// Create a TLS client configuration trusting `ca_pem`.
///
/// `client_identity` is `(cert_chain_pem, private_key_pem)` for mTLS.
pub fn make_client_config(
    ca_pem: &str,
    client_identity: Option<(&str, &str)>,
) -> Result<ClientConfig> {
    // Install default crypto provider if not already set
    let _ = rustls::crypto::ring::default_provider().install_default();

    let builder = ClientConfig::builder().with_root_certificates(parse_roots(ca_pem)?);
    let mut config = match client_identity {
        Some((cert_chain_pem, private_key_pem)) => builder
            .with_client_auth_cert(parse_certs(cert_chain_pem)?, parse_key(private_key_pem)?)
            .context("Failed to configure client certificate")?,
        None => builder.with_no_client_auth(),
    };

    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    info!(mtls = client_identity.is_some(), "TLS client configuration created");
    Ok(config)
}

/// Run the handshake, then pump plaintext both ways until cancelled.
///
/// Marks the application session connected once the handshake completes; a
/// failed handshake closes it with `Error` and `connected` never fires.
pub(crate) async fn drive(
    app: Weak<AppSession>,
    settings: TlsSettings,
    inner: InnerStream,
    mut plain_rx: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    buffer_size: usize,
) {
    let handshake = async move {
        match settings {
            TlsSettings::Server(config) => TlsAcceptor::from(config)
                .accept(inner)
                .await
                .map(TlsStream::Server),
            TlsSettings::Client {
                config,
                server_name,
            } => TlsConnector::from(config)
                .connect(server_name, inner)
                .await
                .map(TlsStream::Client),
        }
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        result = handshake => result,
    };

    let stream = {
        let Some(session) = app.upgrade() else { return };
        match result {
            Ok(stream) => {
                if !session.core().mark_connected() {
                    return;
                }
                info!(
                    session = session.core().id(),
                    mode = %session.core().mode(),
                    "TLS handshake complete"
                );
                stream
            }
            Err(e) => {
                warn!(
                    session = session.core().id(),
                    mode = %session.core().mode(),
                    "TLS handshake failed: {}",
                    e
                );
                session.close(SessionState::Error);
                return;
            }
        }
    };

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; buffer_size.max(1)];

    let end_state = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            read = reader.read(&mut buf) => match read {
                Ok(0) => break SessionState::Closed,
                Ok(n) => {
                    let Some(session) = app.upgrade() else { return };
                    session.core().deliver_received(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    debug!("TLS read failed: {}", e);
                    break SessionState::Error;
                }
            },

            Some(data) = plain_rx.recv() => {
                let len = data.len();
                let written = async {
                    writer.write_all(&data).await?;
                    writer.flush().await
                };
                if let Err(e) = written.await {
                    if let Some(session) = app.upgrade() {
                        session.record_send_error(len, SendError::Tls(e.to_string()));
                    }
                    break SessionState::Error;
                }
                let Some(session) = app.upgrade() else { return };
                session.core().deliver_sent(len);
            }
        }
    };

    if let Some(session) = app.upgrade() {
        session.close(end_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA: &str = include_str!("../../tests/fixtures/ca.pem");
    const SERVER_CERT: &str = include_str!("../../tests/fixtures/server.pem");
    const SERVER_KEY: &str = include_str!("../../tests/fixtures/server.key");
    const CLIENT_CERT: &str = include_str!("../../tests/fixtures/client.pem");
    const CLIENT_KEY: &str = include_str!("../../tests/fixtures/client.key");

    #[test]
    fn test_server_config_from_fixtures() {
        let config = make_server_config(SERVER_CERT, SERVER_KEY, Some(CA)).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"mq/1".to_vec()]);
        assert!(make_server_config(SERVER_CERT, SERVER_KEY, None).is_ok());
    }

    #[test]
    fn test_client_config_from_fixtures() {
        assert!(make_client_config(CA, Some((CLIENT_CERT, CLIENT_KEY))).is_ok());
        assert!(make_client_config(CA, None).is_ok());
    }

    #[test]
    fn test_bad_pem_rejected() {
        assert!(make_server_config("not a cert", SERVER_KEY, None).is_err());
        assert!(make_server_config(SERVER_CERT, "not a key", None).is_err());
        assert!(make_client_config("", None).is_err());
    }

    #[test]
    fn test_invalid_server_name_rejected() {
        let config = make_client_config(CA, None).unwrap();
        assert!(TlsSettings::client(config.clone(), "localhost").is_ok());
        assert!(TlsSettings::client(config, "not a hostname!").is_err());
    }
}
