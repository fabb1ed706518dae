//! Transport layer: point-to-point streaming connections.
//!
//! Wraps tokio TCP (optionally under rustls TLS) behind the small surface the
//! rest of the crate needs: dial a peer, listen for peers, and a per-
//! connection writer that serializes frame writes. Also owns the preshared-
//! key exchange that runs before any frame traffic.
//!
//! Each connection is split once: the read half is owned exclusively by its
//! read loop, the write half lives behind an async mutex so concurrent
//! senders never interleave two frames' bytes.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::error::{MeshError, Result};
use crate::frame::{self, CorrelationId, FrameKind};
use crate::peer::Peer;
use crate::settings::{MeshSettings, PRESHARED_KEY_LEN};

/// Bound on the whole pre-frame handshake (TLS + preshared key).
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

static CRYPTO_PROVIDER: LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of one connection. Cloneable; every frame write takes the
/// inner lock for exactly one frame, so writes are serialized per connection
/// and never hold the lock across unrelated awaits.
#[derive(Clone)]
pub(crate) struct ConnWriter {
    inner: Arc<tokio::sync::Mutex<BoxedWriter>>,
}

impl ConnWriter {
    fn new(writer: BoxedWriter) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(writer)),
        }
    }

    pub async fn write_frame(
        &self,
        kind: FrameKind,
        correlation_id: CorrelationId,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let mut writer = self.inner.lock().await;
        frame::write_frame(&mut *writer, kind, correlation_id, payload).await
    }

    /// Close the write direction; the remote sees a clean end of stream.
    pub async fn shutdown(&self) {
        let mut writer = self.inner.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Dial `peer` and run the pre-frame handshake. Returns the split halves
/// ready for frame traffic.
pub(crate) async fn connect(
    peer: &Peer,
    settings: &MeshSettings,
) -> Result<(BoxedReader, ConnWriter)> {
    let addr = peer.addr();
    let stream = TcpStream::connect((peer.host.as_str(), peer.port))
        .await
        .map_err(|source| MeshError::Connect {
            addr: addr.clone(),
            source,
        })?;
    stream.set_nodelay(true).ok();

    let (mut reader, mut writer): (BoxedReader, BoxedWriter) = if peer.use_tls {
        let connector = tls_connector(peer, settings)?;
        let server_name = ServerName::try_from(peer.host.clone()).map_err(|_| {
            MeshError::Configuration(format!("invalid TLS host name {}", peer.host))
        })?;
        let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, stream))
            .await
            .map_err(|_| MeshError::Connect {
                addr: addr.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "TLS handshake timed out",
                ),
            })?
            .map_err(|source| MeshError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let (r, w) = tokio::io::split(tls);
        (Box::new(r), Box::new(w))
    } else {
        let (r, w) = stream.into_split();
        (Box::new(r), Box::new(w))
    };

    if let Some(key) = &settings.preshared_key {
        tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            authenticate_initiator(&mut reader, &mut writer, key, &addr),
        )
        .await
        .map_err(|_| MeshError::Authentication { addr: addr.clone() })??;
    }

    debug!(peer = %addr, tls = peer.use_tls, "transport established");
    Ok((reader, ConnWriter::new(writer)))
}

/// Listening socket bound to the local node's endpoint.
pub(crate) struct Listener {
    inner: TcpListener,
    tls: Option<TlsAcceptor>,
    settings: Arc<MeshSettings>,
}

impl Listener {
    pub async fn bind(local: &Peer, settings: Arc<MeshSettings>) -> Result<Self> {
        let tls = if local.use_tls {
            Some(tls_acceptor(local, &settings)?)
        } else {
            None
        };
        let inner = TcpListener::bind((local.host.as_str(), local.port)).await?;
        Ok(Self {
            inner,
            tls,
            settings,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept one connection and run the responder side of the handshake.
    /// Per-connection failures are reported, not fatal for the listener.
    pub async fn accept(&self) -> Result<(BoxedReader, ConnWriter, SocketAddr)> {
        let (stream, remote) = self.inner.accept().await?;
        stream.set_nodelay(true).ok();

        let (mut reader, mut writer): (BoxedReader, BoxedWriter) = match &self.tls {
            Some(acceptor) => {
                let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                    .await
                    .map_err(|_| {
                        MeshError::protocol(format!("TLS accept from {remote} timed out"))
                    })?
                    .map_err(|e| MeshError::protocol(format!("TLS accept from {remote}: {e}")))?;
                let (r, w) = tokio::io::split(tls);
                (Box::new(r), Box::new(w))
            }
            None => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        };

        if let Some(key) = &self.settings.preshared_key {
            tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                authenticate_responder(&mut reader, &mut writer, key, remote),
            )
            .await
            .map_err(|_| MeshError::Authentication {
                addr: remote.to_string(),
            })??;
        }

        Ok((reader, ConnWriter::new(writer), remote))
    }
}

/// Initiator role of the preshared-key exchange: present the key, read the
/// one-byte verdict.
async fn authenticate_initiator(
    reader: &mut BoxedReader,
    writer: &mut BoxedWriter,
    key: &[u8],
    addr: &str,
) -> Result<()> {
    writer.write_all(key).await?;
    writer.flush().await?;

    let mut verdict = [0u8; 1];
    reader.read_exact(&mut verdict).await?;
    if verdict[0] != 1 {
        return Err(MeshError::Authentication {
            addr: addr.to_string(),
        });
    }
    Ok(())
}

/// Responder role: read the presented key, answer the verdict byte, and
/// reject mismatches.
async fn authenticate_responder(
    reader: &mut BoxedReader,
    writer: &mut BoxedWriter,
    key: &[u8],
    remote: SocketAddr,
) -> Result<()> {
    let mut presented = [0u8; PRESHARED_KEY_LEN];
    reader.read_exact(&mut presented).await?;

    if presented.as_slice() != key {
        warn!(remote = %remote, "preshared key mismatch, rejecting connection");
        let _ = writer.write_all(&[0u8]).await;
        let _ = writer.flush().await;
        return Err(MeshError::Authentication {
            addr: remote.to_string(),
        });
    }

    writer.write_all(&[1u8]).await?;
    writer.flush().await?;
    Ok(())
}

fn tls_connector(peer: &Peer, settings: &MeshSettings) -> Result<TlsConnector> {
    let builder = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| MeshError::Configuration(format!("TLS protocol setup: {e}")))?;

    let builder = if settings.accept_invalid_certificates {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
    } else {
        let mut roots = rustls::RootCertStore::empty();
        if let Some(cert_path) = &peer.certificate {
            for cert in load_certs(cert_path)? {
                roots
                    .add(cert)
                    .map_err(|e| MeshError::Configuration(format!("bad trust root: {e}")))?;
            }
        }
        builder.with_root_certificates(roots)
    };

    // Under mutual authentication the peer entry's certificate is also the
    // client certificate presented on that link.
    let config = match (&peer.certificate, &peer.private_key) {
        (Some(cert_path), Some(key_path)) if settings.mutually_authenticate => builder
            .with_client_auth_cert(load_certs(cert_path)?, load_private_key(key_path)?)
            .map_err(|e| {
                MeshError::Configuration(format!("TLS client certificate rejected: {e}"))
            })?,
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

fn tls_acceptor(local: &Peer, settings: &MeshSettings) -> Result<TlsAcceptor> {
    let cert_path = local.certificate.as_ref().ok_or_else(|| {
        MeshError::Configuration("TLS listener requires a certificate path".into())
    })?;
    let key_path = local.private_key.as_ref().ok_or_else(|| {
        MeshError::Configuration("TLS listener requires a private key path".into())
    })?;

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| MeshError::Configuration(format!("TLS protocol setup: {e}")))?;

    let builder = if settings.mutually_authenticate {
        builder.with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
    } else {
        builder.with_no_client_auth()
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| MeshError::Configuration(format!("TLS certificate rejected: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .map_err(|e| MeshError::Configuration(format!("read {}: {e}", path.display())))?;
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut data.as_slice()).collect();
    let certs =
        certs.map_err(|e| MeshError::Configuration(format!("parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(MeshError::Configuration(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .map_err(|e| MeshError::Configuration(format!("read {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|e| MeshError::Configuration(format!("parse {}: {e}", path.display())))?
        .ok_or_else(|| {
            MeshError::Configuration(format!("no private key found in {}", path.display()))
        })
}

/// Certificate verifier used when `accept_invalid_certificates` is set:
/// accepts any presented chain. Signature checks still run, so the session
/// is authenticated against whatever self-signed certificate the peer holds.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client-certificate verifier for mutual authentication paired with
/// `accept_invalid_certificates`: a certificate must be presented and its
/// handshake signatures must verify, but the chain is not validated.
#[derive(Debug)]
struct AcceptAnyClientCert;

impl rustls::server::danger::ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}
