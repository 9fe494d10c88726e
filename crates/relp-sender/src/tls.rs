//! TLS client setup on top of rustls.

use crate::error::{SenderError, SenderResult};
use crate::transport::TransportOptions;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Client side of a TLS session, validated before any socket is opened.
pub struct TlsClient {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsClient {
    /// Build the client from the transport options.
    ///
    /// Fails on unusable PEM material or an invalid server name.
    pub fn new(options: &TransportOptions) -> SenderResult<Self> {
        let config = client_config(options)?;
        let server_name = ServerName::try_from(options.host.clone()).map_err(|e| {
            SenderError::Config(format!("Invalid TLS server name {}: {}", options.host, e))
        })?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    /// Perform the TLS handshake over an established TCP stream.
    pub async fn handshake(&self, tcp: TcpStream) -> SenderResult<TlsStream<TcpStream>> {
        let stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await?;

        debug!(server_name = ?self.server_name, "TLS handshake complete");
        Ok(stream)
    }
}

/// Build the rustls client configuration for the given options.
pub fn client_config(options: &TransportOptions) -> SenderResult<ClientConfig> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let builder = if options.insecure {
        warn!(
            host = %options.host,
            "Server certificate validation disabled; use only for experiments"
        );
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
    } else {
        builder.with_root_certificates(root_store(options.ca.as_deref())?)
    };

    match (&options.cert, &options.key) {
        (Some(cert), Some(key)) => {
            Ok(builder.with_client_auth_cert(read_certs(cert)?, read_key(key)?)?)
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(SenderError::Config(
            "Client certificate and key must be provided together".to_string(),
        )),
    }
}

fn root_store(ca: Option<&[u8]>) -> SenderResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca {
        Some(pem) => {
            for cert in read_certs(pem)? {
                roots.add(cert)?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

fn read_certs(pem: &[u8]) -> SenderResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(SenderError::Config("No certificate found in PEM data".to_string()));
    }
    Ok(certs)
}

fn read_key(pem: &[u8]) -> SenderResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])?
        .ok_or_else(|| SenderError::Config("No private key found in PEM data".to_string()))
}

/// Verifier that accepts any server certificate.
///
/// Handshake signatures are still checked so the session keys are sound,
/// but the peer's identity is not.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
