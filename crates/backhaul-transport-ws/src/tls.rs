//! rustls material for the WSS variant.

use backhaul_transport::{TransportError, TransportResult};
use rustls::pki_types::ServerName;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

// Initialize rustls crypto provider once per process
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

/// Server-side TLS from PEM cert/key files.
pub struct TlsServer {
    acceptor: TlsAcceptor,
}

impl TlsServer {
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> TransportResult<Self> {
        ensure_crypto_provider();

        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::Configuration(format!("invalid cert/key: {e}")))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_crypto)),
        })
    }

    pub async fn accept(&self, stream: TcpStream) -> TransportResult<TlsStream<TcpStream>> {
        let accepted = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| TransportError::Protocol(format!("TLS handshake: {e}")))?;
        Ok(TlsStream::Server(accepted))
    }
}

/// Client-side TLS trusting the webpki roots, or nothing at all for
/// self-signed deployments.
pub struct TlsClient {
    connector: TlsConnector,
}

impl TlsClient {
    pub fn new(insecure: bool) -> Self {
        ensure_crypto_provider();

        let client_crypto = if insecure {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        Self {
            connector: TlsConnector::from(Arc::new(client_crypto)),
        }
    }

    pub async fn connect(
        &self,
        server_name: &str,
        stream: TcpStream,
    ) -> TransportResult<TlsStream<TcpStream>> {
        let dns_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TransportError::Configuration(format!("invalid server name: {e}")))?;
        let connected = self
            .connector
            .connect(dns_name, stream)
            .await
            .map_err(|e| TransportError::Protocol(format!("TLS handshake: {e}")))?;
        Ok(TlsStream::Client(connected))
    }
}

fn load_certs(path: &Path) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::Configuration(format!("failed to open cert file: {e}")))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Configuration(format!("failed to parse certs: {e}")))
}

fn load_private_key(path: &Path) -> TransportResult<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::Configuration(format!("failed to open key file: {e}")))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Configuration(format!("failed to parse key: {e}")))?
        .ok_or_else(|| TransportError::Configuration("no private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
