//! TLS configuration and per-socket session state.
//!
//! A [`TlsContext`] is built once (from PEM files or in-memory DER) and
//! shared by every socket on the same endpoint. Each socket then owns a
//! [`TlsSession`] whose handshake the socket drives explicitly off its
//! readable/writable edges; there is no hidden IO. A client context built
//! without a CA bundle skips server certificate verification, which is the
//! mode internal service meshes run in.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};

use crate::error::ErrorCode;

/// Explicit handshake state a socket routes its readiness on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HandshakeStatus {
    Handshaking,
    Established,
}

pub(crate) struct TlsSession {
    pub conn: Connection,
    pub status: HandshakeStatus,
}

/// Shared TLS configuration for one endpoint, client or server side.
#[derive(Clone, Default)]
pub struct TlsContext {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
}

impl TlsContext {
    /// Client context trusting `roots`; `None` disables server certificate
    /// verification.
    pub fn new_client(roots: Option<RootCertStore>) -> Result<TlsContext, ErrorCode> {
        let config = match roots {
            Some(roots) => ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
            None => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerify::new()))
                .with_no_client_auth(),
        };
        Ok(TlsContext {
            client: Some(Arc::new(config)),
            server: None,
        })
    }

    /// Client context from an optional PEM CA bundle path.
    pub fn client_from_files(ca_file: Option<&str>) -> Result<TlsContext, ErrorCode> {
        let roots = match ca_file {
            None => None,
            Some(path) => {
                let mut store = RootCertStore::empty();
                for cert in read_certs(path)? {
                    store
                        .add(cert)
                        .map_err(|_| ErrorCode::TlsLoadCertificate)?;
                }
                Some(store)
            }
        };
        TlsContext::new_client(roots)
    }

    /// Server context from in-memory certificate chain and key.
    pub fn new_server(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<TlsContext, ErrorCode> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|_| ErrorCode::TlsLoadCertificate)?;
        Ok(TlsContext {
            client: None,
            server: Some(Arc::new(config)),
        })
    }

    /// Server context from PEM certificate chain and key files.
    pub fn server_from_files(cert_file: &str, key_file: &str) -> Result<TlsContext, ErrorCode> {
        let certs = read_certs(cert_file)?;
        if certs.is_empty() {
            return Err(ErrorCode::TlsLoadCertificate);
        }
        let key_reader = File::open(key_file).map_err(|_| ErrorCode::TlsLoadKey)?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_reader))
            .map_err(|_| ErrorCode::TlsLoadKey)?
            .ok_or(ErrorCode::TlsLoadKey)?;
        TlsContext::new_server(certs, key)
    }

    pub fn is_client(&self) -> bool {
        self.client.is_some()
    }

    pub fn is_server(&self) -> bool {
        self.server.is_some()
    }

    pub(crate) fn client_session(&self, server_name: &str) -> Result<TlsSession, ErrorCode> {
        let config = self.client.as_ref().ok_or(ErrorCode::TlsProtocol)?;
        let name = ServerName::try_from(server_name)
            .map_err(|_| ErrorCode::TlsProtocol)?
            .to_owned();
        let conn = ClientConnection::new(Arc::clone(config), name)
            .map_err(|_| ErrorCode::TlsProtocol)?;
        Ok(TlsSession {
            conn: Connection::Client(conn),
            status: HandshakeStatus::Handshaking,
        })
    }

    pub(crate) fn server_session(&self) -> Result<TlsSession, ErrorCode> {
        let config = self.server.as_ref().ok_or(ErrorCode::TlsProtocol)?;
        let conn = ServerConnection::new(Arc::clone(config)).map_err(|_| ErrorCode::TlsProtocol)?;
        Ok(TlsSession {
            conn: Connection::Server(conn),
            status: HandshakeStatus::Handshaking,
        })
    }
}

fn read_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ErrorCode> {
    let file = File::open(path).map_err(|_| ErrorCode::TlsLoadCertificate)?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ErrorCode::TlsLoadCertificate)
}

/// Accept-any-certificate verifier for contexts built without a CA bundle.
#[derive(Debug)]
struct NoVerify {
    schemes: Vec<rustls::SignatureScheme>,
}

impl NoVerify {
    fn new() -> Self {
        NoVerify {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}
