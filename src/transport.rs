//! TLS transport toward the backend
//!
//! The backend is dialed on a loopback address, but its certificate belongs to
//! the public hostname. The connector therefore pins SNI to the public host,
//! requires TLS 1.3 and, unless strict verification is requested, accepts
//! whatever certificate the backend presents.

use crate::error::TransportError;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Default backend: the local HTTPS listener.
pub const DEFAULT_UPSTREAM: &str = "127.0.0.1:443";

/// How the backend certificate is checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CertVerification {
    /// Accept any certificate. The backend's certificate names the public
    /// host, not the loopback address being dialed.
    #[default]
    Skip,
    /// Validate against the bundled web PKI roots for the public host.
    WebPki,
}

/// Transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address actually dialed.
    pub upstream: SocketAddr,
    /// Name presented via SNI.
    pub server_name: String,
    pub verification: CertVerification,
}

/// Sends requests to the backend over fresh TLS connections.
#[derive(Clone)]
pub struct Transport {
    connector: TlsConnector,
    upstream: SocketAddr,
    server_name: ServerName<'static>,
}

impl Transport {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let server_name = ServerName::try_from(config.server_name.as_str())
            .map_err(|_| TransportError::InvalidServerName(config.server_name.clone()))?
            .to_owned();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config(config.verification))),
            upstream: config.upstream,
            server_name,
        })
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Forward one request and return the backend's raw response.
    pub async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>, TransportError> {
        let stream = TcpStream::connect(self.upstream)
            .await
            .map_err(|source| TransportError::Connect {
                addr: self.upstream,
                source,
            })?;

        let tls = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(TransportError::Tls)?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
            .await
            .map_err(TransportError::Handshake)?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Backend connection error: {}", e);
            }
        });

        sender.send_request(request).await.map_err(TransportError::Send)
    }
}

/// TLS 1.3 only client config for the given verification mode.
pub fn client_config(verification: CertVerification) -> ClientConfig {
    let builder = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);

    match verification {
        CertVerification::Skip => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth(),
        CertVerification::WebPki => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    }
}

/// Certificate verifier that accepts any server certificate.
#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ED25519,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use std::convert::Infallible;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    fn config(name: &str) -> TransportConfig {
        TransportConfig {
            upstream: DEFAULT_UPSTREAM.parse().unwrap(),
            server_name: name.to_string(),
            verification: CertVerification::default(),
        }
    }

    #[test]
    fn test_default_is_insecure() {
        assert_eq!(CertVerification::default(), CertVerification::Skip);
    }

    #[test]
    fn test_server_name_validation() {
        assert!(Transport::new(&config("example.org")).is_ok());
        assert!(matches!(
            Transport::new(&config("not a hostname")),
            Err(TransportError::InvalidServerName(_))
        ));
    }

    /// Self-signed TLS backend for `example.org` speaking only `versions`.
    async fn spawn_backend(versions: &[&'static rustls::SupportedProtocolVersion]) -> SocketAddr {
        let cert = rcgen::generate_simple_self_signed(vec!["example.org".to_string()]).unwrap();
        let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

        let server_config = rustls::ServerConfig::builder_with_protocol_versions(versions)
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(tls) = acceptor.accept(stream).await {
                        let service = service_fn(|_req: Request<Incoming>| async {
                            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"ok"))))
                        });
                        let _ = http1::Builder::new().serve_connection(TokioIo::new(tls), service).await;
                    }
                });
            }
        });

        addr
    }

    fn transport_to(addr: SocketAddr, verification: CertVerification) -> Transport {
        Transport::new(&TransportConfig {
            upstream: addr,
            verification,
            ..config("example.org")
        })
        .unwrap()
    }

    fn empty_request() -> Request<Full<Bytes>> {
        Request::builder().uri("/").body(Full::new(Bytes::new())).unwrap()
    }

    #[tokio::test]
    async fn test_tls13_backend_accepted_without_verification() {
        let addr = spawn_backend(&[&rustls::version::TLS13]).await;
        let response = transport_to(addr, CertVerification::Skip)
            .send(empty_request())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_tls12_backend_refused() {
        let addr = spawn_backend(&[&rustls::version::TLS12]).await;
        let result = transport_to(addr, CertVerification::Skip).send(empty_request()).await;
        assert!(matches!(result, Err(TransportError::Tls(_))));
    }

    #[tokio::test]
    async fn test_webpki_mode_rejects_self_signed_backend() {
        let addr = spawn_backend(&[&rustls::version::TLS13]).await;
        let result = transport_to(addr, CertVerification::WebPki).send(empty_request()).await;
        assert!(matches!(result, Err(TransportError::Tls(_))));
    }

    #[tokio::test]
    async fn test_unreachable_upstream() {
        // Bind and drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = Transport::new(&TransportConfig {
            upstream: addr,
            ..config("example.org")
        })
        .unwrap();
        let request = Request::builder().uri("/").body(Full::new(Bytes::new())).unwrap();

        assert!(matches!(
            transport.send(request).await,
            Err(TransportError::Connect { .. })
        ));
    }
}
