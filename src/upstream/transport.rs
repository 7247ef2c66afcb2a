//! Upstream transport: TCP/TLS connect and a single request/response
//! exchange over a pooled stream. The plain and TLS variants share the
//! exchange logic and differ only in the stream they wrap.

use crate::codec::{CodecError, HttpStream, RequestHead, ResponseHead};
use crate::config::Scheme;
use crate::error::ProxyError;
use crate::net::BufferPool;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// A rustls `ServerCertVerifier` that accepts any certificate. Used when a
/// group sets `tlsVerify: false` for internal traffic with self-signed
/// certs.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
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
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Plain or handshake-completed TLS stream to an upstream server.
pub enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl UpstreamIo {
    /// The raw socket, for peer-liveness probing in the pool.
    pub fn tcp_ref(&self) -> &TcpStream {
        match self {
            UpstreamIo::Plain(s) => s,
            UpstreamIo::Tls(s) => s.get_ref().0,
        }
    }
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamIo::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamIo::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamIo::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamIo::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Builds upstream connections. TLS verification is on by default and uses
/// the webpki root store; minimum protocol version is 1.2.
pub struct Connector {
    verified: TlsConnector,
    unverified: TlsConnector,
    connect_timeout: Duration,
}

impl Connector {
    pub fn new(connect_timeout: Duration) -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let versions: &[&rustls::SupportedProtocolVersion] =
            &[&rustls::version::TLS13, &rustls::version::TLS12];

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let verified = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)
            .expect("ring provider supports tls 1.2 and 1.3")
            .with_root_certificates(roots)
            .with_no_client_auth();

        let unverified = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(versions)
            .expect("ring provider supports tls 1.2 and 1.3")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();

        Self {
            verified: TlsConnector::from(Arc::new(verified)),
            unverified: TlsConnector::from(Arc::new(unverified)),
            connect_timeout,
        }
    }

    /// Open a fresh connection to `host:port`, completing the TLS handshake
    /// for https upstreams.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        scheme: Scheme,
        tls_verify: bool,
        buffers: &Arc<BufferPool>,
    ) -> Result<HttpStream<UpstreamIo>, ProxyError> {
        let connect = async {
            let tcp = TcpStream::connect((host, port))
                .await
                .map_err(|e| ProxyError::UpstreamConnect(e.to_string()))?;
            tcp.set_nodelay(true)
                .map_err(|e| ProxyError::UpstreamConnect(e.to_string()))?;

            let io = match scheme {
                Scheme::Http => UpstreamIo::Plain(tcp),
                Scheme::Https => {
                    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                        .map_err(|_| {
                            ProxyError::UpstreamConnect(format!("invalid tls name: {}", host))
                        })?;
                    let connector = if tls_verify {
                        &self.verified
                    } else {
                        &self.unverified
                    };
                    let tls = connector
                        .connect(server_name, tcp)
                        .await
                        .map_err(|e| ProxyError::UpstreamConnect(e.to_string()))?;
                    UpstreamIo::Tls(Box::new(tls))
                }
            };
            Ok(HttpStream::new(io, buffers))
        };

        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::UpstreamConnect(format!(
                "connect to {}:{} timed out",
                host, port
            ))),
        }
    }
}

/// Write one request (head plus fully-buffered body) to the upstream.
/// Failures here happened before any response bytes, so the error is
/// always retriable for idempotent methods.
pub async fn send_request(
    conn: &mut HttpStream<UpstreamIo>,
    head: &RequestHead,
    body: &[u8],
) -> Result<(), ProxyError> {
    let send = async {
        conn.write_request_head(head).await?;
        conn.write_body_frame(body, false).await?;
        conn.flush().await?;
        Ok::<_, CodecError>(())
    };
    send.await.map_err(|e| ProxyError::UpstreamExchange {
        message: e.to_string(),
        bytes_received: false,
    })
}

/// Read the response head for the request just sent. Distinguishes a
/// connection that died cold (retriable) from one that died after response
/// bytes arrived (not retriable).
pub async fn read_response(conn: &mut HttpStream<UpstreamIo>) -> Result<ResponseHead, ProxyError> {
    let before = conn.bytes_read();
    match conn.read_response_head().await {
        Ok(head) => Ok(head),
        Err(CodecError::Parse(msg)) => Err(ProxyError::MalformedResponse(msg)),
        Err(CodecError::HeadTooLarge) => {
            Err(ProxyError::MalformedResponse("response head too large".into()))
        }
        Err(e) => Err(ProxyError::UpstreamExchange {
            message: e.to_string(),
            bytes_received: conn.bytes_read() > before,
        }),
    }
}
