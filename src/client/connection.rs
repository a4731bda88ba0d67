//! Connection establishment: TCP, socket tuning, TLS setup and upgrades

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use super::io::{ControlStream, ReplyFramer};
use super::state::{CancelToken, SessionState};
use super::{EngineContext, FtpClient};
use crate::capabilities::ServerKey;
use crate::config::{CharsetEncoding, FtpProxyType, Protocol, ServerConfig};
use crate::error::{FtpError, Result};

/// TCP connection timeout in seconds
const TCP_CONNECT_TIMEOUT_SECS: u64 = 120;

/// TLS handshake timeout in seconds
const TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 60;

/// Certificate verifier that records the presented chain for the host's
/// trust decision and otherwise delegates to the configured policy
///
/// With `accept_any` the inner validation is skipped entirely; the
/// connection is then only as trustworthy as the host's
/// [`RequestHandler::verify_certificate`](super::RequestHandler::verify_certificate)
/// answer.
#[derive(Debug)]
struct CapturingCertVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ServerCertVerifier for CapturingCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        let mut seen = self.seen.lock().unwrap();
        seen.clear();
        seen.push(end_entity.as_ref().to_vec());
        seen.extend(intermediates.iter().map(|c| c.as_ref().to_vec()));
        drop(seen);

        match &self.inner {
            Some(inner) => {
                inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            }
            None => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        match &self.inner {
            Some(inner) => inner.verify_tls12_signature(message, cert, dss),
            None => Ok(HandshakeSignatureValid::assertion()),
        }
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        match &self.inner {
            Some(inner) => inner.verify_tls13_signature(message, cert, dss),
            None => Ok(HandshakeSignatureValid::assertion()),
        }
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        match &self.inner {
            Some(inner) => inner.supported_verify_schemes(),
            None => vec![
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
            ],
        }
    }
}

fn build_tls_config(
    allow_insecure: bool,
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
) -> Result<Arc<ClientConfig>> {
    use tokio_rustls::rustls::crypto::{CryptoProvider, ring};
    let _ = CryptoProvider::install_default(ring::default_provider());

    let inner = if allow_insecure {
        warn!("TLS certificate validation disabled - connection vulnerable to MITM attacks");
        None
    } else {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let verifier = WebPkiServerVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| FtpError::Tls(format!("Failed to build verifier: {}", e)))?;
        Some(verifier)
    };

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(CapturingCertVerifier { inner, seen }))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

impl FtpClient {
    /// Connect to the FTP server with shared default services
    ///
    /// Establishes the TCP connection (and the TLS wrap for implicit FTPS)
    /// but does not touch the protocol - call [`login`](Self::login) next.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - [`FtpError::Io`] - TCP connection fails (DNS, network unreachable)
    /// - [`FtpError::Tls`] - TLS setup or handshake fails, or the host
    ///   rejects the certificate
    /// - [`FtpError::Timeout`] - connection or handshake times out
    pub async fn connect(config: Arc<ServerConfig>) -> Result<Self> {
        Self::connect_with(config, EngineContext::default()).await
    }

    /// Connect with explicitly provided shared services
    pub async fn connect_with(config: Arc<ServerConfig>, ctx: EngineContext) -> Result<Self> {
        // An FTP proxy replaces the connect target; a generic proxy or the
        // per-server bypass disables it.
        let (host, port) = if ctx.options.ftp_proxy_type != FtpProxyType::None
            && !ctx.options.generic_proxy
            && !config.bypass_proxy
        {
            let Some((host, port)) = ctx.options.proxy_host_port() else {
                return Err(FtpError::Other(
                    "Proxy set but proxy host or port invalid".to_string(),
                ));
            };
            ctx.notifier.status(format!("Using proxy {}", host));
            (host, port)
        } else {
            (config.host.clone(), config.port)
        };

        debug!("Connecting to FTP server {}:{}", host, port);

        let addr = format!("{}:{}", host, port);
        use std::net::ToSocketAddrs;
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| {
                FtpError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Failed to resolve address: {}", e),
                ))
            })?
            .next()
            .ok_or_else(|| {
                FtpError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "No address resolved",
                ))
            })?;

        use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
        let domain = if socket_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket =
            Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP)).map_err(FtpError::Io)?;

        // TCP_NODELAY for the request/response pattern, SO_KEEPALIVE because
        // broken routers and firewalls terminate idle control connections
        // during long transfers.
        socket.set_nodelay(true).map_err(FtpError::Io)?;
        if let Err(e) = socket.set_keepalive(true) {
            warn!("Failed to enable SO_KEEPALIVE: {}", e);
        }

        // socket2's connect() is blocking; run it off the async threads and
        // only switch to non-blocking mode afterwards.
        let connect_addr = socket_addr;
        let tcp_stream = timeout(
            Duration::from_secs(TCP_CONNECT_TIMEOUT_SECS),
            tokio::task::spawn_blocking(move || -> std::io::Result<std::net::TcpStream> {
                socket.connect(&connect_addr.into())?;
                socket.set_nonblocking(true)?;
                Ok(socket.into())
            }),
        )
        .await
        .map_err(|_| FtpError::Timeout)?
        .map_err(|e| FtpError::Io(std::io::Error::other(format!("Task join error: {}", e))))?
        .map_err(FtpError::Io)?;

        let tcp_stream = TcpStream::from_std(tcp_stream).map_err(FtpError::Io)?;
        let peer_addr = tcp_stream.peer_addr().map_err(FtpError::Io)?;
        let local_addr = tcp_stream.local_addr().map_err(FtpError::Io)?;

        let seen_certificates = Arc::new(Mutex::new(Vec::new()));
        let tls_config = build_tls_config(config.allow_insecure_tls, seen_certificates.clone())?;

        let server_key = ServerKey::new(config.host.clone(), config.port);
        let mut state = SessionState::new();
        state.use_utf8 = config.encoding != CharsetEncoding::Local;

        let mut client = Self {
            stream: ControlStream::Plain(tcp_stream),
            framer: ReplyFramer::default(),
            state,
            server_type: config.server_type,
            config,
            ctx,
            server_key,
            cancel: CancelToken::new(),
            tls_config,
            seen_certificates,
            peer_addr,
            local_addr,
            logged_in: false,
        };

        if client.config.protocol == Protocol::Ftps {
            client.ctx.notifier.status("Connection established, initializing TLS...");
            client.upgrade_to_tls().await?;
        }

        Ok(client)
    }

    /// Wrap the control connection in TLS and apply the host's trust
    /// decision
    ///
    /// Used directly after connecting for implicit FTPS and after a
    /// positive AUTH TLS reply for explicit FTPES.
    pub(crate) async fn upgrade_to_tls(&mut self) -> Result<()> {
        let plain = std::mem::replace(&mut self.stream, ControlStream::Closed);
        let ControlStream::Plain(tcp) = plain else {
            return Err(FtpError::Internal("TLS requested twice".to_string()));
        };

        let connector = TlsConnector::from(self.tls_config.clone());
        let server_name = ServerName::try_from(self.config.host.as_str())
            .map_err(|e| FtpError::Tls(format!("Invalid domain: {}", e)))?
            .to_owned();

        let tls_stream = timeout(
            Duration::from_secs(TLS_HANDSHAKE_TIMEOUT_SECS),
            connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| FtpError::Timeout)?
        .map_err(|e| FtpError::Tls(format!("TLS handshake failed: {}", e)))?;

        // The handshake succeeded; the trust decision is the host's.
        let chain = self.seen_certificates.lock().unwrap().clone();
        if !self.ctx.request_handler.verify_certificate(&chain).await {
            return Err(FtpError::Tls("Certificate rejected".to_string()));
        }

        self.stream = ControlStream::Tls(Box::new(tls_stream));
        self.state.tls_active = true;
        debug!("TLS established on control connection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Connection timeouts leave room for slow networks
    #[test]
    fn test_timeout_constants() {
        assert_eq!(TCP_CONNECT_TIMEOUT_SECS, 120);
        assert_eq!(TLS_HANDSHAKE_TIMEOUT_SECS, 60);
    }

    #[test]
    fn test_insecure_config_builds_without_roots() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let config = build_tls_config(true, seen).unwrap();
        // A config with a custom verifier and no client auth resolved
        assert!(Arc::strong_count(&config) >= 1);
    }

    #[test]
    fn test_secure_config_builds_with_webpki_roots() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        assert!(build_tls_config(false, seen).is_ok());
    }

    #[test]
    fn test_capturing_verifier_records_chain() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let verifier = CapturingCertVerifier {
            inner: None,
            seen: seen.clone(),
        };
        let leaf = CertificateDer::from(vec![1u8, 2, 3]);
        let intermediate = CertificateDer::from(vec![4u8, 5]);
        let name = ServerName::try_from("test.example.com").unwrap();

        let result = verifier.verify_server_cert(
            &leaf,
            std::slice::from_ref(&intermediate),
            &name,
            &[],
            UnixTime::now(),
        );
        assert!(result.is_ok(), "accept-any mode must accept the chain");

        let recorded = seen.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0], vec![1, 2, 3]);
        assert_eq!(recorded[1], vec![4, 5]);
    }

    #[test]
    fn test_accept_any_supports_common_schemes() {
        let verifier = CapturingCertVerifier {
            inner: None,
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let schemes = verifier.supported_verify_schemes();
        assert!(schemes.contains(&SignatureScheme::RSA_PKCS1_SHA256));
        assert!(schemes.contains(&SignatureScheme::ECDSA_NISTP256_SHA256));
        assert!(schemes.contains(&SignatureScheme::ED25519));
    }
}
