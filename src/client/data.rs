//! Data-connection plumbing: passive/active setup, TLS wrap, payload drive
//!
//! Data sockets are created before the transfer command goes out, but TLS
//! handshakes and active-mode accepts only happen once the payload phase
//! runs concurrently with the control reader; both sides would otherwise
//! wait on each other.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, warn};

use super::io::ControlStream;
use crate::error::{FtpError, Result};
use crate::listing::ListingParser;

/// Timeout for establishing the data connection (connect or accept)
const DATA_SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Inactivity timeout for payload reads and writes
const DATA_IO_TIMEOUT: Duration = Duration::from_secs(180);

const DATA_CHUNK: usize = 64 * 1024;

/// Why the data side of a transfer ended
///
/// The raw-transfer orchestrator promotes the weakest reason matching what
/// it observed; outer operations map the reason onto retry/skip/critical
/// decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEndReason {
    /// Data and control both finished cleanly
    Successful,
    /// Inactivity timeout expired
    Timeout,
    /// Transfer command was rejected after data had started
    TransferCommandFailure,
    /// Transfer command was rejected before any data flowed
    TransferCommandFailureImmediate,
    /// The local side failed (write error); never worth retrying
    TransferFailureCritical,
    /// A setup command (TYPE, PASV, PORT, REST) failed
    PreTransferCommandFailure,
    /// The large-file resume probe did not yield the expected byte
    FailedResumeTest,
    /// Any other failure
    Failure,
}

/// A raw-transfer failure: reason taxonomy plus the underlying error and
/// the final control reply, when one was seen
#[derive(Debug)]
pub(crate) struct TransferFailure {
    pub reason: TransferEndReason,
    pub error: FtpError,
    pub reply_code: Option<u16>,
    pub reply_text: Option<String>,
}

impl TransferFailure {
    pub(crate) fn new(reason: TransferEndReason, error: FtpError) -> Self {
        Self {
            reason,
            error,
            reply_code: None,
            reply_text: None,
        }
    }

    pub(crate) fn with_reply(
        reason: TransferEndReason,
        error: FtpError,
        code: u16,
        text: &str,
    ) -> Self {
        Self {
            reason,
            error,
            reply_code: Some(code),
            reply_text: Some(text.to_string()),
        }
    }
}

impl From<TransferFailure> for FtpError {
    fn from(failure: TransferFailure) -> Self {
        failure.error
    }
}

/// External IP lookup seam for active-mode transfers
///
/// The engine never talks to the resolver service itself; the host wires
/// in an implementation (usually a tiny HTTP GET) and is free to cache the
/// answer across sessions.
#[async_trait]
pub trait ExternalIpResolver: Send + Sync {
    /// Fetch the publicly visible IPv4 address from `service`
    async fn resolve(&self, service: &str) -> Result<IpAddr>;
}

/// What the payload phase does with the data stream
pub(crate) enum DataTarget<'a> {
    /// Feed every chunk into the listing parser
    Listing(&'a mut dyn ListingParser),
    /// Write every chunk to the local file
    Download(&'a mut tokio::fs::File),
    /// Send the local file's remaining content
    Upload(&'a mut tokio::fs::File),
    /// Count received bytes; the resume probe expects exactly one
    ResumeProbe,
}

/// A data connection prepared for one transfer
pub(crate) enum DataConnection {
    /// Passive: TCP already connected, TLS (if any) still pending
    Passive {
        tcp: TcpStream,
        tls: Option<(TlsConnector, ServerName<'static>)>,
    },
    /// Active: listener bound, waiting for the server to connect
    Active {
        listener: TcpListener,
        expected_peer: IpAddr,
        tls: Option<(TlsConnector, ServerName<'static>)>,
    },
}

impl DataConnection {
    /// Connect to the server's advertised passive endpoint
    pub(crate) async fn connect_passive(
        addr: SocketAddr,
        tls: Option<(TlsConnector, ServerName<'static>)>,
    ) -> Result<Self> {
        debug!(%addr, "connecting data socket");
        let tcp = timeout(DATA_SETUP_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| FtpError::Timeout)?
            .map_err(FtpError::Io)?;
        tcp.set_nodelay(true).map_err(FtpError::Io)?;
        Ok(DataConnection::Passive { tcp, tls })
    }

    /// Bind a listener for an active-mode transfer; returns the connection
    /// and the chosen local port
    pub(crate) async fn listen_active(
        local_ip: IpAddr,
        expected_peer: IpAddr,
        tls: Option<(TlsConnector, ServerName<'static>)>,
    ) -> Result<(Self, u16)> {
        let listener = TcpListener::bind(SocketAddr::new(local_ip, 0))
            .await
            .map_err(FtpError::Io)?;
        let port = listener.local_addr().map_err(FtpError::Io)?.port();
        debug!(%local_ip, port, "listening for active data connection");
        Ok((
            DataConnection::Active {
                listener,
                expected_peer,
                tls,
            },
            port,
        ))
    }

    /// Finish establishing the stream: accept (active) and handshake (TLS)
    async fn establish(self) -> Result<ControlStream> {
        match self {
            DataConnection::Passive { tcp, tls } => Self::wrap(tcp, tls).await,
            DataConnection::Active {
                listener,
                expected_peer,
                tls,
            } => {
                let tcp = timeout(DATA_SETUP_TIMEOUT, async {
                    loop {
                        let (tcp, peer) = listener.accept().await?;
                        if peer.ip() == expected_peer {
                            return Ok::<_, std::io::Error>(tcp);
                        }
                        warn!(%peer, "rejecting data connection from unexpected peer");
                    }
                })
                .await
                .map_err(|_| FtpError::Timeout)?
                .map_err(FtpError::Io)?;
                tcp.set_nodelay(true).map_err(FtpError::Io)?;
                Self::wrap(tcp, tls).await
            }
        }
    }

    async fn wrap(
        tcp: TcpStream,
        tls: Option<(TlsConnector, ServerName<'static>)>,
    ) -> Result<ControlStream> {
        match tls {
            None => Ok(ControlStream::Plain(tcp)),
            Some((connector, name)) => {
                // RFC 4217: the client is the TLS client on the data
                // connection regardless of who opened the TCP connection
                let stream = timeout(DATA_SETUP_TIMEOUT, connector.connect(name, tcp))
                    .await
                    .map_err(|_| FtpError::Timeout)?
                    .map_err(|e| FtpError::Tls(format!("Data TLS handshake failed: {}", e)))?;
                Ok(ControlStream::Tls(Box::new(stream)))
            }
        }
    }

    /// Run the payload phase and return the transferred byte count
    ///
    /// Concurrent with the control-reply reader; errors are classified into
    /// the end-reason taxonomy by the caller.
    pub(crate) async fn drive(self, target: DataTarget<'_>) -> Result<u64> {
        let mut stream = self.establish().await?;
        let mut transferred: u64 = 0;
        let mut chunk = vec![0u8; DATA_CHUNK];

        match target {
            DataTarget::Listing(parser) => loop {
                let n = timeout(DATA_IO_TIMEOUT, stream.read(&mut chunk))
                    .await
                    .map_err(|_| FtpError::Timeout)?
                    .map_err(FtpError::Io)?;
                if n == 0 {
                    break;
                }
                parser.feed(&chunk[..n]);
                transferred += n as u64;
            },
            DataTarget::Download(file) => {
                loop {
                    let n = timeout(DATA_IO_TIMEOUT, stream.read(&mut chunk))
                        .await
                        .map_err(|_| FtpError::Timeout)?
                        .map_err(FtpError::Io)?;
                    if n == 0 {
                        break;
                    }
                    file.write_all(&chunk[..n])
                        .await
                        .map_err(|e| FtpError::WriteFailed(e.to_string()))?;
                    transferred += n as u64;
                }
                file.flush()
                    .await
                    .map_err(|e| FtpError::WriteFailed(e.to_string()))?;
            }
            DataTarget::Upload(file) => {
                loop {
                    let n = file.read(&mut chunk).await.map_err(FtpError::Io)?;
                    if n == 0 {
                        break;
                    }
                    timeout(DATA_IO_TIMEOUT, stream.write_all(&chunk[..n]))
                        .await
                        .map_err(|_| FtpError::Timeout)?
                        .map_err(FtpError::Io)?;
                    transferred += n as u64;
                }
                timeout(DATA_IO_TIMEOUT, stream.shutdown())
                    .await
                    .map_err(|_| FtpError::Timeout)?
                    .map_err(FtpError::Io)?;
            }
            DataTarget::ResumeProbe => loop {
                let n = timeout(DATA_IO_TIMEOUT, stream.read(&mut chunk))
                    .await
                    .map_err(|_| FtpError::Timeout)?
                    .map_err(FtpError::Io)?;
                if n == 0 {
                    break;
                }
                transferred += n as u64;
            },
        }

        Ok(transferred)
    }
}
