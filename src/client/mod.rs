//! FTP client session engine
//!
//! One [`FtpClient`] owns one control connection and drives every
//! high-level operation over it. Process-wide services (capability
//! registry, caches, lock table) are injected through [`EngineContext`]
//! so concurrent sessions of one application share them while tests get
//! fresh instances.

mod connection;
mod cwd;
mod data;
mod file_transfer;
mod io;
mod keepalive;
mod listing;
mod login;
mod requests;
mod simple_ops;
mod state;
mod transfer;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::cache::{CacheLocks, DirectoryCache, PathCache};
use crate::capabilities::{ServerCapabilities, ServerKey};
use crate::commands;
use crate::config::{EngineOptions, ServerConfig};
use crate::error::Result;
use crate::listing::ListingParser;
use crate::notify::Notifier;
use crate::path::{ServerPath, ServerType};

use io::{ControlStream, ReplyFramer};
use state::SessionState;

pub use data::{ExternalIpResolver, TransferEndReason};
pub use file_transfer::FileTransferSpec;
pub use listing::ListFlags;
pub use requests::{DefaultRequestHandler, FileExistsAction, RequestHandler};
pub use state::CancelToken;
pub use state::TypeMode;

/// Factory producing one listing parser per LIST/MLSD transfer
pub type ListingParserFactory = Arc<dyn Fn() -> Box<dyn ListingParser> + Send + Sync>;

/// Shared services and seams a session operates with
///
/// Clone one context per session; the contained services are handles onto
/// process-wide state.
#[derive(Clone)]
pub struct EngineContext {
    /// Engine-wide options
    pub options: Arc<EngineOptions>,
    /// Sticky per-server capability registry
    pub capabilities: ServerCapabilities,
    /// Shared directory-listing cache
    pub directory_cache: DirectoryCache,
    /// Shared CWD-target cache
    pub path_cache: PathCache,
    /// Cooperative list/mkdir lock table
    pub cache_locks: CacheLocks,
    /// Event sink for user-visible notifications
    pub notifier: Notifier,
    /// Decision callbacks (passwords, overwrite, certificates)
    pub request_handler: Arc<dyn RequestHandler>,
    /// External-IP lookup for active mode, if the host provides one
    pub external_ip_resolver: Option<Arc<dyn ExternalIpResolver>>,
    /// Parser for raw listing data; directory listings fail without one
    pub listing_parser_factory: Option<ListingParserFactory>,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self {
            options: Arc::new(EngineOptions::default()),
            capabilities: ServerCapabilities::new(),
            directory_cache: DirectoryCache::new(),
            path_cache: PathCache::new(),
            cache_locks: CacheLocks::new(),
            notifier: Notifier::disabled(),
            request_handler: Arc::new(DefaultRequestHandler),
            external_ip_resolver: None,
            listing_parser_factory: None,
        }
    }
}

/// Async FTP client session
///
/// # Example
///
/// ```no_run
/// use ftp_rs::{FtpClient, ServerConfig};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ServerConfig::ftpes("ftp.example.com", "user", "pass");
/// let mut client = FtpClient::connect(Arc::new(config)).await?;
/// client.login().await?;
/// client.delete_files("/pub/tmp".parse()?, vec!["stale.dat".into()]).await?;
/// client.disconnect().await;
/// # Ok(())
/// # }
/// ```
#[must_use]
pub struct FtpClient {
    /// Control connection, plain or TLS
    pub(crate) stream: ControlStream,
    /// Reply framing state
    pub(crate) framer: ReplyFramer,
    /// Session counters and flags
    pub(crate) state: SessionState,
    /// Server configuration
    pub(crate) config: Arc<ServerConfig>,
    /// Shared services
    pub(crate) ctx: EngineContext,
    /// Capability-registry key for this server
    pub(crate) server_key: ServerKey,
    /// Server flavor, refined by SYST
    pub(crate) server_type: ServerType,
    /// Cancellation handle shared with the host
    pub(crate) cancel: CancelToken,
    /// TLS client configuration, reused for the data channel
    pub(crate) tls_config: Arc<tokio_rustls::rustls::ClientConfig>,
    /// Certificate chain captured during the last handshake
    pub(crate) seen_certificates: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Control-connection addresses, for PASV sanity checks and PORT
    pub(crate) peer_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
    /// Login completed
    pub(crate) logged_in: bool,
}

impl FtpClient {
    /// Confirmed current remote directory, if known
    pub fn current_path(&self) -> Option<&ServerPath> {
        self.state.current_path.as_ref()
    }

    /// Whether the login orchestration completed
    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    /// Whether the control connection is TLS-protected
    pub fn is_tls(&self) -> bool {
        self.state.tls_active
    }

    /// Whether data connections will be TLS-protected (PROT P accepted)
    pub fn protects_data_channel(&self) -> bool {
        self.state.protect_data_channel
    }

    /// Negotiated command encoding
    pub fn uses_utf8(&self) -> bool {
        self.state.use_utf8
    }

    /// Server flavor as configured or inferred from SYST
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// Handle for cancelling the running operation from another task
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Final replies expected but not yet received
    pub fn pending_replies(&self) -> u32 {
        self.state.pending_replies
    }

    /// Final replies that will be discarded before the next operation
    pub fn replies_to_skip(&self) -> u32 {
        self.state.replies_to_skip
    }

    /// Resolve a path's flavor against this session's server type
    pub(crate) fn resolve_path_type(&self, mut path: ServerPath) -> ServerPath {
        path.resolve_type(self.server_type);
        path
    }

    /// Common entry point of every operation: acknowledge any earlier
    /// cancellation and quiesce the wire.
    pub(crate) async fn begin_op(&mut self) -> Result<()> {
        self.cancel.reset();
        self.drain_skipped_replies().await?;
        Ok(())
    }

    /// Common exit point: stamp completion time and route outstanding
    /// replies of a failed operation into the skip count.
    pub(crate) fn end_op<T>(&mut self, result: Result<T>) -> Result<T> {
        self.state.last_completion = Some(Instant::now());
        if let Err(err) = &result {
            debug!(error = %err, "operation failed");
            self.state.skip_outstanding();
            if err.is_disconnect() {
                self.stream = ControlStream::Closed;
                self.logged_in = false;
            }
        }
        result
    }

    /// Close the session, sending QUIT when the connection is still usable
    pub async fn disconnect(&mut self) {
        if !matches!(self.stream, ControlStream::Closed) {
            if self.drain_skipped_replies().await.is_ok()
                && self.send_command(commands::quit(), false).await.is_ok()
            {
                let _ = self.read_reply().await;
            }
            let _ = self.stream.shutdown().await;
        }
        self.stream = ControlStream::Closed;
        self.logged_in = false;
    }
}

impl Drop for FtpClient {
    fn drop(&mut self) {
        debug!("FtpClient dropped");
    }
}
