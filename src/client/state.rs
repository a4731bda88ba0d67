//! Per-connection session state

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::Notify;

use crate::error::{FtpError, Result};
use crate::path::ServerPath;

/// TYPE applied to the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeMode {
    /// TYPE I
    Binary,
    /// TYPE A
    Ascii,
}

/// Mutable per-connection state
///
/// The reply counters implement the ordering rules of the wire protocol:
/// every sent command expects exactly one final (non-1xx) reply;
/// `replies_to_skip` counts final replies that belong to cancelled work or
/// keepalives and must be discarded before the next command's reply is
/// interpreted.
#[derive(Debug)]
pub(crate) struct SessionState {
    /// Confirmed current directory; `None` between a CWD and its PWD
    pub current_path: Option<ServerPath>,
    /// Commands are sent as UTF-8 (vs. Latin-1)
    pub use_utf8: bool,
    /// Control connection is TLS-wrapped
    pub tls_active: bool,
    /// PROT P accepted; data connections are TLS-wrapped
    pub protect_data_channel: bool,
    /// Last TYPE the server acknowledged
    pub last_type: Option<TypeMode>,
    /// A REST with nonzero offset is in effect and must be cleared by REST 0
    pub sent_restart_offset: bool,
    /// Final replies expected but not yet received
    pub pending_replies: u32,
    /// Final replies to discard (cancelled operation or keepalive)
    pub replies_to_skip: u32,
    /// When the last operation finished; keepalive baseline
    pub last_completion: Option<Instant>,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        Self {
            current_path: None,
            use_utf8: true,
            tls_active: false,
            protect_data_channel: false,
            last_type: None,
            sent_restart_offset: false,
            // The greeting arrives without a command having been sent
            pending_replies: 1,
            replies_to_skip: 0,
            last_completion: None,
        }
    }

    /// Account for one received final (non-1xx) reply.
    ///
    /// Returns `true` when the reply belongs to the running operation,
    /// `false` when it was consumed by the skip count.
    pub(crate) fn note_final_reply(&mut self) -> bool {
        if self.pending_replies > 0 {
            self.pending_replies -= 1;
        }
        if self.replies_to_skip > 0 {
            self.replies_to_skip -= 1;
            return false;
        }
        true
    }

    /// Route all outstanding replies into the skip count (cancellation,
    /// operation failure with commands still in flight)
    pub(crate) fn skip_outstanding(&mut self) {
        self.replies_to_skip = self.pending_replies;
    }
}

/// Cancellation handle shared between a session and its host
///
/// Cloning is cheap; `cancel` wakes any suspension point the session is
/// parked on. The flag stays set until the session acknowledges it at the
/// next operation boundary.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    /// Create an un-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the running operation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag; done when a new operation begins
    pub(crate) fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Error out if cancellation was requested
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FtpError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve when cancellation is requested
    pub(crate) async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
