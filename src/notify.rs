//! Engine event notifications
//!
//! Sessions report user-visible progress through an unbounded channel; the
//! hosting application decides how to render it. Protocol transcripts go
//! through `tracing` instead and are not duplicated here.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::path::ServerPath;

/// Events a session emits while operating
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A directory listing changed or became available
    DirectoryListing {
        /// Directory the event refers to
        path: ServerPath,
        /// The listing was the primary goal of the running operation (as
        /// opposed to a side effect like a delete refreshing its parent)
        primary: bool,
        /// Content changed since the cached version
        modified: bool,
        /// The listing attempt failed
        failed: bool,
    },
    /// Human-readable status line ("Connected", "Starting upload of ...")
    Status(String),
    /// Human-readable error description
    Error(String),
}

/// Sending half a session uses to publish events
///
/// A session without a notifier stays silent; all sends are best-effort and
/// never block the session.
#[derive(Clone, Default)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl Notifier {
    /// A notifier that discards everything
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Create a notifier and the receiving end for the application
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Publish one event; dropped receivers are ignored
    pub fn send(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// Publish a status line
    pub fn status(&self, message: impl Into<String>) {
        self.send(EngineEvent::Status(message.into()));
    }

    /// Publish an error line
    pub fn error(&self, message: impl Into<String>) {
        self.send(EngineEvent::Error(message.into()));
    }

    /// Publish a directory-listing event
    pub fn directory_listing(&self, path: ServerPath, primary: bool, modified: bool, failed: bool) {
        self.send(EngineEvent::DirectoryListing {
            path,
            primary,
            modified,
            failed,
        });
    }
}

/// Details handed to the host when a transfer target already exists
#[derive(Debug, Clone)]
pub struct FileExistsPrompt {
    /// Transfer direction
    pub download: bool,
    /// Local file path
    pub local_file: String,
    /// Remote file name
    pub remote_file: String,
    /// Local size, if the file exists
    pub local_size: Option<u64>,
    /// Remote size, if known
    pub remote_size: Option<u64>,
    /// Local modification time, if known
    pub local_time: Option<DateTime<Utc>>,
    /// Remote modification time, if known
    pub remote_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ServerType;

    #[test]
    fn test_disabled_notifier_is_silent() {
        let notifier = Notifier::disabled();
        notifier.status("ignored");
    }

    #[test]
    fn test_channel_delivery() {
        let (notifier, mut rx) = Notifier::channel();
        notifier.status("Connected");
        notifier.directory_listing(
            ServerPath::parse_with_type("/pub", ServerType::Unix).unwrap(),
            true,
            true,
            false,
        );

        match rx.try_recv().unwrap() {
            EngineEvent::Status(s) => assert_eq!(s, "Connected"),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            EngineEvent::DirectoryListing { primary, failed, .. } => {
                assert!(primary);
                assert!(!failed);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_dropped_receiver_ignored() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        notifier.error("nobody listening");
    }
}
