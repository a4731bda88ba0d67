//! Host-side decision points that suspend the engine
//!
//! Three situations need an answer only the hosting application can give: a
//! challenge-response login wants a password, a transfer target already
//! exists, and a TLS certificate chain needs a trust decision. The engine
//! suspends at the corresponding `.await` until the handler resolves;
//! nothing else is sent in the meantime.

use async_trait::async_trait;

use crate::notify::FileExistsPrompt;

/// Decision for an existing transfer target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileExistsAction {
    /// Replace the existing file
    Overwrite,
    /// Continue a partial transfer where it stopped
    Resume,
    /// Leave the target untouched and finish successfully
    Skip,
    /// Transfer under a different name
    Rename(String),
}

/// Callbacks for decisions the engine cannot make on its own
///
/// Implementations typically bridge to a UI. Every method has a
/// non-interactive default so headless use only overrides what it needs.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Supply the password for a challenge-response login
    ///
    /// `challenge` is the accumulated server text since the USER command.
    /// `None` cancels the login.
    async fn interactive_login(&self, challenge: &str) -> Option<String> {
        let _ = challenge;
        None
    }

    /// Decide what to do with an already existing transfer target
    async fn file_exists(&self, prompt: FileExistsPrompt) -> FileExistsAction {
        let _ = prompt;
        FileExistsAction::Overwrite
    }

    /// Accept or reject the server certificate chain (DER-encoded, leaf
    /// first)
    ///
    /// Runs after the TLS handshake finished; rejecting closes the
    /// connection before any credential is sent.
    async fn verify_certificate(&self, chain: &[Vec<u8>]) -> bool {
        let _ = chain;
        true
    }
}

/// Handler with all defaults: overwrite, trust, no interactive login
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRequestHandler;

#[async_trait]
impl RequestHandler for DefaultRequestHandler {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_handler_decisions() {
        let handler = DefaultRequestHandler;
        assert_eq!(handler.interactive_login("Password:").await, None);
        assert!(handler.verify_certificate(&[vec![0u8; 4]]).await);

        let prompt = FileExistsPrompt {
            download: true,
            local_file: "a.txt".to_string(),
            remote_file: "a.txt".to_string(),
            local_size: Some(10),
            remote_size: Some(20),
            local_time: None,
            remote_time: None,
        };
        assert_eq!(handler.file_exists(prompt).await, FileExistsAction::Overwrite);
    }
}
