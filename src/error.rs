//! FTP error types

use thiserror::Error;

/// FTP protocol and connection errors
#[derive(Error, Debug)]
pub enum FtpError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error during secure connection
    #[error("TLS error: {0}")]
    Tls(String),

    /// Operation timed out
    #[error("Connection timeout")]
    Timeout,

    /// Unparseable reply, or a reply arrived when none was pending
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// FTP protocol error with reply code
    #[error("FTP error {code}: {message}")]
    Protocol {
        /// FTP reply code (e.g., 425, 550)
        code: u16,
        /// Error message from server
        message: String,
    },

    /// Authentication failed (5xx on PASS)
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Server on the other end speaks SSH, not FTP
    #[error("Cannot establish FTP connection to an SFTP server")]
    WrongProtocol,

    /// Transfer command rejected before any data was exchanged
    #[error("Transfer command failed: {0}")]
    TransferCommandFailed(String),

    /// Local file could not be written during a transfer
    #[error("Writing local file failed: {0}")]
    WriteFailed(String),

    /// Server cannot resume files of this size
    #[error("Server does not support resume of files > {limit_gb} GB")]
    ResumeUnsupported {
        /// Size class the server fails at (2 or 4)
        limit_gb: u8,
    },

    /// Operation cancelled by the user
    #[error("Operation cancelled")]
    Cancelled,

    /// CWD target turned out to be a symlink to a file
    #[error("Symlink does not link to a directory")]
    LinkNotDir,

    /// Command text cannot be represented in the negotiated charset
    #[error("Failed to convert command to 8 bit charset")]
    Encoding,

    /// Login sequence executed fully yet server still wants more
    #[error("Login sequence fully executed yet not logged in: {0}")]
    LoginIncomplete(String),

    /// Bug in the engine itself
    #[error("Internal error: {0}")]
    Internal(String),

    /// Connection closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl FtpError {
    /// Whether this error implies the control connection is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            FtpError::Io(_) | FtpError::ConnectionClosed | FtpError::WrongProtocol
        )
    }

    /// Whether retrying the same operation is pointless
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            FtpError::AuthFailed(_)
                | FtpError::WrongProtocol
                | FtpError::ResumeUnsupported { .. }
                | FtpError::LoginIncomplete(_)
                | FtpError::WriteFailed(_)
        )
    }
}

/// Result type alias using FtpError
pub type Result<T> = std::result::Result<T, FtpError>;
