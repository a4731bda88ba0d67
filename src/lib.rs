#![doc = include_str!("../README.md")]

/// Shared caches and the cooperative lock table
pub mod cache;
mod capabilities;
mod client;
/// FTP command builders and reply parsers
pub mod commands;
mod config;
mod error;
/// Directory listing data model and parser seam
pub mod listing;
/// Engine event notifications
pub mod notify;
/// Typed server paths
pub mod path;
mod response;

pub use cache::{CacheLocks, DirectoryCache, FileLookup, LockKind, PathCache};
pub use capabilities::{Capability, CapabilityState, ServerCapabilities, ServerKey};
pub use client::{
    CancelToken, DefaultRequestHandler, EngineContext, ExternalIpResolver, FileExistsAction,
    FileTransferSpec, FtpClient, ListFlags, ListingParserFactory, RequestHandler,
    TransferEndReason, TypeMode,
};
pub use config::{
    CharsetEncoding, EngineOptions, ExternalIpMode, FtpProxyType, LogonType, PassiveMode,
    Protocol, ServerConfig,
};
pub use error::{FtpError, Result};
pub use listing::{
    DirectoryListing, EntryKind, ListingEntry, ListingParser, TimestampPrecision, check_inclusion,
};
pub use notify::{EngineEvent, FileExistsPrompt, Notifier};
pub use path::{ServerPath, ServerType};
pub use response::{FtpResponse, codes};
