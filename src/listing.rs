//! Directory listing data model
//!
//! The listing *parser* (which turns server-specific LIST output into
//! entries) is an external collaborator; sessions receive one through the
//! [`ListingParser`] seam. This module defines the entry model those parsers
//! produce and the engine consumes.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::path::ServerPath;

/// What a listing entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link
    Link,
}

/// How much of an entry's timestamp the server actually reported
///
/// Ordered: later variants carry strictly more information. Timezone
/// correction applies only to entries at `Time` precision or finer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimestampPrecision {
    /// No timestamp at all
    None,
    /// Date only
    Date,
    /// Date plus hours and minutes
    Time,
    /// Full date and time including seconds
    Seconds,
}

/// One entry of a directory listing
#[derive(Debug, Clone)]
pub struct ListingEntry {
    /// Entry name
    pub name: String,
    /// File, directory, or link
    pub kind: EntryKind,
    /// Size in bytes; `None` when the server did not report one
    pub size: Option<u64>,
    /// How much of `time` is meaningful
    pub precision: TimestampPrecision,
    /// Modification time, valid to `precision`
    pub time: Option<DateTime<Utc>>,
    /// Permission string as listed (e.g. `-rw-r--r--` or `0644`)
    pub permissions: String,
    /// Owner and group as listed
    pub owner_group: String,
    /// Link target, for `EntryKind::Link`
    pub target: Option<String>,
    /// Entry may be stale: a cached operation touched it since listing
    pub unsure: bool,
}

impl ListingEntry {
    /// Minimal file entry; tests and cache updates start from this
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size: None,
            precision: TimestampPrecision::None,
            time: None,
            permissions: String::new(),
            owner_group: String::new(),
            target: None,
            unsure: false,
        }
    }

    /// Minimal directory entry
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Directory,
            ..Self::file(name)
        }
    }

    /// Whether this entry names a directory (links are not counted)
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// An ordered directory listing
#[derive(Debug, Clone)]
pub struct DirectoryListing {
    /// Directory the entries belong to
    pub path: ServerPath,
    /// Entries in server order
    pub entries: Vec<ListingEntry>,
    /// When the first byte of this listing was received
    pub first_list_time: DateTime<Utc>,
    /// At least one entry is `unsure`
    pub has_unsure_entries: bool,
}

impl DirectoryListing {
    /// Empty listing for a path, stamped now
    pub fn empty(path: ServerPath) -> Self {
        Self {
            path,
            entries: Vec::new(),
            first_list_time: Utc::now(),
            has_unsure_entries: false,
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the listing has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find an entry by exact name
    pub fn find(&self, name: &str) -> Option<&ListingEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Shift every entry with at least minute precision by `offset` seconds
    ///
    /// Used once per listing after timezone calibration; entries with only
    /// date precision keep their reported time.
    pub fn apply_time_offset(&mut self, offset_seconds: i64) {
        let delta = chrono::Duration::seconds(offset_seconds);
        for entry in &mut self.entries {
            if entry.precision >= TimestampPrecision::Time {
                if let Some(time) = entry.time {
                    entry.time = Some(time + delta);
                }
            }
        }
    }
}

/// Seam for the external listing parser
///
/// The raw-transfer orchestrator feeds every data-channel chunk of a
/// LIST/MLSD transfer into `feed`; `parse` is called once the transfer
/// completed and yields the listing for the directory.
pub trait ListingParser: Send {
    /// Consume one chunk of raw listing bytes
    fn feed(&mut self, data: &[u8]);

    /// Produce the listing accumulated so far for `path`
    fn parse(&mut self, path: ServerPath) -> Result<DirectoryListing>;

    /// Drop all accumulated data, for a repeated transfer
    fn reset(&mut self);
}

/// Check whether the names of `subset` all appear in `superset`
///
/// Both listings are compared by sorted name; used to decide whether a
/// `LIST -a` result really extends the plain `LIST` result.
pub fn check_inclusion(superset: &DirectoryListing, subset: &DirectoryListing) -> bool {
    if subset.len() > superset.len() {
        return false;
    }

    let mut names1: Vec<&str> = superset.entries.iter().map(|e| e.name.as_str()).collect();
    let mut names2: Vec<&str> = subset.entries.iter().map(|e| e.name.as_str()).collect();
    names1.sort_unstable();
    names2.sort_unstable();

    let mut iter1 = names1.iter();
    for name in names2 {
        loop {
            match iter1.next() {
                None => return false,
                Some(candidate) if *candidate == name => break,
                Some(_) => continue,
            }
        }
    }
    true
}
