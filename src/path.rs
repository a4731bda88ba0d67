//! Typed server paths
//!
//! FTP servers disagree about what a path looks like. A [`ServerPath`]
//! carries the server flavor it belongs to and renders itself in that
//! flavor's syntax, while all structural operations (parent, segments,
//! containment) work on the flavor-independent segment list.

use std::fmt;
use std::str::FromStr;

use crate::error::FtpError;

/// Server filesystem flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ServerType {
    /// Flavor not yet known; resolved from the session's server type on
    /// first use
    #[default]
    Default,
    /// Unix-style `/a/b/c`
    Unix,
    /// DOS-style `\a\b\c`
    Dos,
    /// MVS data sets, `'A.B.C'`
    Mvs,
    /// VMS directories, `[A.B.C]`
    Vms,
    /// z/VM minidisks, treated as dot-separated like MVS
    Zvm,
    /// HP NonStop, `\node.$vol.subvol`; treated as dot-separated
    HpNonStop,
}

impl ServerType {
    fn separator(self) -> char {
        match self {
            ServerType::Default | ServerType::Unix => '/',
            ServerType::Dos => '\\',
            ServerType::Mvs | ServerType::Zvm | ServerType::HpNonStop => '.',
            ServerType::Vms => '.',
        }
    }
}

/// An absolute path on the server, tagged with the server flavor
///
/// The type must be resolved (not `Default`) before the path is formatted;
/// [`ServerPath::resolve_type`] substitutes the session's server type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerPath {
    kind: ServerType,
    segments: Vec<String>,
}

impl ServerPath {
    /// Root path of the given flavor
    pub fn root(kind: ServerType) -> Self {
        Self {
            kind,
            segments: Vec::new(),
        }
    }

    /// Parse a path in the syntax of the given flavor
    pub fn parse_with_type(raw: &str, kind: ServerType) -> Result<Self, FtpError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(FtpError::Other("empty path".to_string()));
        }
        let stripped = match kind {
            ServerType::Mvs | ServerType::Zvm => raw.trim_matches('\''),
            ServerType::Vms => raw.trim_start_matches('[').trim_end_matches(']'),
            _ => raw,
        };
        let sep = kind.separator();
        let segments: Vec<String> = stripped
            .split(sep)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        Ok(Self { kind, segments })
    }

    /// The flavor this path renders as
    pub fn server_type(&self) -> ServerType {
        self.kind
    }

    /// Substitute the session's server type if this path still carries
    /// `Default`
    pub fn resolve_type(&mut self, kind: ServerType) {
        if self.kind == ServerType::Default && kind != ServerType::Default {
            self.kind = kind;
        }
    }

    /// Number of path segments (0 for the root)
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Whether a parent directory exists
    pub fn has_parent(&self) -> bool {
        !self.segments.is_empty()
    }

    /// Parent directory, if any
    pub fn parent(&self) -> Option<ServerPath> {
        if self.segments.is_empty() {
            return None;
        }
        let mut parent = self.clone();
        parent.segments.pop();
        Some(parent)
    }

    /// Final path segment, if any
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    /// Append one segment
    pub fn add_segment(&mut self, segment: impl Into<String>) {
        let segment = segment.into();
        if !segment.is_empty() {
            self.segments.push(segment);
        }
    }

    /// This path with one segment appended
    pub fn joined(&self, segment: impl Into<String>) -> ServerPath {
        let mut child = self.clone();
        child.add_segment(segment);
        child
    }

    /// True if `self` is an ancestor of `other` (`allow_equal` admits the
    /// path itself)
    pub fn is_parent_of(&self, other: &ServerPath, allow_equal: bool) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.segments.len() > other.segments.len() {
            return false;
        }
        if self.segments.len() == other.segments.len() {
            return allow_equal && self.segments == other.segments;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| a == b)
    }

    /// True if `self` lies below `other`
    pub fn is_subdir_of(&self, other: &ServerPath, allow_equal: bool) -> bool {
        other.is_parent_of(self, allow_equal)
    }

    /// Deepest path that is an ancestor of both, if the flavors match
    pub fn common_parent(&self, other: &ServerPath) -> Option<ServerPath> {
        if self.kind != other.kind {
            return None;
        }
        let shared: Vec<String> = self
            .segments
            .iter()
            .zip(other.segments.iter())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a.clone())
            .collect();
        Some(ServerPath {
            kind: self.kind,
            segments: shared,
        })
    }

    /// Render as an absolute path in the flavor's syntax
    pub fn format(&self) -> String {
        match self.kind {
            ServerType::Default | ServerType::Unix => {
                if self.segments.is_empty() {
                    "/".to_string()
                } else {
                    format!("/{}", self.segments.join("/"))
                }
            }
            ServerType::Dos => {
                if self.segments.is_empty() {
                    "\\".to_string()
                } else {
                    format!("\\{}", self.segments.join("\\"))
                }
            }
            ServerType::Mvs | ServerType::Zvm => {
                format!("'{}'", self.segments.join("."))
            }
            ServerType::Vms => {
                format!("[{}]", self.segments.join("."))
            }
            ServerType::HpNonStop => self.segments.join("."),
        }
    }

    /// Render a file inside this directory
    ///
    /// With `omit_path` the bare name is returned, for use after a CWD into
    /// this directory.
    pub fn format_filename(&self, file: &str, omit_path: bool) -> String {
        if omit_path {
            return file.to_string();
        }
        match self.kind {
            ServerType::Default | ServerType::Unix => {
                if self.segments.is_empty() {
                    format!("/{file}")
                } else {
                    format!("/{}/{}", self.segments.join("/"), file)
                }
            }
            ServerType::Dos => {
                if self.segments.is_empty() {
                    format!("\\{file}")
                } else {
                    format!("\\{}\\{}", self.segments.join("\\"), file)
                }
            }
            ServerType::Mvs | ServerType::Zvm => {
                format!("'{}({})'", self.segments.join("."), file)
            }
            ServerType::Vms => {
                format!("[{}]{}", self.segments.join("."), file)
            }
            ServerType::HpNonStop => {
                if self.segments.is_empty() {
                    file.to_string()
                } else {
                    format!("{}.{}", self.segments.join("."), file)
                }
            }
        }
    }

    /// Render a subdirectory name for a `CWD` relative to this directory
    pub fn format_subdir(&self, subdir: &str) -> String {
        match self.kind {
            ServerType::Vms => format!("[.{subdir}]"),
            _ => subdir.to_string(),
        }
    }
}

impl fmt::Display for ServerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl FromStr for ServerPath {
    type Err = FtpError;

    /// Parse assuming Unix syntax; use [`ServerPath::parse_with_type`] for
    /// other flavors
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServerPath::parse_with_type(s, ServerType::Unix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unix(raw: &str) -> ServerPath {
        ServerPath::parse_with_type(raw, ServerType::Unix).unwrap()
    }

    #[test]
    fn test_unix_round_trip() {
        for raw in ["/", "/pub", "/pub/linux/kernel"] {
            let path = unix(raw);
            let again = ServerPath::parse_with_type(&path.format(), ServerType::Unix).unwrap();
            assert_eq!(path, again, "round trip failed for {raw}");
        }
        assert_eq!(unix("/pub/").format(), "/pub");
        assert_eq!(unix("//pub//sub").format(), "/pub/sub");
    }

    #[test]
    fn test_dos_round_trip() {
        let path = ServerPath::parse_with_type("\\data\\incoming", ServerType::Dos).unwrap();
        assert_eq!(path.format(), "\\data\\incoming");
        let again = ServerPath::parse_with_type(&path.format(), ServerType::Dos).unwrap();
        assert_eq!(path, again);
    }

    #[test]
    fn test_mvs_round_trip() {
        let path = ServerPath::parse_with_type("'USER.DATA.SETS'", ServerType::Mvs).unwrap();
        assert_eq!(path.format(), "'USER.DATA.SETS'");
        let again = ServerPath::parse_with_type(&path.format(), ServerType::Mvs).unwrap();
        assert_eq!(path, again);
    }

    #[test]
    fn test_vms_round_trip() {
        let path = ServerPath::parse_with_type("[USERS.ALICE]", ServerType::Vms).unwrap();
        assert_eq!(path.format(), "[USERS.ALICE]");
        let again = ServerPath::parse_with_type(&path.format(), ServerType::Vms).unwrap();
        assert_eq!(path, again);
    }

    #[test]
    fn test_parent_and_segments() {
        let path = unix("/pub/linux/kernel");
        assert_eq!(path.last_segment(), Some("kernel"));
        let parent = path.parent().unwrap();
        assert_eq!(parent.format(), "/pub/linux");
        assert!(unix("/").parent().is_none());
        assert!(!unix("/").has_parent());
    }

    #[test]
    fn test_add_segment() {
        let mut path = unix("/pub");
        path.add_segment("linux");
        assert_eq!(path.format(), "/pub/linux");
        path.add_segment("");
        assert_eq!(path.format(), "/pub/linux");
    }

    #[test]
    fn test_containment() {
        let root = unix("/");
        let pub_ = unix("/pub");
        let deep = unix("/pub/linux");

        assert!(root.is_parent_of(&deep, false));
        assert!(pub_.is_parent_of(&deep, false));
        assert!(!deep.is_parent_of(&pub_, false));
        assert!(!pub_.is_parent_of(&pub_, false));
        assert!(pub_.is_parent_of(&pub_, true));
        assert!(deep.is_subdir_of(&root, false));
        assert!(!unix("/pu").is_parent_of(&pub_, false));
    }

    #[test]
    fn test_common_parent() {
        let a = unix("/pub/linux/kernel");
        let b = unix("/pub/bsd");
        assert_eq!(a.common_parent(&b).unwrap().format(), "/pub");

        let c = unix("/var");
        assert_eq!(a.common_parent(&c).unwrap().format(), "/");

        let dos = ServerPath::parse_with_type("\\pub", ServerType::Dos).unwrap();
        assert!(a.common_parent(&dos).is_none());
    }

    #[test]
    fn test_format_filename() {
        let path = unix("/pub");
        assert_eq!(path.format_filename("a.txt", false), "/pub/a.txt");
        assert_eq!(path.format_filename("a.txt", true), "a.txt");
        assert_eq!(unix("/").format_filename("a.txt", false), "/a.txt");

        let vms = ServerPath::parse_with_type("[USERS]", ServerType::Vms).unwrap();
        assert_eq!(vms.format_filename("LOGIN.COM", false), "[USERS]LOGIN.COM");

        let mvs = ServerPath::parse_with_type("'A.B'", ServerType::Mvs).unwrap();
        assert_eq!(mvs.format_filename("MEMBER", false), "'A.B(MEMBER)'");
    }

    #[test]
    fn test_resolve_type() {
        let mut path = ServerPath::parse_with_type("/pub", ServerType::Default).unwrap();
        path.resolve_type(ServerType::Unix);
        assert_eq!(path.server_type(), ServerType::Unix);

        // Already resolved paths keep their type
        path.resolve_type(ServerType::Dos);
        assert_eq!(path.server_type(), ServerType::Unix);
    }

    #[test]
    fn test_format_subdir() {
        let vms = ServerPath::parse_with_type("[USERS]", ServerType::Vms).unwrap();
        assert_eq!(vms.format_subdir("ALICE"), "[.ALICE]");
        assert_eq!(unix("/pub").format_subdir("linux"), "linux");
    }
}
