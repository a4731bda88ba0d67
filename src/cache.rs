//! Shared caches and the cooperative lock table
//!
//! All three structures here are process-wide: every session of an engine
//! holds a clone and sees the same underlying state. Interior locking is
//! scoped to single map operations so a session never blocks its event
//! task on another session's work.
//!
//! - [`DirectoryCache`] keeps recent directory listings per (server, path).
//! - [`PathCache`] remembers how the server canonicalized CWD targets so a
//!   later CWD to a known (parent, subdir) pair can be skipped entirely.
//! - [`CacheLocks`] serializes listing and mkdir work on the same remote
//!   directory across concurrent sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::capabilities::ServerKey;
use crate::listing::{DirectoryListing, EntryKind, ListingEntry};
use crate::path::ServerPath;

/// Cached listings older than this count as outdated
const LISTING_TTL: Duration = Duration::from_secs(600);

struct CachedListing {
    listing: DirectoryListing,
    stored_at: Instant,
}

/// Result of a by-name file lookup in the directory cache
#[derive(Debug, Clone)]
pub struct FileLookup {
    /// The entry, if one matched by name (possibly case-insensitively)
    pub entry: Option<ListingEntry>,
    /// The directory itself was in the cache
    pub dir_did_exist: bool,
    /// The match was exact; a case-only mismatch forces a SIZE probe
    pub matched_case: bool,
}

/// Process-wide cache of directory listings
#[derive(Clone, Default)]
pub struct DirectoryCache {
    inner: Arc<Mutex<HashMap<(ServerKey, ServerPath), CachedListing>>>,
}

impl DirectoryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a listing exists, and its (has_unsure, is_outdated) state
    pub fn does_exist(&self, server: &ServerKey, path: &ServerPath) -> Option<(bool, bool)> {
        let map = self.inner.lock().unwrap();
        map.get(&(server.clone(), path.clone())).map(|c| {
            (
                c.listing.has_unsure_entries,
                c.stored_at.elapsed() > LISTING_TTL,
            )
        })
    }

    /// Fetch a listing; `is_outdated` is returned alongside
    pub fn lookup(
        &self,
        server: &ServerKey,
        path: &ServerPath,
    ) -> Option<(DirectoryListing, bool)> {
        let map = self.inner.lock().unwrap();
        map.get(&(server.clone(), path.clone()))
            .map(|c| (c.listing.clone(), c.stored_at.elapsed() > LISTING_TTL))
    }

    /// Look up one file of a cached directory by name
    pub fn lookup_file(&self, server: &ServerKey, path: &ServerPath, name: &str) -> FileLookup {
        let map = self.inner.lock().unwrap();
        let Some(cached) = map.get(&(server.clone(), path.clone())) else {
            return FileLookup {
                entry: None,
                dir_did_exist: false,
                matched_case: false,
            };
        };

        if let Some(entry) = cached.listing.find(name) {
            return FileLookup {
                entry: Some(entry.clone()),
                dir_did_exist: true,
                matched_case: true,
            };
        }
        let folded = cached
            .listing
            .entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name));
        FileLookup {
            entry: folded.cloned(),
            dir_did_exist: true,
            matched_case: false,
        }
    }

    /// Store a listing, replacing any previous one for the same path
    pub fn store(&self, server: &ServerKey, listing: DirectoryListing) {
        let mut map = self.inner.lock().unwrap();
        map.insert(
            (server.clone(), listing.path.clone()),
            CachedListing {
                listing,
                stored_at: Instant::now(),
            },
        );
    }

    /// Insert or update one entry of a cached directory
    ///
    /// Missing directories are ignored; `unsure` marks the entry (and the
    /// listing) as needing a refresh before its metadata is trusted.
    pub fn update_file(
        &self,
        server: &ServerKey,
        path: &ServerPath,
        name: &str,
        unsure: bool,
        kind: Option<EntryKind>,
    ) {
        let mut map = self.inner.lock().unwrap();
        let Some(cached) = map.get_mut(&(server.clone(), path.clone())) else {
            return;
        };
        match cached.listing.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.unsure = unsure;
                if let Some(kind) = kind {
                    entry.kind = kind;
                }
            }
            None => {
                let mut entry = match kind {
                    Some(EntryKind::Directory) => ListingEntry::directory(name),
                    _ => ListingEntry::file(name),
                };
                entry.unsure = unsure;
                cached.listing.entries.push(entry);
            }
        }
        if unsure {
            cached.listing.has_unsure_entries = true;
        }
    }

    /// Drop one entry from a cached directory
    pub fn remove_file(&self, server: &ServerKey, path: &ServerPath, name: &str) {
        let mut map = self.inner.lock().unwrap();
        if let Some(cached) = map.get_mut(&(server.clone(), path.clone())) {
            cached.listing.entries.retain(|e| e.name != name);
        }
    }

    /// Drop a directory's own listing and its entry in the parent
    pub fn remove_dir(&self, server: &ServerKey, parent: &ServerPath, subdir: &str) {
        let mut map = self.inner.lock().unwrap();
        let full = parent.joined(subdir);
        map.remove(&(server.clone(), full));
        if let Some(cached) = map.get_mut(&(server.clone(), parent.clone())) {
            cached.listing.entries.retain(|e| e.name != subdir);
        }
    }

    /// Forget everything known about one server
    pub fn invalidate_server(&self, server: &ServerKey) {
        let mut map = self.inner.lock().unwrap();
        map.retain(|(key, _), _| key != server);
    }

    /// Mark one entry unsure without dropping it
    pub fn invalidate_file(&self, server: &ServerKey, path: &ServerPath, name: &str) {
        let mut map = self.inner.lock().unwrap();
        if let Some(cached) = map.get_mut(&(server.clone(), path.clone())) {
            if let Some(entry) = cached.listing.entries.iter_mut().find(|e| e.name == name) {
                entry.unsure = true;
                cached.listing.has_unsure_entries = true;
            }
        }
    }

    /// Carry a rename through the cache
    ///
    /// The entry moves from (from_path, from_name) to (to_path, to_name) as
    /// an unsure entry; a directory's own listing under its old path is
    /// dropped.
    pub fn rename(
        &self,
        server: &ServerKey,
        from_path: &ServerPath,
        from_name: &str,
        to_path: &ServerPath,
        to_name: &str,
    ) {
        let mut map = self.inner.lock().unwrap();

        let removed = map
            .get_mut(&(server.clone(), from_path.clone()))
            .and_then(|cached| {
                let idx = cached
                    .listing
                    .entries
                    .iter()
                    .position(|e| e.name == from_name)?;
                Some(cached.listing.entries.remove(idx))
            });

        map.remove(&(server.clone(), from_path.joined(from_name)));

        if let Some(mut entry) = removed {
            entry.name = to_name.to_string();
            entry.unsure = true;
            if let Some(cached) = map.get_mut(&(server.clone(), to_path.clone())) {
                cached.listing.entries.retain(|e| e.name != to_name);
                cached.listing.entries.push(entry);
                cached.listing.has_unsure_entries = true;
            }
        }
    }
}

/// Process-wide cache of confirmed CWD targets
///
/// Maps (server, requested path, requested subdir) to the canonical path
/// the server reported via PWD.
#[derive(Clone, Default)]
pub struct PathCache {
    inner: Arc<Mutex<HashMap<(ServerKey, ServerPath, String), ServerPath>>>,
}

impl PathCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical path for a (parent, subdir) request, if known
    pub fn lookup(
        &self,
        server: &ServerKey,
        parent: &ServerPath,
        subdir: &str,
    ) -> Option<ServerPath> {
        let map = self.inner.lock().unwrap();
        map.get(&(server.clone(), parent.clone(), subdir.to_string()))
            .cloned()
    }

    /// Record that a CWD of (request, subdir) landed in `current`
    pub fn store(
        &self,
        server: &ServerKey,
        current: ServerPath,
        request: &ServerPath,
        subdir: &str,
    ) {
        let mut map = self.inner.lock().unwrap();
        map.insert(
            (server.clone(), request.clone(), subdir.to_string()),
            current,
        );
    }

    /// Drop a cached resolution
    pub fn invalidate_path(&self, server: &ServerKey, parent: &ServerPath, subdir: &str) {
        let mut map = self.inner.lock().unwrap();
        map.remove(&(server.clone(), parent.clone(), subdir.to_string()));
    }
}

/// What a cache lock protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// A directory listing in progress
    List,
    /// A directory creation in progress
    Mkdir,
}

/// Cooperative lock table over (server, path, kind)
///
/// Locks serialize conflicting cache work between sessions. `try_lock`
/// never blocks; `lock` waits for a release wakeup and retries.
#[derive(Clone, Default)]
pub struct CacheLocks {
    held: Arc<Mutex<HashMap<(ServerKey, ServerPath, LockKind), ()>>>,
    released: Arc<Notify>,
}

impl CacheLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire without waiting; `None` when another session holds the lock
    pub fn try_lock(
        &self,
        server: &ServerKey,
        path: &ServerPath,
        kind: LockKind,
    ) -> Option<CacheLockGuard> {
        let key = (server.clone(), path.clone(), kind);
        let mut held = self.held.lock().unwrap();
        if held.contains_key(&key) {
            return None;
        }
        held.insert(key.clone(), ());
        Some(CacheLockGuard {
            locks: self.clone(),
            key,
        })
    }

    /// Whether some session holds this lock right now
    pub fn is_locked(&self, server: &ServerKey, path: &ServerPath, kind: LockKind) -> bool {
        let held = self.held.lock().unwrap();
        held.contains_key(&(server.clone(), path.clone(), kind))
    }

    /// Acquire, waiting for the holder to release
    pub async fn lock(
        &self,
        server: &ServerKey,
        path: &ServerPath,
        kind: LockKind,
    ) -> CacheLockGuard {
        loop {
            let released = self.released.notified();
            if let Some(guard) = self.try_lock(server, path, kind) {
                return guard;
            }
            released.await;
        }
    }
}

/// Held cache lock; releases and wakes waiters on drop
pub struct CacheLockGuard {
    locks: CacheLocks,
    key: (ServerKey, ServerPath, LockKind),
}

impl Drop for CacheLockGuard {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap();
        held.remove(&self.key);
        drop(held);
        self.locks.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ServerType;

    fn server() -> ServerKey {
        ServerKey::new("ftp.example.com", 21)
    }

    fn path(raw: &str) -> ServerPath {
        ServerPath::parse_with_type(raw, ServerType::Unix).unwrap()
    }

    fn listing(dir: &str, names: &[&str]) -> DirectoryListing {
        let mut listing = DirectoryListing::empty(path(dir));
        listing.entries = names.iter().map(|n| ListingEntry::file(*n)).collect();
        listing
    }

    #[test]
    fn test_store_and_lookup() {
        let cache = DirectoryCache::new();
        cache.store(&server(), listing("/pub", &["a", "b"]));

        let (found, outdated) = cache.lookup(&server(), &path("/pub")).unwrap();
        assert_eq!(found.len(), 2);
        assert!(!outdated);
        assert!(cache.lookup(&server(), &path("/other")).is_none());
    }

    #[test]
    fn test_does_exist() {
        let cache = DirectoryCache::new();
        assert!(cache.does_exist(&server(), &path("/pub")).is_none());

        cache.store(&server(), listing("/pub", &["a"]));
        assert_eq!(cache.does_exist(&server(), &path("/pub")), Some((false, false)));

        cache.invalidate_file(&server(), &path("/pub"), "a");
        assert_eq!(cache.does_exist(&server(), &path("/pub")), Some((true, false)));
    }

    #[test]
    fn test_lookup_file_case() {
        let cache = DirectoryCache::new();
        cache.store(&server(), listing("/pub", &["README", "data.bin"]));

        let hit = cache.lookup_file(&server(), &path("/pub"), "README");
        assert!(hit.dir_did_exist);
        assert!(hit.matched_case);
        assert!(hit.entry.is_some());

        let folded = cache.lookup_file(&server(), &path("/pub"), "readme");
        assert!(folded.dir_did_exist);
        assert!(!folded.matched_case);
        assert!(folded.entry.is_some());

        let miss = cache.lookup_file(&server(), &path("/pub"), "nope");
        assert!(miss.dir_did_exist);
        assert!(miss.entry.is_none());

        let nodir = cache.lookup_file(&server(), &path("/none"), "x");
        assert!(!nodir.dir_did_exist);
    }

    #[test]
    fn test_update_and_remove_file() {
        let cache = DirectoryCache::new();
        cache.store(&server(), listing("/pub", &["a"]));

        cache.update_file(
            &server(),
            &path("/pub"),
            "new",
            true,
            Some(EntryKind::Directory),
        );
        let (l, _) = cache.lookup(&server(), &path("/pub")).unwrap();
        assert!(l.find("new").unwrap().is_dir());
        assert!(l.has_unsure_entries);

        cache.remove_file(&server(), &path("/pub"), "a");
        let (l, _) = cache.lookup(&server(), &path("/pub")).unwrap();
        assert!(l.find("a").is_none());
    }

    #[test]
    fn test_remove_dir() {
        let cache = DirectoryCache::new();
        cache.store(&server(), listing("/pub", &["sub"]));
        cache.store(&server(), listing("/pub/sub", &["x"]));

        cache.remove_dir(&server(), &path("/pub"), "sub");
        assert!(cache.lookup(&server(), &path("/pub/sub")).is_none());
        let (l, _) = cache.lookup(&server(), &path("/pub")).unwrap();
        assert!(l.find("sub").is_none());
    }

    #[test]
    fn test_invalidate_server() {
        let cache = DirectoryCache::new();
        let other = ServerKey::new("other.example.com", 21);
        cache.store(&server(), listing("/pub", &["a"]));
        cache.store(&other, listing("/pub", &["b"]));

        cache.invalidate_server(&server());
        assert!(cache.lookup(&server(), &path("/pub")).is_none());
        assert!(cache.lookup(&other, &path("/pub")).is_some());
    }

    #[test]
    fn test_rename_within_dir() {
        let cache = DirectoryCache::new();
        cache.store(&server(), listing("/pub", &["old", "other"]));

        cache.rename(&server(), &path("/pub"), "old", &path("/pub"), "new");
        let (l, _) = cache.lookup(&server(), &path("/pub")).unwrap();
        assert!(l.find("old").is_none());
        let entry = l.find("new").unwrap();
        assert!(entry.unsure);
    }

    #[test]
    fn test_path_cache() {
        let cache = PathCache::new();
        assert!(cache.lookup(&server(), &path("/pub"), "sub").is_none());

        cache.store(&server(), path("/pub/sub"), &path("/pub"), "sub");
        assert_eq!(
            cache.lookup(&server(), &path("/pub"), "sub"),
            Some(path("/pub/sub"))
        );

        cache.invalidate_path(&server(), &path("/pub"), "sub");
        assert!(cache.lookup(&server(), &path("/pub"), "sub").is_none());
    }

    #[test]
    fn test_try_lock_conflict() {
        let locks = CacheLocks::new();
        let guard = locks.try_lock(&server(), &path("/pub"), LockKind::List);
        assert!(guard.is_some());
        assert!(locks.try_lock(&server(), &path("/pub"), LockKind::List).is_none());
        // A different kind on the same path does not conflict
        assert!(locks.try_lock(&server(), &path("/pub"), LockKind::Mkdir).is_some());

        drop(guard);
        assert!(locks.try_lock(&server(), &path("/pub"), LockKind::List).is_some());
    }

    #[tokio::test]
    async fn test_lock_waits_for_release() {
        let locks = CacheLocks::new();
        let guard = locks.try_lock(&server(), &path("/pub"), LockKind::Mkdir).unwrap();

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            locks2.lock(&server(), &path("/pub"), LockKind::Mkdir).await
        });

        tokio::task::yield_now().await;
        drop(guard);

        let guard2 = waiter.await.unwrap();
        assert!(locks.is_locked(&server(), &path("/pub"), LockKind::Mkdir));
        drop(guard2);
        assert!(!locks.is_locked(&server(), &path("/pub"), LockKind::Mkdir));
    }
}
