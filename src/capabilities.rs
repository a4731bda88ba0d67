//! Sticky per-server capability registry
//!
//! Every fact the engine learns about a server (does it speak MLSD, is its
//! REST implementation stream-capable, what is its timezone offset) is
//! recorded here. Facts are keyed by server identity without credentials and
//! survive reconnects for the lifetime of the process: once a capability is
//! `Yes` or `No` it never changes again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A probed server feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// UTF8 listed in FEAT
    Utf8Command,
    /// CLNT listed in FEAT
    ClntCommand,
    /// MLSD/MLST listed in FEAT; payload is the MLST fact list
    MlsdCommand,
    /// MODE Z listed in FEAT
    ModeZSupport,
    /// MFMT listed in FEAT
    MfmtCommand,
    /// PRET listed in FEAT
    PretCommand,
    /// MDTM available
    MdtmCommand,
    /// SIZE available
    SizeCommand,
    /// TVFS listed in FEAT
    TvfsSupport,
    /// REST STREAM listed in FEAT
    RestStream,
    /// SYST answered; payload is the system string
    SystCommand,
    /// FEAT answered at all
    FeatCommand,
    /// Server timezone calibrated; payload is the offset in seconds
    TimezoneOffset,
    /// LIST -a returns a superset of LIST
    ListHiddenSupport,
    /// OPTS MLST needed; payload is the fact list to enable
    OptsMlstCommand,
    /// Server cannot resume files > 2 GiB
    Resume2GbBug,
    /// Server cannot resume files > 4 GiB
    Resume4GbBug,
}

/// Tristate probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapabilityState {
    /// Not probed yet
    #[default]
    Unknown,
    /// Confirmed present
    Yes,
    /// Confirmed absent or broken
    No,
}

/// Server identity used as registry key: credentials excluded so that
/// concurrent sessions to the same server share probe results.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerKey {
    /// Server hostname
    pub host: String,
    /// Server port
    pub port: u16,
}

impl ServerKey {
    /// Build a key from host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Entry {
    state: CapabilityState,
    value: Option<String>,
    number: Option<i64>,
}

/// Process-wide capability store
///
/// Cheap to clone; all clones share the same underlying map. Inject a fresh
/// instance per test to keep probe results isolated.
#[derive(Debug, Clone, Default)]
pub struct ServerCapabilities {
    inner: Arc<Mutex<HashMap<(ServerKey, Capability), Entry>>>,
}

impl ServerCapabilities {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a capability
    pub fn get(&self, server: &ServerKey, cap: Capability) -> CapabilityState {
        let map = self.inner.lock().unwrap();
        map.get(&(server.clone(), cap))
            .map(|e| e.state)
            .unwrap_or_default()
    }

    /// Current state plus the string payload, if any
    pub fn get_with_value(
        &self,
        server: &ServerKey,
        cap: Capability,
    ) -> (CapabilityState, Option<String>) {
        let map = self.inner.lock().unwrap();
        match map.get(&(server.clone(), cap)) {
            Some(e) => (e.state, e.value.clone()),
            None => (CapabilityState::Unknown, None),
        }
    }

    /// Numeric payload (timezone offset in seconds)
    pub fn get_number(&self, server: &ServerKey, cap: Capability) -> Option<i64> {
        let map = self.inner.lock().unwrap();
        map.get(&(server.clone(), cap)).and_then(|e| e.number)
    }

    /// Record a probe result
    ///
    /// Sticky: once a capability left `Unknown`, conflicting sets are
    /// ignored. Setting the same state again may still update the payload.
    pub fn set(&self, server: &ServerKey, cap: Capability, state: CapabilityState) {
        self.set_entry(server, cap, state, None, None);
    }

    /// Record a probe result with a string payload
    pub fn set_with_value(
        &self,
        server: &ServerKey,
        cap: Capability,
        state: CapabilityState,
        value: impl Into<String>,
    ) {
        self.set_entry(server, cap, state, Some(value.into()), None);
    }

    /// Record a probe result with a numeric payload
    pub fn set_number(
        &self,
        server: &ServerKey,
        cap: Capability,
        state: CapabilityState,
        number: i64,
    ) {
        self.set_entry(server, cap, state, None, Some(number));
    }

    fn set_entry(
        &self,
        server: &ServerKey,
        cap: Capability,
        state: CapabilityState,
        value: Option<String>,
        number: Option<i64>,
    ) {
        let mut map = self.inner.lock().unwrap();
        let entry = map.entry((server.clone(), cap)).or_default();
        if entry.state != CapabilityState::Unknown && entry.state != state {
            return;
        }
        entry.state = state;
        if value.is_some() {
            entry.value = value;
        }
        if number.is_some() {
            entry.number = number;
        }
    }
}
