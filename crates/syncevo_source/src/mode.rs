//! Sync modes.

use std::fmt;
use std::str::FromStr;

/// Direction and extent of a sync for one source.
///
/// "Local" is the side running this code, "remote" the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncMode {
    /// Exchange changes in both directions.
    #[default]
    TwoWay,
    /// Compare all items on both sides.
    Slow,
    /// Replace all remote items with the local ones.
    RefreshFromLocal,
    /// Replace all local items with the remote ones.
    RefreshFromRemote,
    /// Send local changes only.
    OneWayFromLocal,
    /// Receive remote changes only.
    OneWayFromRemote,
    /// Source does not take part.
    Disabled,
}

impl SyncMode {
    /// All modes in declaration order.
    pub const ALL: [SyncMode; 7] = [
        SyncMode::TwoWay,
        SyncMode::Slow,
        SyncMode::RefreshFromLocal,
        SyncMode::RefreshFromRemote,
        SyncMode::OneWayFromLocal,
        SyncMode::OneWayFromRemote,
        SyncMode::Disabled,
    ];

    /// Returns the configuration name of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SyncMode::TwoWay => "two-way",
            SyncMode::Slow => "slow",
            SyncMode::RefreshFromLocal => "refresh-from-local",
            SyncMode::RefreshFromRemote => "refresh-from-remote",
            SyncMode::OneWayFromLocal => "one-way-from-local",
            SyncMode::OneWayFromRemote => "one-way-from-remote",
            SyncMode::Disabled => "disabled",
        }
    }

    /// Returns the mode as seen from the peer.
    ///
    /// The child of a local sync runs with the inverted modes of its parent.
    #[must_use]
    pub const fn inverted(self) -> Self {
        match self {
            SyncMode::RefreshFromLocal => SyncMode::RefreshFromRemote,
            SyncMode::RefreshFromRemote => SyncMode::RefreshFromLocal,
            SyncMode::OneWayFromLocal => SyncMode::OneWayFromRemote,
            SyncMode::OneWayFromRemote => SyncMode::OneWayFromLocal,
            other => other,
        }
    }

    /// Returns true if every local item is reported as added.
    #[must_use]
    pub const fn sends_all_items(self) -> bool {
        matches!(self, SyncMode::Slow | SyncMode::RefreshFromLocal)
    }

    /// Returns true if all local items are wiped before the sync.
    #[must_use]
    pub const fn deletes_local_items(self) -> bool {
        matches!(self, SyncMode::RefreshFromRemote)
    }

    /// Returns true if local changes are sent to the peer.
    #[must_use]
    pub const fn sends_local_changes(self) -> bool {
        !matches!(
            self,
            SyncMode::RefreshFromRemote | SyncMode::OneWayFromRemote | SyncMode::Disabled
        )
    }

    /// Returns true if the source is synchronized at all.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, SyncMode::Disabled)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unknown sync mode name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sync mode '{0}'")]
pub struct UnknownSyncMode(pub String);

impl FromStr for SyncMode {
    type Err = UnknownSyncMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mode = match s.trim().to_ascii_lowercase().as_str() {
            "two-way" | "twoway" => SyncMode::TwoWay,
            "slow" => SyncMode::Slow,
            "refresh-from-local" | "refresh-from-client" => SyncMode::RefreshFromLocal,
            "refresh-from-remote" | "refresh-from-server" => SyncMode::RefreshFromRemote,
            "one-way-from-local" | "one-way-from-client" => SyncMode::OneWayFromLocal,
            "one-way-from-remote" | "one-way-from-server" => SyncMode::OneWayFromRemote,
            "disabled" | "none" => SyncMode::Disabled,
            _ => return Err(UnknownSyncMode(s.to_string())),
        };
        Ok(mode)
    }
}
