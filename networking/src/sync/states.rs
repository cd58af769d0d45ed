use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Downloader state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No session is running.
    Idle,

    /// Locating the highest block shared with the sync peer.
    FindAncestor,

    /// Headers are being fetched and verified. Block data fetchers run
    /// alongside as soon as the first batch is verified.
    FetchHeaders,

    /// Every header is verified; bodies, receipts and state are still being
    /// fetched.
    FetchData,

    /// All data is downloaded and the remaining blocks are being imported.
    Import,

    /// The last session was cancelled. Verified blocks imported before the
    /// cancellation are kept.
    Cancelled,

    /// The last session ended with an error.
    Failed,
}

impl SyncState {
    /// Check if a transition to the target state is valid.
    pub fn can_transition_to(&self, target: SyncState) -> bool {
        use SyncState::*;

        if matches!(target, Cancelled | Failed) {
            return !matches!(self, Idle | Cancelled | Failed);
        }
        match self {
            Idle | Cancelled | Failed => matches!(target, FindAncestor),
            FindAncestor => matches!(target, FetchHeaders | Idle),
            FetchHeaders => matches!(target, FetchData | Import),
            FetchData => matches!(target, Import),
            Import => matches!(target, Idle),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, SyncState::Idle | SyncState::Cancelled | SyncState::Failed)
    }
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState::Idle
    }
}

/// How blocks are acquired during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Download and import every block.
    Full,
    /// Import receipts up to a pivot block, download the pivot state, then
    /// import the rest in full.
    Fast,
    /// Verify and store headers only.
    #[serde(rename = "light")]
    LightLegacy,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Full
    }
}

impl Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SyncMode::Full => "full",
            SyncMode::Fast => "fast",
            SyncMode::LightLegacy => "light",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown sync mode {0:?}")]
pub struct UnknownSyncMode(pub String);

impl FromStr for SyncMode {
    type Err = UnknownSyncMode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "full" => Ok(SyncMode::Full),
            "fast" => Ok(SyncMode::Fast),
            "light" => Ok(SyncMode::LightLegacy),
            other => Err(UnknownSyncMode(other.to_owned())),
        }
    }
}

/// Kind of node the downloader serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    Full,
    Light,
}

impl NodeMode {
    /// A full node never runs header-only sync and a light node runs nothing else.
    pub fn supports(&self, mode: SyncMode) -> bool {
        match self {
            NodeMode::Full => matches!(mode, SyncMode::Full | SyncMode::Fast),
            NodeMode::Light => mode == SyncMode::LightLegacy,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn session_path_is_allowed() {
        let path = [
            SyncState::Idle,
            SyncState::FindAncestor,
            SyncState::FetchHeaders,
            SyncState::FetchData,
            SyncState::Import,
            SyncState::Idle,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn cancel_and_fail_only_from_active_states() {
        assert!(SyncState::FetchData.can_transition_to(SyncState::Cancelled));
        assert!(SyncState::FindAncestor.can_transition_to(SyncState::Failed));
        assert!(!SyncState::Idle.can_transition_to(SyncState::Cancelled));
        assert!(SyncState::Cancelled.can_transition_to(SyncState::FindAncestor));
        assert!(!SyncState::Import.can_transition_to(SyncState::FetchHeaders));
    }

    #[rstest]
    #[case(NodeMode::Full, SyncMode::Full, true)]
    #[case(NodeMode::Full, SyncMode::Fast, true)]
    #[case(NodeMode::Full, SyncMode::LightLegacy, false)]
    #[case(NodeMode::Light, SyncMode::Full, false)]
    #[case(NodeMode::Light, SyncMode::Fast, false)]
    #[case(NodeMode::Light, SyncMode::LightLegacy, true)]
    fn node_mode_gates_sync_mode(#[case] node: NodeMode, #[case] mode: SyncMode, #[case] allowed: bool) {
        assert_eq!(node.supports(mode), allowed);
    }

    #[test]
    fn sync_mode_parses() {
        assert_eq!("light".parse::<SyncMode>(), Ok(SyncMode::LightLegacy));
        assert!("snap".parse::<SyncMode>().is_err());
        assert_eq!(SyncMode::Fast.to_string(), "fast");
    }
}
