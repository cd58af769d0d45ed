/// Chain synchronization for full and light nodes.
///
/// A sync session brings the local chain up to the head announced by one
/// peer, while spreading the actual downloads over every registered peer:
///
/// - **Downloader**: runs sessions and owns the state machine
/// - **Queue**: task backlog, reservations, in-order result release and
///   backpressure
/// - **State Sync**: breadth-first download of the state trie at the fast
///   sync pivot
///
/// ## State Machine
///
/// - **IDLE**: no session
/// - **FIND_ANCESTOR**: locating the highest block shared with the peer
/// - **FETCH_HEADERS**: headers are fetched and verified, block data
///   fetchers run alongside
/// - **FETCH_DATA**: all headers verified, block data still downloading
/// - **IMPORT**: remaining results are written to storage
/// - **CANCELLED** / **FAILED**: terminal states of the last session
pub mod config;
pub mod downloader;
pub mod error;
pub mod progress;
pub mod queue;
pub mod state_sync;
pub mod states;

pub use config::*;
pub use downloader::{Downloader, SessionStatus, SyncEvent, SyncReport};
pub use error::SyncError;
pub use progress::Progress;
pub use queue::{Queue, QueueError};
pub use state_sync::StateSync;
pub use states::{NodeMode, SyncMode, SyncState};

#[cfg(test)]
pub(crate) mod tests;
