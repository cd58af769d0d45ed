use std::collections::HashSet;
use std::sync::Arc;

use chain::{ChainStore, MemoryChain};
use containers::{keccak256, Block, Bytes, Hash, EMPTY_ROOT};
use pretty_assertions::assert_eq;

use super::{test_state, TestState};
use crate::sync::state_sync::{StateSync, StateSyncError};

fn empty_store() -> MemoryChain {
    MemoryChain::new(Block::default())
}

/// Serve every requested hash from `state` until the download is done.
/// Returns the hashes in the order they were requested.
fn download(sync: &mut StateSync, state: &TestState, batch: usize) -> Vec<Hash> {
    let mut requested = Vec::new();
    loop {
        let hashes = sync.missing(batch);
        if hashes.is_empty() {
            break;
        }
        for hash in &hashes {
            sync.process(state.nodes[hash].clone()).unwrap();
        }
        requested.extend(hashes);
    }
    requested
}

#[test]
fn test_downloads_whole_trie() {
    let state = test_state();
    let store = empty_store();
    let mut sync = StateSync::new(state.root, Arc::new(store.clone()));
    assert!(!sync.is_done());
    assert_eq!(sync.pending(), 1);

    let requested = download(&mut sync, &state, 16);

    assert!(sync.is_done());
    assert_eq!(requested.len(), state.nodes.len());
    assert_eq!(sync.pulled(), state.nodes.len() as u64);
    assert_eq!(sync.known(), state.nodes.len() as u64);
    assert_eq!(store.state_node_count(), state.nodes.len());

    let view = store.state_at(state.root).unwrap();
    for (address, account) in &state.accounts {
        assert_eq!(view.account(address).unwrap().as_ref(), Some(account));
    }
}

#[test]
fn test_shared_subtries_requested_once() {
    let state = test_state();
    let mut sync = StateSync::new(state.root, Arc::new(empty_store()));

    let requested = download(&mut sync, &state, 4);
    let unique: HashSet<Hash> = requested.iter().copied().collect();
    assert_eq!(unique.len(), requested.len());

    let storage_root = state.accounts[9].1.storage_root;
    let code_hash = state.accounts[9].1.code_hash;
    assert_eq!(requested.iter().filter(|hash| **hash == storage_root).count(), 1);
    assert_eq!(requested.iter().filter(|hash| **hash == code_hash).count(), 1);
}

#[test]
fn test_stored_subtrie_is_skipped() {
    let state = test_state();
    let store = empty_store();
    let storage_root = state.accounts[9].1.storage_root;
    store
        .write_state_node(storage_root, state.nodes[&storage_root].clone())
        .unwrap();
    let mut sync = StateSync::new(state.root, Arc::new(store));

    let requested = download(&mut sync, &state, 16);
    assert!(sync.is_done());
    assert!(!requested.contains(&storage_root));
    assert!(requested.len() < state.nodes.len());
}

#[test]
fn test_stored_root_needs_nothing() {
    let state = test_state();
    let store = empty_store();
    store
        .write_state_node(state.root, state.nodes[&state.root].clone())
        .unwrap();

    let mut sync = StateSync::new(state.root, Arc::new(store));
    assert!(sync.is_done());
    assert!(sync.missing(16).is_empty());

    let sync = StateSync::new(EMPTY_ROOT, Arc::new(empty_store()));
    assert!(sync.is_done());
}

#[test]
fn test_parents_wait_for_children() {
    let state = test_state();
    let store = empty_store();
    let mut sync = StateSync::new(state.root, Arc::new(store.clone()));

    let root = sync.missing(1);
    assert_eq!(root, vec![state.root]);
    sync.process(state.nodes[&state.root].clone()).unwrap();

    assert!(sync.pending() > 0);
    assert!(!store.has_state_node(&state.root));
    assert_eq!(store.state_node_count(), 0);
}

#[test]
fn test_interrupted_download_resumes() {
    let state = test_state();
    let store = empty_store();
    let mut first = StateSync::new(state.root, Arc::new(store.clone()));
    for _ in 0..3 {
        for hash in first.missing(8) {
            first.process(state.nodes[&hash].clone()).unwrap();
        }
    }
    assert!(!first.is_done());
    let partial = store.state_node_count();
    drop(first);

    let mut second = StateSync::new(state.root, Arc::new(store.clone()));
    let requested = download(&mut second, &state, 16);
    assert!(second.is_done());
    assert_eq!(requested.len() + partial, state.nodes.len());
    assert_eq!(store.state_node_count(), state.nodes.len());
}

#[test]
fn test_unrequested_and_duplicate_nodes() {
    let state = test_state();
    let mut sync = StateSync::new(state.root, Arc::new(empty_store()));

    let junk = Bytes::from_static(b"junk");
    assert_eq!(
        sync.process(junk.clone()),
        Err(StateSyncError::Unrequested(keccak256(&junk)))
    );

    sync.missing(1);
    sync.process(state.nodes[&state.root].clone()).unwrap();
    assert_eq!(
        sync.process(state.nodes[&state.root].clone()),
        Err(StateSyncError::Unrequested(state.root))
    );
    assert_eq!(sync.pulled(), 1);
}

#[test]
fn test_undecodable_node() {
    let data = Bytes::from_static(&[0xff, 0x01]);
    let hash = keccak256(&data);
    let mut sync = StateSync::new(hash, Arc::new(empty_store()));

    assert_eq!(sync.missing(1), vec![hash]);
    assert_eq!(sync.process(data), Err(StateSyncError::Undecodable(hash)));
    assert!(!sync.is_done());
}

#[test]
fn test_requeue_puts_hashes_back_in_front() {
    let state = test_state();
    let mut sync = StateSync::new(state.root, Arc::new(empty_store()));

    let taken = sync.missing(1);
    assert_eq!(sync.pending(), 0);
    sync.requeue(taken.clone());
    assert_eq!(sync.missing(1), taken);

    // Hashes the scheduler no longer waits for are ignored.
    sync.requeue(vec![Hash::repeat_byte(9)]);
    assert_eq!(sync.pending(), 0);
}
