use std::sync::Arc;

use chain::{ChainStore, DEVNET_CONFIG};
use containers::{Address, Bytes, U256, EMPTY_ROOT};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use super::{bloom_vector, test_config, Behavior, Harness, LesServer};
use crate::les::error::{OdrError, RetrieveError};
use crate::les::indexer::ChtIndexer;
use crate::types::{LesRequest, LPV1, LPV2};

fn server() -> Arc<LesServer> {
    Arc::new(LesServer::new(80))
}

#[tokio::test]
async fn test_account_is_proven_then_cached() {
    let h = Harness::new(server(), 80, test_config());
    h.add_peer(LPV2, Behavior::Honest);
    let cancel = CancellationToken::new();
    let block = h.server.hash(30);
    let (address, account) = h.server.state.accounts[3].clone();

    assert_eq!(h.odr.account_at(&block, &address, &cancel).await.unwrap(), Some(account.clone()));
    assert_eq!(h.network.request_count(), 1);
    assert!(h.odr.cached_nodes() > 0);

    // Same state root, so the cached proof answers without the network.
    let later = h.server.hash(40);
    assert_eq!(h.odr.account_at(&later, &address, &cancel).await.unwrap(), Some(account));
    assert_eq!(h.network.request_count(), 1);
}

#[tokio::test]
async fn test_missing_account_is_proven_absent() {
    let h = Harness::new(server(), 80, test_config());
    h.add_peer(LPV2, Behavior::Honest);
    let missing = Address::repeat_byte(0xee);

    let account = h
        .odr
        .account_at(&h.server.hash(30), &missing, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(account, None);
}

#[tokio::test]
async fn test_account_before_any_state_is_empty() {
    let h = Harness::new(server(), 80, test_config());
    h.add_peer(LPV2, Behavior::Honest);
    let (address, _) = h.server.state.accounts[0].clone();

    // Genesis commits to the empty state.
    let account = h
        .odr
        .account_at(&h.server.hash(0), &address, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(account, None);
    assert_eq!(h.network.request_count(), 0);
}

#[tokio::test]
async fn test_withheld_proof_node_is_rejected() {
    let h = Harness::new(server(), 80, test_config());
    let bad = h.add_peer(LPV2, Behavior::Corrupt);
    let good = h.add_peer(LPV2, Behavior::Honest);
    h.prefer(&bad);
    let (address, account) = h.server.state.accounts[7].clone();

    let result = h
        .odr
        .account_at(&h.server.hash(30), &address, &CancellationToken::new())
        .await;

    assert_eq!(result, Ok(Some(account)));
    assert!(h.peers.is_dropped(&bad));
    assert_eq!(h.network.requests_to(&good).len(), 1);
}

#[tokio::test]
async fn test_contract_code() {
    let h = Harness::new(server(), 80, test_config());
    h.add_peer(LPV2, Behavior::Honest);
    let cancel = CancellationToken::new();
    let block = h.server.hash(30);
    let (_, contract) = h.server.state.accounts[9].clone();

    let code = h.odr.code(&block, &contract.code_hash, &cancel).await.unwrap();
    assert_eq!(code, Bytes::from_static(b"contract code"));

    // Code is cached by hash, and the empty code hash needs no request.
    h.odr.code(&block, &contract.code_hash, &cancel).await.unwrap();
    assert_eq!(h.odr.code(&block, &EMPTY_ROOT, &cancel).await.unwrap(), Bytes::new());
    assert_eq!(h.network.request_count(), 1);
}

#[tokio::test]
async fn test_receipts() {
    let h = Harness::new(server(), 80, test_config());
    let peer = h.add_peer(LPV2, Behavior::Honest);
    let cancel = CancellationToken::new();

    let receipts = h.odr.receipts(&h.server.hash(25), &cancel).await.unwrap();
    assert_eq!(receipts, h.server.chain.receipts[25]);
    assert_eq!(
        h.network.requests_to(&peer),
        vec![LesRequest::GetReceipts(vec![h.server.hash(25)])]
    );

    // A block without transactions has nothing to fetch.
    let empty = h.odr.receipts(&h.server.hash(26), &cancel).await.unwrap();
    assert!(empty.is_empty());
    assert_eq!(h.network.request_count(), 1);
}

#[tokio::test]
async fn test_corrupt_receipts_are_rejected() {
    let h = Harness::new(server(), 80, test_config());
    h.add_peer(LPV2, Behavior::Corrupt);

    let result = h
        .odr
        .receipts(&h.server.hash(25), &CancellationToken::new())
        .await;

    assert_eq!(
        result,
        Err(OdrError::Retrieve(RetrieveError::RetrieveFailed { attempts: 1 }))
    );
}

#[tokio::test]
async fn test_unknown_block() {
    let h = Harness::new(server(), 40, test_config());
    h.add_peer(LPV2, Behavior::Honest);
    let beyond = h.server.hash(50);

    let result = h.odr.body(&beyond, &CancellationToken::new()).await;

    assert_eq!(result, Err(OdrError::UnknownBlock(beyond)));
    assert_eq!(h.network.request_count(), 0);
}

#[tokio::test]
async fn test_local_canonical_header() {
    let h = Harness::new(server(), 40, test_config());

    let proven = h
        .odr
        .canonical_header(12, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(proven.header, h.server.chain.header(12).clone());
    assert_eq!(proven.td, U256::from(12u64));
}

#[tokio::test]
async fn test_canonical_header_proven_by_cht() {
    // Only genesis is held locally.
    let h = Harness::new(server(), 0, test_config());
    let peer = h.add_peer(LPV1, Behavior::Honest);
    h.odr.add_cht_root(0, h.server.chts[0].root());

    let proven = h
        .odr
        .canonical_header(33, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(proven.header, h.server.chain.header(33).clone());
    assert_eq!(proven.td, U256::from(33u64));
    assert_eq!(h.network.requests_to(&peer).len(), 1);
}

#[tokio::test]
async fn test_cht_proof_for_wrong_header_is_rejected() {
    let h = Harness::new(server(), 0, test_config());
    let bad = h.add_peer(LPV2, Behavior::Corrupt);
    h.add_peer(LPV2, Behavior::Honest);
    h.prefer(&bad);
    h.odr.add_cht_root(0, h.server.chts[0].root());

    let proven = h
        .odr
        .canonical_header(33, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(proven.header.number, 33);
    assert!(h.peers.is_dropped(&bad));
}

#[tokio::test]
async fn test_missing_cht_root() {
    let h = Harness::new(server(), 0, test_config());
    h.add_peer(LPV2, Behavior::Honest);
    h.odr.add_cht_root(0, h.server.chts[0].root());

    let result = h.odr.canonical_header(70, &CancellationToken::new()).await;

    assert_eq!(result, Err(OdrError::MissingChtRoot(1)));
    assert_eq!(h.network.request_count(), 0);
}

#[tokio::test]
async fn test_indexer_roots_match_served_chts() {
    let h = Harness::new(server(), 80, test_config());
    let mut indexer = ChtIndexer::new(DEVNET_CONFIG, Arc::new(h.store.clone()));

    assert_eq!(h.odr.apply_indexer(&mut indexer).unwrap(), 1);
    assert_eq!(h.odr.cht_root(0), Some(h.server.chts[0].root()));
    assert_eq!(h.odr.cht_root(1), None);
    assert_eq!(h.store.current_header().number, 80);
}

#[tokio::test]
async fn test_bloom_bits() {
    let h = Harness::new(server(), 80, test_config());
    h.add_peer(LPV2, Behavior::Honest);
    h.odr.add_bloom_trie_root(0, h.server.bloom_tries[0].root());

    let bits = h
        .odr
        .bloom_bits(9, &[0], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(bits, vec![bloom_vector(9, 0)]);
}

#[tokio::test]
async fn test_bloom_bits_need_version_two_servers() {
    let h = Harness::new(server(), 80, test_config());
    let old = h.add_peer(LPV1, Behavior::Honest);
    h.odr.add_bloom_trie_root(0, h.server.bloom_tries[0].root());

    let result = h.odr.bloom_bits(7, &[0], &CancellationToken::new()).await;

    assert_eq!(result, Err(OdrError::Retrieve(RetrieveError::NoPeer)));
    assert!(h.network.requests_to(&old).is_empty());
}

#[tokio::test]
async fn test_missing_bloom_trie_root() {
    let h = Harness::new(server(), 80, test_config());
    h.add_peer(LPV2, Behavior::Honest);
    h.odr.add_bloom_trie_root(0, h.server.bloom_tries[0].root());

    let result = h.odr.bloom_bits(7, &[0, 1], &CancellationToken::new()).await;

    assert_eq!(result, Err(OdrError::MissingBloomRoot(1)));
    assert!(h.odr.bloom_bits(7, &[], &CancellationToken::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bloom_bits_for_block_range() {
    let h = Harness::new(server(), 80, test_config());
    h.add_peer(LPV2, Behavior::Honest);
    h.odr.add_bloom_trie_root(0, h.server.bloom_tries[0].root());
    let cancel = CancellationToken::new();

    // Section 0 covers blocks 0..64.
    let bits = h.odr.bloom_bits_for_blocks(3, 10, 63, &cancel).await.unwrap();
    assert_eq!(bits, vec![bloom_vector(3, 0)]);

    let result = h.odr.bloom_bits_for_blocks(3, 10, 64, &cancel).await;
    assert_eq!(result, Err(OdrError::MissingBloomRoot(1)));
    assert!(h.odr.bloom_bits_for_blocks(3, 20, 10, &cancel).await.unwrap().is_empty());
}
