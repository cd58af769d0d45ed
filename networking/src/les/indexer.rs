use std::sync::Arc;

use chain::{ChainConfig, ChainStore};
use containers::cht::build_cht;
use containers::{ChtEntry, Hash};
use tracing::{debug, info};

use super::error::IndexError;

/// Builds canonical hash trie roots from locally verified headers.
///
/// A section is only committed once the head is `helper_trie_confirmations`
/// blocks past its last block, so that a shallow reorg cannot invalidate a
/// root that was already handed out.
pub struct ChtIndexer {
    config: ChainConfig,
    store: Arc<dyn ChainStore>,
    next_section: u64,
}

impl ChtIndexer {
    pub fn new(config: ChainConfig, store: Arc<dyn ChainStore>) -> Self {
        Self {
            config,
            store,
            next_section: 0,
        }
    }

    /// Resume after sections that are already known, e.g. from a checkpoint.
    pub fn starting_at(mut self, section: u64) -> Self {
        self.next_section = section;
        self
    }

    pub fn next_section(&self) -> u64 {
        self.next_section
    }

    fn section_ready(&self, section: u64, head: u64) -> bool {
        let end = (section + 1) * self.config.cht_frequency;
        head + 1 >= end + self.config.helper_trie_confirmations
    }

    /// Build every section that became final since the last call and return
    /// their `(section, root)` pairs.
    pub fn update(&mut self) -> Result<Vec<(u64, Hash)>, IndexError> {
        let head = self.store.current_header().number;
        let mut built = Vec::new();
        while self.section_ready(self.next_section, head) {
            let root = self.build_section(self.next_section)?;
            info!(section = self.next_section, %root, "Built CHT section");
            built.push((self.next_section, root));
            self.next_section += 1;
        }
        Ok(built)
    }

    fn build_section(&self, section: u64) -> Result<Hash, IndexError> {
        let start = section * self.config.cht_frequency;
        let end = start + self.config.cht_frequency;
        let mut entries = Vec::with_capacity(self.config.cht_frequency as usize);
        for number in start..end {
            let header = self
                .store
                .get_header_by_number(number)
                .ok_or(IndexError::MissingHeader(number))?;
            let hash = header.hash();
            let td = self.store.get_td(&hash).ok_or(IndexError::MissingTd(hash))?;
            entries.push((number, ChtEntry { hash, td }));
        }
        debug!(section, start, end, "Indexed section headers");
        Ok(build_cht(entries)?.root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain::{MemoryChain, DEVNET_CONFIG};
    use containers::{Block, Header, U256};

    fn chain(len: u64) -> MemoryChain {
        let store = MemoryChain::new(Block::default());
        let mut parent = store.genesis();
        let mut headers = Vec::new();
        for number in 1..=len {
            let header = Header {
                parent_hash: parent.hash(),
                number,
                difficulty: U256::from(1u64),
                ..Default::default()
            };
            headers.push(header.clone());
            parent = header;
        }
        store.insert_header_chain(&headers).unwrap();
        store
    }

    #[test]
    fn waits_for_confirmations() {
        // First section is blocks 0..64 and needs 8 confirmations.
        let store = Arc::new(chain(70));
        let mut indexer = ChtIndexer::new(DEVNET_CONFIG, store.clone());
        assert!(indexer.update().unwrap().is_empty());

        let store = Arc::new(chain(71));
        let mut indexer = ChtIndexer::new(DEVNET_CONFIG, store.clone());
        let built = indexer.update().unwrap();
        assert_eq!(built.len(), 1);
        assert_eq!(indexer.next_section(), 1);
        assert!(indexer.update().unwrap().is_empty());
    }

    #[test]
    fn root_commits_hashes_and_difficulty() {
        let store = Arc::new(chain(71));
        let mut indexer = ChtIndexer::new(DEVNET_CONFIG, store.clone());
        let built = indexer.update().unwrap();

        let expected = build_cht((0..64).map(|number| {
            let hash = store.get_header_by_number(number).unwrap().hash();
            (
                number,
                ChtEntry {
                    hash,
                    td: store.get_td(&hash).unwrap(),
                },
            )
        }))
        .unwrap()
        .root();
        assert_eq!(built, vec![(0, expected)]);
    }

    #[test]
    fn starting_section_skips_known_roots() {
        let store = Arc::new(chain(140));
        let mut indexer = ChtIndexer::new(DEVNET_CONFIG, store).starting_at(1);
        let built = indexer.update().unwrap();
        assert_eq!(built.iter().map(|(section, _)| *section).collect::<Vec<_>>(), vec![1]);
    }
}
