use std::collections::{BTreeMap, HashMap};

use crate::hash48::{id56, MATCH_ANY_ADDR};

/// The in-memory reverse index. Keys are compact: heights, 56-bit
/// transaction ids, and seeded 48-bit short hashes; values are 40-bit
/// logical heap offsets. Short-hash entries keep every colliding offset in
/// insertion order, and callers resolve collisions by decoding candidates.
///
/// The indexer performs no synchronization of its own; the database guards
/// it with its read/write lock.
pub struct Indexer {
    height_to_offset: HashMap<u32, i64>,
    block_hash_to_offsets: HashMap<u64, Vec<i64>>,
    id_to_offset: HashMap<u64, i64>,
    tx_hash_to_offsets: HashMap<u64, Vec<i64>>,
    /// addr hash48 -> height -> ascending, deduplicated tx indices
    addr_to_logs: HashMap<u64, BTreeMap<u32, Vec<u32>>>,
    topic_to_logs: HashMap<u64, BTreeMap<u32, Vec<u32>>>,
}

impl Indexer {
    pub fn new() -> Self {
        Self {
            height_to_offset: HashMap::new(),
            block_hash_to_offsets: HashMap::new(),
            id_to_offset: HashMap::new(),
            tx_hash_to_offsets: HashMap::new(),
            addr_to_logs: HashMap::new(),
            topic_to_logs: HashMap::new(),
        }
    }

    pub fn add_block(&mut self, height: u32, block_hash48: u64, offset40: i64) {
        self.height_to_offset.insert(height, offset40);
        self.block_hash_to_offsets
            .entry(block_hash48)
            .or_default()
            .push(offset40);
    }

    pub fn add_tx(&mut self, id: u64, tx_hash48: u64, offset40: i64) {
        self.id_to_offset.insert(id, offset40);
        self.tx_hash_to_offsets
            .entry(tx_hash48)
            .or_default()
            .push(offset40);
    }

    pub fn add_addr_logs(&mut self, addr_hash48: u64, height: u32, tx_indices: &[u32]) {
        Self::merge_logs(&mut self.addr_to_logs, addr_hash48, height, tx_indices);
    }

    pub fn add_topic_logs(&mut self, topic_hash48: u64, height: u32, tx_indices: &[u32]) {
        Self::merge_logs(&mut self.topic_to_logs, topic_hash48, height, tx_indices);
    }

    pub fn erase_block(&mut self, height: u32, block_hash48: u64) {
        if let Some(offset40) = self.height_to_offset.remove(&height) {
            Self::remove_offset(&mut self.block_hash_to_offsets, block_hash48, offset40);
        }
    }

    pub fn erase_tx(&mut self, id: u64, tx_hash48: u64, offset40: i64) {
        self.id_to_offset.remove(&id);
        Self::remove_offset(&mut self.tx_hash_to_offsets, tx_hash48, offset40);
    }

    pub fn erase_addr_logs(&mut self, addr_hash48: u64, height: u32) {
        Self::remove_logs(&mut self.addr_to_logs, addr_hash48, height);
    }

    pub fn erase_topic_logs(&mut self, topic_hash48: u64, height: u32) {
        Self::remove_logs(&mut self.topic_to_logs, topic_hash48, height);
    }

    pub fn offset_by_height(&self, height: u32) -> Option<i64> {
        self.height_to_offset.get(&height).copied()
    }

    pub fn offset_by_tx_id(&self, id: u64) -> Option<i64> {
        self.id_to_offset.get(&id).copied()
    }

    /// Candidate offsets for a block hash, in insertion order.
    pub fn offsets_by_block_hash(&self, hash48: u64) -> &[i64] {
        self.block_hash_to_offsets
            .get(&hash48)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Candidate offsets for a transaction hash, in insertion order.
    pub fn offsets_by_tx_hash(&self, hash48: u64) -> &[i64] {
        self.tx_hash_to_offsets
            .get(&hash48)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Offsets of the transactions whose logs match the address and every
    /// topic, for each height in `[start_height, end_height]`, ordered by
    /// ascending height and ascending intra-block index.
    ///
    /// `MATCH_ANY_ADDR` lifts the address constraint. With no topics either,
    /// the query degenerates to every transaction that emitted at least one
    /// log in the height range. Results are candidates: the caller confirms
    /// them against the exact address and topics after decoding.
    pub fn query_tx_offsets(
        &self,
        addr_hash48: u64,
        topic_hashes: &[u64],
        start_height: u32,
        end_height: u32,
    ) -> Vec<i64> {
        let mut offsets = Vec::new();
        if start_height > end_height {
            return offsets;
        }

        if addr_hash48 != MATCH_ANY_ADDR {
            let Some(heights) = self.addr_to_logs.get(&addr_hash48) else {
                return offsets;
            };
            for (&height, indices) in heights.range(start_height..=end_height) {
                if let Some(surviving) = self.filter_by_topics(indices, topic_hashes, height) {
                    self.resolve(height, &surviving, &mut offsets);
                }
            }
        } else if let Some(first) = topic_hashes.first() {
            let Some(heights) = self.topic_to_logs.get(first) else {
                return offsets;
            };
            for (&height, indices) in heights.range(start_height..=end_height) {
                if let Some(surviving) = self.filter_by_topics(indices, &topic_hashes[1..], height)
                {
                    self.resolve(height, &surviving, &mut offsets);
                }
            }
        } else {
            // no filters: union the address posting lists per height (every
            // log names an address, so this is "any transaction with a log")
            let mut logging_txs: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
            for heights in self.addr_to_logs.values() {
                for (&height, indices) in heights.range(start_height..=end_height) {
                    let merged = logging_txs.entry(height).or_default();
                    merged.extend_from_slice(indices);
                    merged.sort_unstable();
                    merged.dedup();
                }
            }
            for (&height, indices) in &logging_txs {
                self.resolve(height, indices, &mut offsets);
            }
        }
        offsets
    }

    /// Intersects a candidate index list with every topic's posting list at
    /// the given height. `None` when any topic has no entry there.
    fn filter_by_topics(
        &self,
        indices: &[u32],
        topic_hashes: &[u64],
        height: u32,
    ) -> Option<Vec<u32>> {
        let mut surviving = indices.to_vec();
        for topic_hash48 in topic_hashes {
            let posted = self
                .topic_to_logs
                .get(topic_hash48)
                .and_then(|heights| heights.get(&height))?;
            surviving = intersect_sorted(&surviving, posted);
            if surviving.is_empty() {
                return None;
            }
        }
        Some(surviving)
    }

    fn resolve(&self, height: u32, indices: &[u32], offsets: &mut Vec<i64>) {
        for &index in indices {
            if let Some(offset40) = self.offset_by_tx_id(id56(height, index)) {
                offsets.push(offset40);
            }
        }
    }

    fn merge_logs(
        map: &mut HashMap<u64, BTreeMap<u32, Vec<u32>>>,
        hash48: u64,
        height: u32,
        tx_indices: &[u32],
    ) {
        let merged = map.entry(hash48).or_default().entry(height).or_default();
        merged.extend_from_slice(tx_indices);
        merged.sort_unstable();
        merged.dedup();
    }

    fn remove_logs(map: &mut HashMap<u64, BTreeMap<u32, Vec<u32>>>, hash48: u64, height: u32) {
        if let Some(heights) = map.get_mut(&hash48) {
            heights.remove(&height);
            if heights.is_empty() {
                map.remove(&hash48);
            }
        }
    }

    fn remove_offset(map: &mut HashMap<u64, Vec<i64>>, hash48: u64, offset40: i64) {
        if let Some(offsets) = map.get_mut(&hash48) {
            if let Some(at) = offsets.iter().position(|&o| o == offset40) {
                offsets.remove(at);
            }
            if offsets.is_empty() {
                map.remove(&hash48);
            }
        }
    }
}

impl Default for Indexer {
    fn default() -> Self {
        Self::new()
    }
}

/// Intersection of two ascending deduplicated lists.
fn intersect_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // a block with `txs` transactions at `height`, offsets starting at `base`
    fn add_block_with_txs(indexer: &mut Indexer, height: u32, base: i64, txs: u32) {
        indexer.add_block(height, 0x1000 + height as u64, base);
        for i in 0..txs {
            indexer.add_tx(id56(height, i), 0x2000 + i as u64, base + 1 + i as i64);
        }
    }

    #[test]
    fn test_block_and_tx_lookup() {
        let mut indexer = Indexer::new();
        add_block_with_txs(&mut indexer, 5, 100, 2);

        assert_eq!(indexer.offset_by_height(5), Some(100));
        assert_eq!(indexer.offset_by_height(6), None);
        assert_eq!(indexer.offset_by_tx_id(id56(5, 0)), Some(101));
        assert_eq!(indexer.offset_by_tx_id(id56(5, 1)), Some(102));
        assert_eq!(indexer.offset_by_tx_id(id56(5, 2)), None);
        assert_eq!(indexer.offsets_by_block_hash(0x1005), &[100]);
        assert_eq!(indexer.offsets_by_block_hash(0xdead), &[] as &[i64]);
    }

    #[test]
    fn test_colliding_hashes_keep_insertion_order() {
        let mut indexer = Indexer::new();
        indexer.add_block(1, 0xabc, 10);
        indexer.add_block(2, 0xabc, 20);
        indexer.add_tx(id56(1, 0), 0xdef, 11);
        indexer.add_tx(id56(2, 0), 0xdef, 21);

        assert_eq!(indexer.offsets_by_block_hash(0xabc), &[10, 20]);
        assert_eq!(indexer.offsets_by_tx_hash(0xdef), &[11, 21]);

        indexer.erase_block(1, 0xabc);
        assert_eq!(indexer.offsets_by_block_hash(0xabc), &[20]);
        assert_eq!(indexer.offset_by_height(1), None);
    }

    #[test]
    fn test_erase_leaves_no_residue() {
        let mut indexer = Indexer::new();
        add_block_with_txs(&mut indexer, 3, 50, 2);
        indexer.add_addr_logs(0x700, 3, &[0, 1]);
        indexer.add_topic_logs(0x800, 3, &[1]);

        indexer.erase_block(3, 0x1003);
        indexer.erase_tx(id56(3, 0), 0x2000, 51);
        indexer.erase_tx(id56(3, 1), 0x2001, 52);
        indexer.erase_addr_logs(0x700, 3);
        indexer.erase_topic_logs(0x800, 3);

        assert!(indexer.height_to_offset.is_empty());
        assert!(indexer.block_hash_to_offsets.is_empty());
        assert!(indexer.id_to_offset.is_empty());
        assert!(indexer.tx_hash_to_offsets.is_empty());
        assert!(indexer.addr_to_logs.is_empty());
        assert!(indexer.topic_to_logs.is_empty());
    }

    #[test]
    fn test_erase_logs_keeps_other_heights() {
        let mut indexer = Indexer::new();
        indexer.add_addr_logs(0x700, 3, &[0]);
        indexer.add_addr_logs(0x700, 4, &[1]);

        indexer.erase_addr_logs(0x700, 3);
        assert_eq!(
            indexer.query_tx_offsets(0x700, &[], 0, 10),
            Vec::<i64>::new()
        );
        assert!(indexer.addr_to_logs.contains_key(&0x700));
    }

    #[test]
    fn test_merge_dedups_indices() {
        let mut indexer = Indexer::new();
        // a transaction with two logs naming the same address reports its
        // index twice
        indexer.add_addr_logs(0x700, 1, &[0, 0, 2]);
        indexer.add_addr_logs(0x700, 1, &[1, 2]);

        assert_eq!(indexer.addr_to_logs[&0x700][&1], vec![0, 1, 2]);
    }

    #[test]
    fn test_query_by_address() {
        let mut indexer = Indexer::new();
        add_block_with_txs(&mut indexer, 10, 100, 3);
        indexer.add_addr_logs(0x700, 10, &[0, 2]);

        assert_eq!(indexer.query_tx_offsets(0x700, &[], 10, 10), vec![101, 103]);
        // height range excludes the block
        assert_eq!(
            indexer.query_tx_offsets(0x700, &[], 11, 20),
            Vec::<i64>::new()
        );
        // unknown address
        assert_eq!(
            indexer.query_tx_offsets(0x9999, &[], 10, 10),
            Vec::<i64>::new()
        );
    }

    #[test]
    fn test_query_address_and_topics_intersect() {
        let mut indexer = Indexer::new();
        add_block_with_txs(&mut indexer, 10, 100, 3);
        indexer.add_addr_logs(0x700, 10, &[0, 1]);
        indexer.add_topic_logs(0x800, 10, &[0, 2]);
        indexer.add_topic_logs(0x900, 10, &[0]);

        assert_eq!(
            indexer.query_tx_offsets(0x700, &[0x800], 10, 10),
            vec![101]
        );
        assert_eq!(
            indexer.query_tx_offsets(0x700, &[0x800, 0x900], 10, 10),
            vec![101]
        );
        // a topic with no entry at the height eliminates it
        assert_eq!(
            indexer.query_tx_offsets(0x700, &[0xa00], 10, 10),
            Vec::<i64>::new()
        );
    }

    #[test]
    fn test_query_topics_only() {
        let mut indexer = Indexer::new();
        add_block_with_txs(&mut indexer, 10, 100, 3);
        indexer.add_topic_logs(0x800, 10, &[0, 1, 2]);
        indexer.add_topic_logs(0x900, 10, &[1, 2]);

        assert_eq!(
            indexer.query_tx_offsets(MATCH_ANY_ADDR, &[0x800, 0x900], 10, 10),
            vec![102, 103]
        );
    }

    #[test]
    fn test_query_orders_by_height_then_index() {
        let mut indexer = Indexer::new();
        add_block_with_txs(&mut indexer, 11, 200, 2);
        add_block_with_txs(&mut indexer, 10, 100, 2);
        indexer.add_addr_logs(0x700, 11, &[0, 1]);
        indexer.add_addr_logs(0x700, 10, &[1]);

        assert_eq!(
            indexer.query_tx_offsets(0x700, &[], 10, 11),
            vec![102, 201, 202]
        );
    }

    #[test]
    fn test_query_without_any_filter_yields_logging_txs() {
        let mut indexer = Indexer::new();
        add_block_with_txs(&mut indexer, 10, 100, 3);
        // tx0 and tx1 emitted logs, tx2 did not
        indexer.add_addr_logs(0x700, 10, &[0]);
        indexer.add_addr_logs(0x701, 10, &[1]);

        assert_eq!(
            indexer.query_tx_offsets(MATCH_ANY_ADDR, &[], 10, 10),
            vec![101, 102]
        );
    }

    #[test]
    fn test_query_inverted_range() {
        let mut indexer = Indexer::new();
        add_block_with_txs(&mut indexer, 10, 100, 1);
        indexer.add_addr_logs(0x700, 10, &[0]);
        assert_eq!(
            indexer.query_tx_offsets(0x700, &[], 10, 9),
            Vec::<i64>::new()
        );
    }

    #[test]
    fn test_intersect_sorted() {
        assert_eq!(intersect_sorted(&[0, 1, 2], &[1, 2, 3]), vec![1, 2]);
        assert_eq!(intersect_sorted(&[], &[1]), Vec::<u32>::new());
        assert_eq!(intersect_sorted(&[5], &[5]), vec![5]);
        assert_eq!(intersect_sorted(&[1, 3], &[2, 4]), Vec::<u32>::new());
    }
}
