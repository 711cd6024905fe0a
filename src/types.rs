use serde::{Deserialize, Serialize};

/// A log emitted by a transaction: a 20-byte address and up to four 32-byte
/// topics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: [u8; 20],
    pub topics: Vec<[u8; 32]>,
}

/// A transaction inside a block. `content` is an opaque payload stored
/// verbatim in the heap file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash_id: [u8; 32],
    pub content: Vec<u8>,
    pub log_list: Vec<LogEntry>,
}

/// A block handed to the database for indexing. Blocks are trusted: chain
/// validity is not checked here. The effective height range is u32.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub height: i64,
    pub block_hash: [u8; 32],
    pub block_info: Vec<u8>,
    pub tx_list: Vec<Transaction>,
}

/// Per-block index record, persisted per height so the in-memory index can
/// be reloaded on open and unwound by the pruner.
///
/// `tx_hash48_list` and `tx_pos_list` run parallel to the block's
/// transaction list; `addr_hashes`/`addr_pos_lists` and
/// `topic_hashes`/`topic_pos_lists` pair each log address/topic short hash
/// with the intra-block indices of the transactions that mentioned it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockIndex {
    pub height: u32,
    pub block_hash48: u64,
    /// Logical 40-bit offset of the block-info payload in the heap.
    pub begin_offset: i64,
    pub tx_hash48_list: Vec<u64>,
    pub tx_pos_list: Vec<i64>,
    pub addr_hashes: Vec<u64>,
    pub addr_pos_lists: Vec<Vec<u32>>,
    pub topic_hashes: Vec<u64>,
    pub topic_pos_lists: Vec<Vec<u32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding;

    #[test]
    fn test_block_index_round_trip() {
        let index = BlockIndex {
            height: 7,
            block_hash48: 0x0000_1234_5678_9abc,
            begin_offset: 42,
            tx_hash48_list: vec![1, 2, 3],
            tx_pos_list: vec![43, 44, 45],
            addr_hashes: vec![100, 200],
            addr_pos_lists: vec![vec![0, 2], vec![1]],
            topic_hashes: vec![300],
            topic_pos_lists: vec![vec![0, 1, 2]],
        };

        let bytes = encoding::serialize(&index);
        let decoded: BlockIndex = encoding::deserialize(&bytes).unwrap();
        assert_eq!(index, decoded);

        // re-serialization is bit-identical
        assert_eq!(bytes, encoding::serialize(&decoded));
    }

    #[test]
    fn test_block_round_trip() {
        let block = Block {
            height: 1,
            block_hash: [0x11; 32],
            block_info: b"B1".to_vec(),
            tx_list: vec![Transaction {
                hash_id: [0x21; 32],
                content: b"tx1".to_vec(),
                log_list: vec![LogEntry {
                    address: [0xaa; 20],
                    topics: vec![[0xbb; 32], [0xcc; 32]],
                }],
            }],
        };

        let bytes = encoding::serialize(&block);
        let decoded: Block = encoding::deserialize(&bytes).unwrap();
        assert_eq!(block, decoded);
    }
}
