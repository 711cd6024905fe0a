use std::path::Path;

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};

use crate::error::Result;

/// Little-endian u64: the heap size every persisted block index lies within.
pub const KEY_HPF_SIZE: &[u8] = b"HPF_SIZE";
/// 8-byte short-hash seed, written once at creation and immutable after.
pub const KEY_SEED: &[u8] = b"SEED";
/// Serialized pending block awaiting indexing; absent when idle.
pub const KEY_NEW: &[u8] = b"NEW";

const BLOCK_INDEX_TAG: u8 = b'B';

/// Key of the per-height block index record: `'B'` followed by the
/// little-endian height.
pub fn block_index_key(height: u32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = BLOCK_INDEX_TAG;
    key[1..].copy_from_slice(&height.to_le_bytes());
    key
}

/// Exclusive upper bound covering every block index key.
pub const BLOCK_INDEX_END: &[u8] = b"C";

/// Durable side state: an ordered key-value store holding the heap size, the
/// hash seed, the pending-block staging record, and one index record per
/// height.
pub struct MetaStore {
    db: DB,
    sync_writes: bool,
}

impl MetaStore {
    pub fn open(path: &Path, sync_writes: bool) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db, sync_writes })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    /// Write a single key with full durability; used for staging the pending
    /// block, where the caller must be able to rely on the record surviving
    /// a crash the moment this returns.
    pub fn set_sync(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put_opt(key, value, &self.write_opts())?;
        Ok(())
    }

    /// Commit a batch of writes and deletes atomically and durably.
    pub fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    /// Ascending lexicographic iteration over keys in `[start, end)`.
    pub fn iter_range<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
    ) -> impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>)>> + 'a {
        let end = end.to_vec();
        self.db
            .iterator(IteratorMode::From(start, Direction::Forward))
            .take_while(move |item| match item {
                Ok((key, _)) => key.as_ref() < end.as_slice(),
                Err(_) => true,
            })
            .map(|item| item.map_err(Into::into))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, MetaStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path(), false).unwrap();
        (dir, store)
    }

    #[test]
    fn test_set_sync_and_get() {
        let (_dir, store) = open_temp();
        assert_eq!(store.get(KEY_NEW).unwrap(), None);
        store.set_sync(KEY_NEW, b"pending").unwrap();
        assert_eq!(store.get(KEY_NEW).unwrap(), Some(b"pending".to_vec()));
    }

    #[test]
    fn test_batch_commit() {
        let (_dir, store) = open_temp();
        store.set_sync(KEY_NEW, b"pending").unwrap();

        let mut batch = WriteBatch::default();
        batch.put(block_index_key(1), b"index");
        batch.put(KEY_HPF_SIZE, 64u64.to_le_bytes());
        batch.delete(KEY_NEW);
        store.commit(batch).unwrap();

        assert_eq!(store.get(&block_index_key(1)).unwrap(), Some(b"index".to_vec()));
        assert_eq!(
            store.get(KEY_HPF_SIZE).unwrap(),
            Some(64u64.to_le_bytes().to_vec())
        );
        assert_eq!(store.get(KEY_NEW).unwrap(), None);
    }

    #[test]
    fn test_iter_range_ordered_and_exclusive() {
        let (_dir, store) = open_temp();
        for height in [5u32, 1, 3, 2, 4] {
            store
                .set_sync(&block_index_key(height), &height.to_le_bytes())
                .unwrap();
        }

        let heights: Vec<u32> = store
            .iter_range(&block_index_key(0), &block_index_key(4))
            .map(|item| {
                let (key, _) = item.unwrap();
                u32::from_le_bytes(key[1..].try_into().unwrap())
            })
            .collect();
        assert_eq!(heights, vec![1, 2, 3]);
    }

    #[test]
    fn test_iter_range_full_prefix() {
        let (_dir, store) = open_temp();
        store.set_sync(&block_index_key(0), b"a").unwrap();
        store.set_sync(&block_index_key(u32::MAX), b"b").unwrap();
        store.set_sync(KEY_SEED, b"12345678").unwrap();

        let count = store
            .iter_range(&block_index_key(0), BLOCK_INDEX_END)
            .count();
        assert_eq!(count, 2);
    }
}
