use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use rocksdb::WriteBatch;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::encoding;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::hash48::{id56, short48, MATCH_ANY_ADDR};
use crate::heap::{HeapFile, OFFSET_UNIT};
use crate::indexer::Indexer;
use crate::meta::{self, MetaStore};
use crate::types::{Block, BlockIndex};

const LOCK_FILE: &str = "chaindb.lock";
const META_DIR: &str = "meta";
const DATA_DIR: &str = "data";

/// Heap file and indexer, mutated together under the write lock.
struct Volatile {
    heap: HeapFile,
    indexer: Indexer,
}

struct Inner {
    seed: [u8; 8],
    meta: MetaStore,
    state: RwLock<Volatile>,
}

/// An append-only block database.
///
/// [`ChainDb::add_block`] stages the block durably and returns; a single
/// background thread then appends the block and transaction bodies to the
/// heap file, updates the in-memory index, and commits the per-height index
/// record. Queries run under the read lock and return candidate payloads
/// that the caller confirms against full hashes, since index keys are 48-bit
/// short hashes.
pub struct ChainDb {
    inner: Arc<Inner>,
    /// In-flight indexing task; at most one, joined before the next ingest.
    pending: Mutex<Option<JoinHandle<()>>>,
    _lock: FileLock,
}

impl ChainDb {
    /// Creates a fresh database at `path` with the given short-hash seed.
    /// The seed is persisted and immutable for the database's lifetime.
    pub fn create_empty(path: impl AsRef<Path>, seed: [u8; 8]) -> Result<ChainDb> {
        Self::create_empty_with_config(path, seed, Config::default())
    }

    pub fn create_empty_with_config(
        path: impl AsRef<Path>,
        seed: [u8; 8],
        config: Config,
    ) -> Result<ChainDb> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        let lock = FileLock::lock(path.join(LOCK_FILE))?;
        let metastore = MetaStore::open(&path.join(META_DIR), config.sync_writes)?;
        if metastore.get(meta::KEY_SEED)?.is_some() {
            return Err(Error::InvalidState(format!(
                "{} already holds an initialized database",
                path.display()
            )));
        }
        let heap = HeapFile::open(path.join(DATA_DIR), config.segment_size)?;

        let mut batch = WriteBatch::default();
        batch.put(meta::KEY_HPF_SIZE, 0u64.to_le_bytes());
        batch.put(meta::KEY_SEED, seed);
        metastore.commit(batch)?;

        info!(path = %path.display(), "created empty block database");
        Ok(ChainDb {
            inner: Arc::new(Inner {
                seed,
                meta: metastore,
                state: RwLock::new(Volatile {
                    heap,
                    indexer: Indexer::new(),
                }),
            }),
            pending: Mutex::new(None),
            _lock: lock,
        })
    }

    /// Opens an existing database, recovering from a crash if needed: the
    /// heap tail is truncated back to the last durable size, the in-memory
    /// index is reloaded from the persisted per-height records, and a block
    /// left staged by an interrupted ingest is re-indexed before returning.
    pub fn open(path: impl AsRef<Path>) -> Result<ChainDb> {
        Self::open_with_config(path, Config::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: Config) -> Result<ChainDb> {
        let path = path.as_ref();
        let lock = FileLock::lock(path.join(LOCK_FILE))?;
        let metastore = MetaStore::open(&path.join(META_DIR), config.sync_writes)?;

        let durable_size = metastore
            .get(meta::KEY_HPF_SIZE)?
            .and_then(|bytes| Some(u64::from_le_bytes(bytes.as_slice().try_into().ok()?)))
            .ok_or_else(|| Error::Corrupt("missing or malformed durable heap size".into()))?;
        let mut heap = HeapFile::open(path.join(DATA_DIR), config.segment_size)?;
        // a half-committed block may have left bytes past the durable size
        heap.truncate(durable_size as i64)?;

        let mut indexer = Indexer::new();
        let mut reloaded = 0usize;
        for item in metastore.iter_range(&meta::block_index_key(0), meta::BLOCK_INDEX_END) {
            let (_, value) = item?;
            let index: BlockIndex = encoding::deserialize(&value)?;
            reload_block(&mut indexer, &index);
            reloaded += 1;
        }

        let seed: [u8; 8] = metastore
            .get(meta::KEY_SEED)?
            .and_then(|bytes| bytes.as_slice().try_into().ok())
            .ok_or_else(|| Error::Corrupt("missing or malformed hash seed".into()))?;

        let staged = match metastore.get(meta::KEY_NEW)? {
            Some(bytes) => Some(encoding::deserialize::<Block>(&bytes)?),
            None => None,
        };

        let db = ChainDb {
            inner: Arc::new(Inner {
                seed,
                meta: metastore,
                state: RwLock::new(Volatile { heap, indexer }),
            }),
            pending: Mutex::new(None),
            _lock: lock,
        };
        info!(path = %path.display(), blocks = reloaded, "opened block database");

        if let Some(block) = staged {
            info!(height = block.height, "re-indexing block staged before shutdown");
            db.spawn_index_task(block, -1);
            db.wait_pending();
        }
        Ok(db)
    }

    /// Accepts a block for indexing and prunes everything below
    /// `prune_till_height` afterwards (negative: no pruning).
    ///
    /// Returns as soon as the block is durably staged; indexing happens on a
    /// background thread and is externally visible no later than the return
    /// of the next `add_block` or `close` call. I/O faults beyond this point
    /// are unrecoverable and abort the process.
    pub fn add_block(&self, block: Block, prune_till_height: i64) {
        self.wait_pending();
        let bytes = encoding::serialize(&block);
        if let Err(e) = self.inner.meta.set_sync(meta::KEY_NEW, &bytes) {
            fatal("staging pending block", &e);
        }
        self.spawn_index_task(block, prune_till_height);
    }

    /// Serialized body of the block at `height`, if still indexed.
    pub fn get_block_by_height(&self, height: i64) -> Option<Vec<u8>> {
        let height = u32::try_from(height).ok()?;
        let state = self.inner.state.read().unwrap();
        let offset40 = state.indexer.offset_by_height(height)?;
        Some(read_payload(&state, offset40))
    }

    /// Serialized body of the transaction at `(height, index)`.
    pub fn get_tx_by_height_and_index(&self, height: i64, index: u32) -> Option<Vec<u8>> {
        let height = u32::try_from(height).ok()?;
        let state = self.inner.state.read().unwrap();
        let offset40 = state.indexer.offset_by_tx_id(id56(height, index))?;
        Some(read_payload(&state, offset40))
    }

    /// Feeds every candidate block body for `hash` to `collect`, in
    /// insertion order, stopping once it returns true. Candidates share the
    /// hash's 48-bit short form; the caller confirms the full hash.
    pub fn get_block_by_hash(&self, hash: &[u8; 32], mut collect: impl FnMut(&[u8]) -> bool) {
        let state = self.inner.state.read().unwrap();
        let hash48 = short48(&self.inner.seed, hash);
        for &offset40 in state.indexer.offsets_by_block_hash(hash48) {
            if collect(&read_payload(&state, offset40)) {
                return;
            }
        }
    }

    /// Transaction analogue of [`ChainDb::get_block_by_hash`].
    pub fn get_tx_by_hash(&self, hash: &[u8; 32], mut collect: impl FnMut(&[u8]) -> bool) {
        let state = self.inner.state.read().unwrap();
        let hash48 = short48(&self.inner.seed, hash);
        for &offset40 in state.indexer.offsets_by_tx_hash(hash48) {
            if collect(&read_payload(&state, offset40)) {
                return;
            }
        }
    }

    /// Feeds the bodies of transactions whose logs match the optional
    /// address and every topic, over `[start_height, end_height]`, to `f` in
    /// ascending (height, intra-block index) order. `f` returns whether it
    /// wants more. Matches are short-hash candidates; the caller re-checks
    /// the exact address and topics against each decoded body.
    pub fn query_logs(
        &self,
        addr: Option<&[u8; 20]>,
        topics: &[[u8; 32]],
        start_height: u32,
        end_height: u32,
        mut f: impl FnMut(&[u8]) -> bool,
    ) {
        let state = self.inner.state.read().unwrap();
        let addr_hash48 = match addr {
            Some(addr) => short48(&self.inner.seed, addr),
            None => MATCH_ANY_ADDR,
        };
        let topic_hashes: Vec<u64> = topics
            .iter()
            .map(|topic| short48(&self.inner.seed, topic))
            .collect();
        for offset40 in
            state
                .indexer
                .query_tx_offsets(addr_hash48, &topic_hashes, start_height, end_height)
        {
            if !f(&read_payload(&state, offset40)) {
                return;
            }
        }
    }

    /// Waits for any in-flight indexing task and flushes the heap.
    pub fn close(self) {
        self.wait_pending();
        let state = self.inner.state.read().unwrap();
        if let Err(e) = state.heap.flush() {
            fatal("flushing heap on close", &e);
        }
        info!("closed block database");
    }

    fn spawn_index_task(&self, block: Block, prune_till_height: i64) {
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("chaindb-index".into())
            .spawn(move || {
                if let Err(e) = inner.index_block(block, prune_till_height) {
                    fatal("background indexing", &e);
                }
            })
            .unwrap_or_else(|e| fatal("spawning indexing thread", &e));
        *self.pending.lock().unwrap() = Some(handle);
    }

    fn wait_pending(&self) {
        let handle = self.pending.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                // the indexing thread panicked; the index state is unknown
                fatal("background indexing", &"indexing thread panicked");
            }
        }
    }
}

impl Drop for ChainDb {
    fn drop(&mut self) {
        self.wait_pending();
    }
}

impl Inner {
    /// The background half of an ingest: append bodies to the heap, mutate
    /// the in-memory index, commit the per-height record together with the
    /// new durable heap size and the removal of the staging record, then
    /// prune. Readers are excluded from the mutation window by the write
    /// lock; the staging record keeps the block replayable until the commit.
    fn index_block(&self, block: Block, prune_till_height: i64) -> Result<()> {
        let height = block.height as u32;
        let (addr_hashes, addr_pos_lists, topic_hashes, topic_pos_lists) =
            self.collect_log_index(&block);
        let mut index = BlockIndex {
            height,
            block_hash48: short48(&self.seed, &block.block_hash),
            begin_offset: 0,
            tx_hash48_list: Vec::with_capacity(block.tx_list.len()),
            tx_pos_list: Vec::with_capacity(block.tx_list.len()),
            addr_hashes,
            addr_pos_lists,
            topic_hashes,
            topic_pos_lists,
        };

        {
            let mut state = self.state.write().unwrap();
            index.begin_offset = state.heap.append_payload(&block.block_info)?;
            state
                .indexer
                .add_block(height, index.block_hash48, index.begin_offset);

            for (i, tx) in block.tx_list.iter().enumerate() {
                let offset40 = state.heap.append_payload(&tx.content)?;
                let tx_hash48 = short48(&self.seed, &tx.hash_id);
                index.tx_pos_list.push(offset40);
                index.tx_hash48_list.push(tx_hash48);
                state.indexer.add_tx(id56(height, i as u32), tx_hash48, offset40);
            }
            for (i, &hash48) in index.addr_hashes.iter().enumerate() {
                state
                    .indexer
                    .add_addr_logs(hash48, height, &index.addr_pos_lists[i]);
            }
            for (i, &hash48) in index.topic_hashes.iter().enumerate() {
                state
                    .indexer
                    .add_topic_logs(hash48, height, &index.topic_pos_lists[i]);
            }

            let mut batch = WriteBatch::default();
            batch.put(meta::block_index_key(height), encoding::serialize(&index));
            batch.put(meta::KEY_HPF_SIZE, (state.heap.size() as u64).to_le_bytes());
            batch.delete(meta::KEY_NEW);
            self.meta.commit(batch)?;
            state.heap.flush()?;
            debug!(
                height,
                hash = %hex::encode(block.block_hash),
                txs = block.tx_list.len(),
                heap_size = state.heap.size(),
                "committed block"
            );
        }

        self.prune_till_block(prune_till_height)
    }

    /// Unwinds every indexed block below `prune_till_height`: the heap head
    /// advances past its bodies, its index entries are erased, and its
    /// per-height record is deleted. No-op for negative heights.
    fn prune_till_block(&self, prune_till_height: i64) -> Result<()> {
        if prune_till_height < 0 {
            return Ok(());
        }
        let mut doomed_keys = Vec::new();
        {
            let mut state = self.state.write().unwrap();
            for item in self
                .meta
                .iter_range(&meta::block_index_key(0), meta::BLOCK_INDEX_END)
            {
                let (key, value) = item?;
                let index: BlockIndex = encoding::deserialize(&value)?;
                // keys order little-endian heights lexicographically, not
                // numerically, so the height check has to be explicit
                if (index.height as i64) >= prune_till_height {
                    continue;
                }
                state.heap.prune_head(index.begin_offset * OFFSET_UNIT)?;
                state.indexer.erase_block(index.height, index.block_hash48);
                for (i, &tx_hash48) in index.tx_hash48_list.iter().enumerate() {
                    state.indexer.erase_tx(
                        id56(index.height, i as u32),
                        tx_hash48,
                        index.tx_pos_list[i],
                    );
                }
                for &hash48 in &index.addr_hashes {
                    state.indexer.erase_addr_logs(hash48, index.height);
                }
                for &hash48 in &index.topic_hashes {
                    state.indexer.erase_topic_logs(hash48, index.height);
                }
                doomed_keys.push(key);
            }
        }
        if doomed_keys.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        for key in &doomed_keys {
            batch.delete(key);
        }
        self.meta.commit(batch)?;
        debug!(
            blocks = doomed_keys.len(),
            till_height = prune_till_height,
            "pruned block index records"
        );
        Ok(())
    }

    /// Per address and topic short hash, the ascending deduplicated indices
    /// of the transactions whose logs mention it.
    #[allow(clippy::type_complexity)]
    fn collect_log_index(
        &self,
        block: &Block,
    ) -> (Vec<u64>, Vec<Vec<u32>>, Vec<u64>, Vec<Vec<u32>>) {
        let mut by_addr: HashMap<u64, Vec<u32>> = HashMap::new();
        let mut by_topic: HashMap<u64, Vec<u32>> = HashMap::new();
        for (i, tx) in block.tx_list.iter().enumerate() {
            for log in &tx.log_list {
                for topic in &log.topics {
                    by_topic
                        .entry(short48(&self.seed, topic))
                        .or_default()
                        .push(i as u32);
                }
                by_addr
                    .entry(short48(&self.seed, &log.address))
                    .or_default()
                    .push(i as u32);
            }
        }
        let (addr_hashes, addr_pos_lists) = split_index(by_addr);
        let (topic_hashes, topic_pos_lists) = split_index(by_topic);
        (addr_hashes, addr_pos_lists, topic_hashes, topic_pos_lists)
    }
}

fn split_index(by_hash: HashMap<u64, Vec<u32>>) -> (Vec<u64>, Vec<Vec<u32>>) {
    let mut hashes = Vec::with_capacity(by_hash.len());
    let mut pos_lists = Vec::with_capacity(by_hash.len());
    for (hash48, mut indices) in by_hash {
        // indices were pushed in ascending transaction order
        indices.dedup();
        hashes.push(hash48);
        pos_lists.push(indices);
    }
    (hashes, pos_lists)
}

fn reload_block(indexer: &mut Indexer, index: &BlockIndex) {
    indexer.add_block(index.height, index.block_hash48, index.begin_offset);
    for (i, &tx_hash48) in index.tx_hash48_list.iter().enumerate() {
        indexer.add_tx(id56(index.height, i as u32), tx_hash48, index.tx_pos_list[i]);
    }
    for (i, &hash48) in index.addr_hashes.iter().enumerate() {
        indexer.add_addr_logs(hash48, index.height, &index.addr_pos_lists[i]);
    }
    for (i, &hash48) in index.topic_hashes.iter().enumerate() {
        indexer.add_topic_logs(hash48, index.height, &index.topic_pos_lists[i]);
    }
}

fn read_payload(state: &Volatile, offset40: i64) -> Vec<u8> {
    state
        .heap
        .read_payload(offset40)
        .unwrap_or_else(|e| fatal("reading heap payload", &e))
}

/// Unrecoverable fault: the database cannot continue with unknown index
/// state, and restart-time recovery is the only safe path forward.
fn fatal(context: &str, err: &dyn Display) -> ! {
    error!(context = context, error = %err, "unrecoverable database fault");
    process::abort();
}
