use crate::{
    Accession, Block, Range,
    commit::AccessionRecord,
    mutex::{Mutex, MutexGuard},
    store::{BlockStore, RecordStore, StoreError},
};
use portable_atomic::{AtomicU64, Ordering};
use std::collections::{BTreeMap, HashMap, HashSet};

#[cfg(feature = "tracing")]
use tracing::instrument;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    #[cfg(feature = "parking-lot")]
    {
        Ok(mutex.lock())
    }
    #[cfg(not(feature = "parking-lot"))]
    {
        mutex
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))
    }
}

#[derive(Default)]
struct CategoryBlocks {
    blocks: BTreeMap<Accession, Block>,
    // Bumped by every append; a reservation whose read version is stale lost
    // the race for the tail.
    version: u64,
}

/// A thread-safe, process-local [`BlockStore`].
///
/// Reservations run as two steps: read the category tail, then append the
/// new block only if no other append happened in between. A concurrent
/// append surfaces as [`StoreError::SerializationConflict`], which is what a
/// database running the same transaction at `SERIALIZABLE` reports. Share one
/// store across generators (e.g. behind an [`Arc`]) to simulate several
/// instances leasing from the same category.
///
/// [`Arc`]: std::sync::Arc
#[derive(Default)]
pub struct InMemoryBlockStore {
    categories: Mutex<HashMap<String, CategoryBlocks>>,
}

impl InMemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every block of `category`, ordered by start.
    pub fn blocks(&self, category: &str) -> Result<Vec<Block>, StoreError> {
        let categories = lock(&self.categories)?;
        Ok(categories
            .get(category)
            .map(|c| c.blocks.values().cloned().collect())
            .unwrap_or_default())
    }
}

impl BlockStore for InMemoryBlockStore {
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    fn reserve_next_block(
        &self,
        category: &str,
        instance_id: &str,
        size: u64,
        first_value: Accession,
    ) -> Result<Block, StoreError> {
        if size == 0 {
            return Err(StoreError::Backend("block size must be positive".into()));
        }

        let (next_start, read_version) = {
            let categories = lock(&self.categories)?;
            categories.get(category).map_or((Some(first_value), 0), |c| {
                (
                    c.blocks
                        .last_key_value()
                        .map_or(Some(first_value), |(_, b)| b.next_start()),
                    c.version,
                )
            })
        };

        // Between the read and the write another instance may append.
        std::thread::yield_now();

        let block = next_start
            .and_then(|start| Block::try_new(category, instance_id, start, size))
            .ok_or_else(|| StoreError::CategoryExhausted {
                category: category.to_owned(),
                size,
            })?;

        let mut categories = lock(&self.categories)?;
        let entry = categories.entry(category.to_owned()).or_default();
        if entry.version != read_version {
            return Err(StoreError::SerializationConflict {
                category: category.to_owned(),
            });
        }
        if entry.blocks.contains_key(&block.start) {
            return Err(StoreError::DuplicateKey {
                key: format!("({category}, {})", block.start),
            });
        }
        entry.blocks.insert(block.start, block.clone());
        entry.version += 1;
        Ok(block)
    }

    fn find_unfinished_blocks(
        &self,
        category: &str,
        instance_id: &str,
    ) -> Result<Vec<Block>, StoreError> {
        let categories = lock(&self.categories)?;
        Ok(categories
            .get(category)
            .map(|c| {
                c.blocks
                    .values()
                    .filter(|b| b.instance_id == instance_id && !b.is_full())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn persist(&self, blocks: &[Block]) -> Result<(), StoreError> {
        let mut categories = lock(&self.categories)?;

        for block in blocks {
            let stored = categories
                .get(&block.category)
                .and_then(|c| c.blocks.get(&block.start));
            match stored {
                Some(stored) if stored.end == block.end && stored.instance_id == block.instance_id => {}
                _ => {
                    return Err(StoreError::UnknownBlock {
                        category: block.category.clone(),
                        start: block.start,
                    });
                }
            }
        }

        for block in blocks {
            if let Some(stored) = categories
                .get_mut(&block.category)
                .and_then(|c| c.blocks.get_mut(&block.start))
            {
                // Watermarks never move backwards.
                stored.last_committed = stored.last_committed.max(block.last_committed);
            }
        }
        Ok(())
    }
}

struct Records<M> {
    by_hash: HashMap<String, AccessionRecord<M>>,
    hash_by_accession: BTreeMap<Accession, String>,
}

/// A thread-safe, process-local [`RecordStore`].
///
/// Both the hash and the accession are unique. [`insert_all`] validates the
/// whole slice before writing, so a rejected insert leaves nothing behind.
///
/// [`insert_all`]: RecordStore::insert_all
pub struct InMemoryRecordStore<M> {
    records: Mutex<Records<M>>,
    insert_attempts: AtomicU64,
}

impl<M> Default for InMemoryRecordStore<M> {
    fn default() -> Self {
        Self {
            records: Mutex::new(Records {
                by_hash: HashMap::new(),
                hash_by_accession: BTreeMap::new(),
            }),
            insert_attempts: AtomicU64::new(0),
        }
    }
}

impl<M: Clone> InMemoryRecordStore<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of [`RecordStore::insert_all`] calls so far, successful or not.
    pub fn insert_attempts(&self) -> u64 {
        self.insert_attempts.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(lock(&self.records)?.by_hash.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Returns every stored record, ordered by accession.
    pub fn records(&self) -> Result<Vec<AccessionRecord<M>>, StoreError> {
        let records = lock(&self.records)?;
        Ok(records
            .hash_by_accession
            .values()
            .filter_map(|hash| records.by_hash.get(hash).cloned())
            .collect())
    }
}

impl<M: Clone> RecordStore<M> for InMemoryRecordStore<M> {
    fn insert_all(&self, batch: &[AccessionRecord<M>]) -> Result<(), StoreError> {
        self.insert_attempts.fetch_add(1, Ordering::Relaxed);
        let mut records = lock(&self.records)?;

        let mut hashes = HashSet::with_capacity(batch.len());
        let mut accessions = HashSet::with_capacity(batch.len());
        for record in batch {
            if records.by_hash.contains_key(&record.hash) || !hashes.insert(record.hash.as_str()) {
                return Err(StoreError::DuplicateKey {
                    key: format!("hash {}", record.hash),
                });
            }
            if records.hash_by_accession.contains_key(&record.accession)
                || !accessions.insert(record.accession)
            {
                return Err(StoreError::DuplicateKey {
                    key: format!("accession {}", record.accession),
                });
            }
        }

        for record in batch {
            records
                .hash_by_accession
                .insert(record.accession, record.hash.clone());
            records.by_hash.insert(record.hash.clone(), record.clone());
        }
        Ok(())
    }

    fn find_by_hashes(&self, hashes: &[&str]) -> Result<Vec<AccessionRecord<M>>, StoreError> {
        let records = lock(&self.records)?;
        Ok(hashes
            .iter()
            .filter_map(|hash| records.by_hash.get(*hash).cloned())
            .collect())
    }

    fn find_accessions_in_ranges(&self, ranges: &[Range]) -> Result<Vec<Accession>, StoreError> {
        let records = lock(&self.records)?;
        let by_accession = &records.hash_by_accession;
        Ok(ranges
            .iter()
            .flat_map(move |range| {
                by_accession
                    .range(range.start()..=range.end())
                    .map(|(accession, _)| *accession)
            })
            .collect())
    }
}
