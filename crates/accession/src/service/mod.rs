//! Get-or-create accessioning on top of the generator and commit pipeline.


use crate::{
    Accession, CommitPipeline, GeneratorConfig, MonotonicGenerator, Range, Result, SaveResponse,
    commit::AccessionRecord,
    generator::{Sleeper, ThreadSleep},
    store::{BlockStore, RecordStore},
};
use core::marker::PhantomData;
use std::collections::{HashMap, HashSet};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Assigns accessions to objects, reusing the accession of any object whose
/// hash is already stored.
///
/// `H` maps an object to its content hash. Objects with equal hashes are the
/// same logical object and always resolve to the same accession, even when
/// several instances race to create it.
///
/// # Example
/// ```
/// use accession::{
///     Accessioner, CategoryConfig, GeneratorConfig, InMemoryBlockStore, InMemoryRecordStore,
/// };
///
/// let config = GeneratorConfig::default().with_category(
///     "samples",
///     CategoryConfig { block_size: 100, first_value: 1 },
/// );
/// let blocks = InMemoryBlockStore::new();
/// let records = InMemoryRecordStore::new();
/// let accessioner = Accessioner::new(
///     "samples", "instance-1", &config, &blocks, &records, |s: &String| s.to_uppercase(),
/// )
/// .unwrap();
///
/// let first = accessioner.get_or_create(vec!["a".to_string(), "b".to_string()]).unwrap();
/// let again = accessioner.get_or_create(vec!["B".to_string()]).unwrap();
/// assert_eq!(first[0].accession, 1);
/// assert_eq!(again[0].accession, first[1].accession);
/// ```
pub struct Accessioner<M, B, R, H, S = ThreadSleep>
where
    B: BlockStore,
    S: Sleeper,
{
    generator: MonotonicGenerator<B, S>,
    pipeline: CommitPipeline<R>,
    hasher: H,
    _payload: PhantomData<fn() -> M>,
}

impl<M, B, R, H> Accessioner<M, B, R, H>
where
    B: BlockStore,
    R: RecordStore<M>,
    H: Fn(&M) -> String,
{
    /// Builds a generator for `category` and recovers it against
    /// `record_store`.
    ///
    /// # Errors
    /// Everything [`MonotonicGenerator::new`] and [`Self::from_generator`]
    /// can return.
    pub fn new(
        category: impl Into<String>,
        instance_id: impl Into<String>,
        config: &GeneratorConfig,
        block_store: B,
        record_store: R,
        hasher: H,
    ) -> Result<Self> {
        let generator = MonotonicGenerator::new(category, instance_id, config, block_store)?;
        Self::from_generator(generator, record_store, hasher)
    }
}

impl<M, B, R, H, S> Accessioner<M, B, R, H, S>
where
    B: BlockStore,
    R: RecordStore<M>,
    H: Fn(&M) -> String,
    S: Sleeper,
{
    /// Wraps an existing generator after recovering it.
    ///
    /// Accessions the record store already holds inside the generator's
    /// available ranges are excluded from issue, covering a crash between
    /// storing records and persisting their watermark.
    ///
    /// # Errors
    /// Returns [`Error::Store`] if the recovery query or the watermark update
    /// fails.
    ///
    /// [`Error::Store`]: crate::Error::Store
    pub fn from_generator(
        generator: MonotonicGenerator<B, S>,
        record_store: R,
        hasher: H,
    ) -> Result<Self> {
        let ranges = generator.available_ranges()?;
        if !ranges.is_empty() {
            let durable = record_store.find_accessions_in_ranges(&ranges)?;
            #[cfg(feature = "tracing")]
            tracing::debug!(
                category = generator.category(),
                durable = durable.len(),
                "recovering generator against record store"
            );
            generator.recover_state(&durable)?;
        }

        Ok(Self {
            generator,
            pipeline: CommitPipeline::new(record_store),
            hasher,
            _payload: PhantomData,
        })
    }

    pub fn generator(&self) -> &MonotonicGenerator<B, S> {
        &self.generator
    }

    pub fn record_store(&self) -> &R {
        self.pipeline.store()
    }

    /// Looks up stored records by hash.
    pub fn get(&self, hashes: &[&str]) -> Result<Vec<AccessionRecord<M>>> {
        Ok(self.record_store().find_by_hashes(hashes)?)
    }

    /// Returns one record per distinct object hash, in first-seen order,
    /// creating accessions for hashes not stored yet.
    ///
    /// When another writer stores the same hash between the lookup and the
    /// insert, its record is returned and the id allocated here is released.
    ///
    /// # Errors
    /// - [`Error::IntegrityFault`] if a colliding hash has no stored record
    /// - [`Error::Store`] on record or block store failures; ids of the
    ///   failed batch are reconciled against the record store when possible
    /// - [`Error::NotPending`] if the generator and store disagree
    ///
    /// [`Error::IntegrityFault`]: crate::Error::IntegrityFault
    /// [`Error::Store`]: crate::Error::Store
    /// [`Error::NotPending`]: crate::Error::NotPending
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all, fields(category = self.generator.category())))]
    pub fn get_or_create<I>(&self, objects: I) -> Result<Vec<AccessionRecord<M>>>
    where
        I: IntoIterator<Item = M>,
    {
        let mut order: Vec<String> = Vec::new();
        let mut unique: HashMap<String, M> = HashMap::new();
        for object in objects {
            let hash = (self.hasher)(&object);
            if !unique.contains_key(&hash) {
                order.push(hash.clone());
                unique.insert(hash, object);
            }
        }
        if order.is_empty() {
            return Ok(Vec::new());
        }

        let hashes: Vec<&str> = order.iter().map(String::as_str).collect();
        let mut resolved: HashMap<String, AccessionRecord<M>> = self
            .record_store()
            .find_by_hashes(&hashes)?
            .into_iter()
            .map(|record| (record.hash.clone(), record))
            .collect();

        let fresh: Vec<(String, M)> = order
            .iter()
            .filter(|hash| !resolved.contains_key(*hash))
            .filter_map(|hash| unique.remove_entry(hash))
            .collect();

        if !fresh.is_empty() {
            let ids = self.generator.allocate(fresh.len() as u64)?;
            let batch: Vec<AccessionRecord<M>> = fresh
                .into_iter()
                .zip(ids)
                .map(|((hash, payload), id)| AccessionRecord::new(id, hash, payload))
                .collect();

            let response = match self.pipeline.save(&batch) {
                Ok(response) => response,
                Err(e) => {
                    self.reconcile_aborted(&batch);
                    return Err(e);
                }
            };
            self.generator.post_save(&response)?;
            let existing = self.pipeline.resolve_failures(&batch, &response)?;

            for record in batch {
                if response.saved().contains(&record.accession) {
                    resolved.insert(record.hash.clone(), record);
                }
            }
            for record in existing {
                resolved.insert(record.hash.clone(), record);
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|hash| resolved.remove(&hash))
            .collect())
    }

    /// Settles the ids of a batch whose save failed midway.
    ///
    /// Ids the record store holds are committed, the rest released. If the
    /// store cannot be queried the ids stay pending; startup recovery will
    /// settle them.
    fn reconcile_aborted(&self, batch: &[AccessionRecord<M>]) {
        let ids: Vec<Accession> = batch.iter().map(|r| r.accession).collect();
        let ranges = Range::coalesce(ids.iter().copied());
        let Ok(stored) = self.record_store().find_accessions_in_ranges(&ranges) else {
            #[cfg(feature = "tracing")]
            tracing::warn!(count = ids.len(), "could not reconcile aborted batch");
            return;
        };

        let stored: HashSet<Accession> = stored.into_iter().collect();
        let response = SaveResponse::new(
            ids.iter().copied().filter(|id| stored.contains(id)),
            ids.iter().copied().filter(|id| !stored.contains(id)),
        );
        if let Err(_e) = self.generator.post_save(&response) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_e, "could not settle aborted batch");
        }
    }
}
