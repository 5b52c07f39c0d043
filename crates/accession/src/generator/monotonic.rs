use crate::{
    Accession, AllocatorState, BackoffConfig, Block, CategoryConfig, GeneratorConfig, Range,
    Result, SaveResponse,
    generator::{Backoff, GeneratorStats, Sleeper, ThreadSleep},
    mutex::{Mutex, MutexGuard},
    store::BlockStore,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// A lock-based accession generator leasing blocks from a shared
/// [`BlockStore`].
///
/// Each instance owns the blocks it reserved and hands out their ids
/// lowest-first without touching the store. The store is only involved when
/// the instance runs out of ids (reservation, the single point of
/// cross-instance coordination) and when a watermark moves.
///
/// All operations serialize through one mutex, so a generator can be shared
/// freely across threads. Concurrency between instances is handled by the
/// store's serializable reservations, retried with exponential backoff.
///
/// # Example
/// ```
/// use accession::{
///     CategoryConfig, GeneratorConfig, InMemoryBlockStore, MonotonicGenerator, SaveResponse,
/// };
///
/// let config = GeneratorConfig::default().with_category(
///     "samples",
///     CategoryConfig { block_size: 10, first_value: 0 },
/// );
/// let store = InMemoryBlockStore::new();
/// let generator = MonotonicGenerator::new("samples", "instance-1", &config, &store).unwrap();
///
/// let ids = generator.allocate(3).unwrap();
/// assert_eq!(ids, vec![0, 1, 2]);
///
/// // 1 collided downstream, 0 and 2 were stored
/// generator.post_save(&SaveResponse::new([0, 2], [1])).unwrap();
/// assert_eq!(generator.allocate(1).unwrap(), vec![1]);
/// ```
pub struct MonotonicGenerator<B, S = ThreadSleep>
where
    B: BlockStore,
    S: Sleeper,
{
    category: String,
    instance_id: String,
    params: CategoryConfig,
    backoff: BackoffConfig,
    block_store: B,
    sleeper: S,
    state: Mutex<AllocatorState>,
    stats: GeneratorStats,
}

impl<B> MonotonicGenerator<B>
where
    B: BlockStore,
{
    /// Creates a generator for `category`, resuming the unfinished blocks
    /// `instance_id` already owns.
    ///
    /// Waits between contended reservations with [`ThreadSleep`].
    ///
    /// # Errors
    /// - [`Error::CategoryNotConfigured`] if `config` has no entry for
    ///   `category`
    /// - [`Error::InvalidConfig`] if `config` does not validate
    /// - [`Error::Store`] if the unfinished blocks cannot be loaded
    ///
    /// [`Error::CategoryNotConfigured`]: crate::Error::CategoryNotConfigured
    /// [`Error::InvalidConfig`]: crate::Error::InvalidConfig
    /// [`Error::Store`]: crate::Error::Store
    pub fn new(
        category: impl Into<String>,
        instance_id: impl Into<String>,
        config: &GeneratorConfig,
        block_store: B,
    ) -> Result<Self> {
        Self::with_sleeper(category, instance_id, config, block_store, ThreadSleep)
    }
}

impl<B, S> MonotonicGenerator<B, S>
where
    B: BlockStore,
    S: Sleeper,
{
    /// Like [`MonotonicGenerator::new`], waiting between contended
    /// reservations with `sleeper`.
    pub fn with_sleeper(
        category: impl Into<String>,
        instance_id: impl Into<String>,
        config: &GeneratorConfig,
        block_store: B,
        sleeper: S,
    ) -> Result<Self> {
        let category = category.into();
        let instance_id = instance_id.into();
        config.validate()?;
        let params = config.category(&category)?.clone();

        let mut state = AllocatorState::new();
        let resumed = block_store.find_unfinished_blocks(&category, &instance_id)?;
        #[cfg(feature = "tracing")]
        tracing::debug!(
            %category,
            %instance_id,
            blocks = resumed.len(),
            "resuming unfinished blocks"
        );
        for block in resumed {
            state.add_block(block);
        }

        Ok(Self {
            category,
            instance_id,
            params,
            backoff: config.backoff.clone(),
            block_store,
            sleeper,
            state: Mutex::new(state),
            stats: GeneratorStats::default(),
        })
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn block_store(&self) -> &B {
        &self.block_store
    }

    pub fn stats(&self) -> &GeneratorStats {
        &self.stats
    }

    /// Hands out `n` ids never issued before by any instance.
    ///
    /// Reserves as many blocks as needed first. Ids come lowest-first, so
    /// previously released ids are reused before fresh ones, and may span
    /// several blocks. Every returned id is pending until passed to
    /// [`Self::commit`], [`Self::release`] or [`Self::post_save`].
    ///
    /// Serialization conflicts during reservation are retried without
    /// limit; wrap the call if a deadline is required.
    ///
    /// # Errors
    /// - [`Error::Store`] on a non-transient block store failure
    /// - `Error::LockPoisoned` if the lock is poisoned (std mutex only)
    ///
    /// [`Error::Store`]: crate::Error::Store
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), fields(category = %self.category)))]
    pub fn allocate(&self, n: u64) -> Result<Vec<Accession>> {
        let mut state = self.lock()?;

        while !state.has_capacity(n) {
            if let Some(block) = self.reserve_block()? {
                state.add_block(block);
            }
        }

        let mut ids = Vec::with_capacity(n as usize);
        while (ids.len() as u64) < n {
            let polled = state.poll_next(n - ids.len() as u64)?;
            ids.extend(polled);
        }
        Ok(ids)
    }

    /// Confirms `ids` as durably stored and persists any watermark that
    /// moved.
    ///
    /// # Errors
    /// - [`Error::NotPending`] if any id is not pending
    /// - [`Error::Store`] if persisting a watermark fails
    ///
    /// [`Error::NotPending`]: crate::Error::NotPending
    /// [`Error::Store`]: crate::Error::Store
    pub fn commit(&self, ids: &[Accession]) -> Result<()> {
        let mut state = self.lock()?;
        let changed = state.commit(ids)?;
        self.persist(&changed)
    }

    /// Returns `ids` to the pool for reissue.
    ///
    /// # Errors
    /// Returns [`Error::NotPending`] if any id is not pending.
    ///
    /// [`Error::NotPending`]: crate::Error::NotPending
    pub fn release(&self, ids: &[Accession]) -> Result<()> {
        self.lock()?.release(ids)
    }

    /// Applies the outcome of a batch save: commits what was saved, then
    /// releases what collided.
    ///
    /// Both happen under one lock acquisition and every id is checked first:
    /// if either list is rejected, nothing is committed, released or
    /// persisted.
    ///
    /// # Errors
    /// - [`Error::NotPending`] if an id of either list is not pending, or
    ///   appears in both
    /// - [`Error::Store`] if persisting a watermark fails
    ///
    /// [`Error::NotPending`]: crate::Error::NotPending
    /// [`Error::Store`]: crate::Error::Store
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all, fields(saved = response.saved().len(), failed = response.save_failed().len())))]
    pub fn post_save(&self, response: &SaveResponse) -> Result<()> {
        let saved: Vec<Accession> = response.saved().iter().copied().collect();
        let failed: Vec<Accession> = response.save_failed().iter().copied().collect();

        let mut state = self.lock()?;
        let changed = state.post_save(&saved, &failed)?;
        self.persist(&changed)
    }

    /// Excludes ids already present downstream from the pool and repairs
    /// watermarks accordingly.
    ///
    /// Call once at startup, before allocating, with the accessions the
    /// record store holds inside [`Self::available_ranges`].
    ///
    /// # Errors
    /// Returns [`Error::Store`] if persisting a watermark fails.
    ///
    /// [`Error::Store`]: crate::Error::Store
    pub fn recover_state(&self, durable_ids: &[Accession]) -> Result<()> {
        let mut state = self.lock()?;
        let changed = state.recover_state(durable_ids);
        self.persist(&changed)
    }

    /// Ids this instance can still hand out without reserving, ascending.
    pub fn available_ranges(&self) -> Result<Vec<Range>> {
        Ok(self.lock()?.available_ranges())
    }

    /// Number of ids handed out and not yet committed or released.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.lock()?.pending_count())
    }

    /// Owned blocks that are not full yet, oldest first.
    pub fn assigned_blocks(&self) -> Result<Vec<Block>> {
        Ok(self.lock()?.assigned_blocks())
    }

    /// Runs one backoff round of reservation attempts.
    ///
    /// Returns `None` when every attempt of the round lost a serialization
    /// race.
    fn reserve_block(&self) -> Result<Option<Block>> {
        let mut backoff = Backoff::new(&self.backoff);
        loop {
            match self.block_store.reserve_next_block(
                &self.category,
                &self.instance_id,
                self.params.block_size,
                self.params.first_value,
            ) {
                Ok(block) => {
                    self.stats.record_reservation();
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        category = %self.category,
                        start = block.start,
                        end = block.end,
                        "reserved block"
                    );
                    return Ok(Some(block));
                }
                Err(e) if e.is_conflict() => {
                    self.stats.record_conflict();
                    match backoff.next_delay() {
                        Some(delay) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(?delay, "reservation conflict, backing off");
                            self.sleeper.sleep(delay);
                        }
                        None => {
                            self.stats.record_exhausted_backoff();
                            #[cfg(feature = "tracing")]
                            tracing::warn!(
                                category = %self.category,
                                "reservation backoff exhausted, retrying"
                            );
                            return Ok(None);
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn persist(&self, changed: &[Block]) -> Result<()> {
        if changed.is_empty() {
            return Ok(());
        }
        self.block_store.persist(changed)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, AllocatorState>> {
        #[cfg(feature = "parking-lot")]
        {
            Ok(self.state.lock())
        }
        #[cfg(not(feature = "parking-lot"))]
        {
            Ok(self.state.lock()?)
        }
    }
}
