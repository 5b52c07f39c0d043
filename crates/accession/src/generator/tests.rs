use crate::{
    Accession, BackoffConfig, Block, CategoryConfig, Error, GeneratorConfig, InMemoryBlockStore,
    MonotonicGenerator, Range, SaveResponse, Sleeper, ThreadYield,
    store::{BlockStore, StoreError},
};
use core::time::Duration;
use std::collections::HashSet;
use std::sync::Mutex;
use std::thread::scope;

fn config(block_size: u64) -> GeneratorConfig {
    GeneratorConfig::default()
        .with_category(
            "c",
            CategoryConfig {
                block_size,
                first_value: 0,
            },
        )
        .with_backoff(BackoffConfig {
            initial_delay_ms: 1,
            max_delay_ms: 4,
        })
}

fn generator<'a>(
    store: &'a InMemoryBlockStore,
    instance: &str,
    block_size: u64,
) -> MonotonicGenerator<&'a InMemoryBlockStore> {
    MonotonicGenerator::new("c", instance, &config(block_size), store).unwrap()
}

fn stored_watermarks(store: &InMemoryBlockStore) -> Vec<Accession> {
    store
        .blocks("c")
        .unwrap()
        .iter()
        .map(|b| b.last_committed)
        .collect()
}

#[derive(Default)]
struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, dur: Duration) {
        self.delays.lock().unwrap().push(dur);
    }
}

/// Loses the first `conflicts` reservations, then behaves like `inner`.
struct ContendedStore {
    inner: InMemoryBlockStore,
    conflicts: Mutex<usize>,
    failure: Option<StoreError>,
}

impl ContendedStore {
    fn new(conflicts: usize) -> Self {
        Self {
            inner: InMemoryBlockStore::new(),
            conflicts: Mutex::new(conflicts),
            failure: None,
        }
    }

    fn failing(failure: StoreError) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(0)
        }
    }
}

impl BlockStore for ContendedStore {
    fn reserve_next_block(
        &self,
        category: &str,
        instance_id: &str,
        size: u64,
        first_value: Accession,
    ) -> Result<Block, StoreError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let mut remaining = self.conflicts.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(StoreError::SerializationConflict {
                category: category.to_owned(),
            });
        }
        self.inner
            .reserve_next_block(category, instance_id, size, first_value)
    }

    fn find_unfinished_blocks(
        &self,
        category: &str,
        instance_id: &str,
    ) -> Result<Vec<Block>, StoreError> {
        self.inner.find_unfinished_blocks(category, instance_id)
    }

    fn persist(&self, blocks: &[Block]) -> Result<(), StoreError> {
        self.inner.persist(blocks)
    }
}

#[test]
fn unknown_category_fails_construction() {
    let store = InMemoryBlockStore::new();
    let result = MonotonicGenerator::new("other", "i1", &config(10), &store);
    assert!(matches!(
        result,
        Err(Error::CategoryNotConfigured { category }) if category == "other"
    ));
}

#[test]
fn allocate_reserves_lazily() {
    let store = InMemoryBlockStore::new();
    let generator = generator(&store, "i1", 10);
    assert!(generator.allocate(0).unwrap().is_empty());
    assert!(store.blocks("c").unwrap().is_empty());

    assert_eq!(generator.allocate(3).unwrap(), vec![0, 1, 2]);
    assert_eq!(generator.allocate(2).unwrap(), vec![3, 4]);
    assert_eq!(generator.stats().reservations(), 1);
    assert_eq!(generator.pending_count().unwrap(), 5);
}

#[test]
fn allocate_spans_several_blocks() {
    let store = InMemoryBlockStore::new();
    let generator = generator(&store, "i1", 4);
    let ids = generator.allocate(10).unwrap();
    assert_eq!(ids, (0..10).collect::<Vec<_>>());
    assert_eq!(store.blocks("c").unwrap().len(), 3);
    assert_eq!(generator.available_ranges().unwrap(), vec![Range::new(10, 11)]);
}

#[test]
fn released_ids_come_back_before_fresh_ones() {
    let store = InMemoryBlockStore::new();
    let generator = generator(&store, "i1", 10);
    assert_eq!(generator.allocate(10).unwrap(), (0..10).collect::<Vec<_>>());

    generator.release(&[0, 1]).unwrap();
    assert_eq!(generator.allocate(3).unwrap(), vec![0, 1, 10]);
}

#[test]
fn commit_persists_watermark_only_over_contiguous_ids() {
    let store = InMemoryBlockStore::new();
    let generator = generator(&store, "i1", 10);
    generator.allocate(4).unwrap();

    generator.commit(&[2, 3]).unwrap();
    assert_eq!(stored_watermarks(&store), vec![-1]);

    generator.commit(&[0, 1]).unwrap();
    assert_eq!(stored_watermarks(&store), vec![3]);
}

#[test]
fn commit_of_unissued_id_is_rejected() {
    let store = InMemoryBlockStore::new();
    let generator = generator(&store, "i1", 10);
    generator.allocate(2).unwrap();
    assert_eq!(generator.commit(&[7]), Err(Error::NotPending { id: 7 }));
    assert_eq!(generator.release(&[7]), Err(Error::NotPending { id: 7 }));
}

#[test]
fn post_save_commits_then_releases() {
    let store = InMemoryBlockStore::new();
    let generator = generator(&store, "i1", 10);
    generator.allocate(4).unwrap();

    generator
        .post_save(&SaveResponse::new([0, 1, 3], [2]))
        .unwrap();
    assert_eq!(stored_watermarks(&store), vec![1]);
    assert_eq!(generator.pending_count().unwrap(), 0);
    assert_eq!(generator.allocate(1).unwrap(), vec![2]);

    generator.commit(&[2]).unwrap();
    assert_eq!(stored_watermarks(&store), vec![3]);
}

#[test]
fn rejected_post_save_leaves_memory_and_store_in_step() {
    let store = InMemoryBlockStore::new();
    let generator = generator(&store, "i1", 10);
    generator.allocate(4).unwrap();

    assert_eq!(
        generator.post_save(&SaveResponse::new([0, 1], [9])),
        Err(Error::NotPending { id: 9 })
    );
    assert_eq!(generator.pending_count().unwrap(), 4);
    assert_eq!(generator.assigned_blocks().unwrap()[0].last_committed, -1);
    assert_eq!(stored_watermarks(&store), vec![-1]);

    generator.post_save(&SaveResponse::new([0, 1], [2, 3])).unwrap();
    assert_eq!(generator.assigned_blocks().unwrap()[0].last_committed, 1);
    assert_eq!(stored_watermarks(&store), vec![1]);
}

#[test]
fn full_blocks_are_retired_and_persisted() {
    let store = InMemoryBlockStore::new();
    let generator = generator(&store, "i1", 3);
    let ids = generator.allocate(5).unwrap();
    generator.commit(&ids).unwrap();

    assert_eq!(stored_watermarks(&store), vec![2, 4]);
    let assigned = generator.assigned_blocks().unwrap();
    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].start, 3);
    assert_eq!(store.find_unfinished_blocks("c", "i1").unwrap().len(), 1);
}

#[test]
fn restart_resumes_owned_blocks_above_watermark() {
    let store = InMemoryBlockStore::new();
    {
        let first = generator(&store, "i1", 10);
        first.allocate(5).unwrap();
        first.commit(&[0, 1, 2]).unwrap();
        // 3 and 4 were never stored; the process dies here
    }

    let restarted = generator(&store, "i1", 10);
    assert_eq!(restarted.available_ranges().unwrap(), vec![Range::new(3, 9)]);
    assert_eq!(restarted.allocate(2).unwrap(), vec![3, 4]);
    assert_eq!(restarted.stats().reservations(), 0);
}

#[test]
fn recovery_skips_ids_stored_before_a_lost_watermark_write() {
    let store = InMemoryBlockStore::new();
    {
        let first = generator(&store, "i1", 10);
        first.allocate(5).unwrap();
        // records 0..=4 reach the record store, the commit never happens
    }

    let restarted = generator(&store, "i1", 10);
    restarted.recover_state(&[0, 1, 2, 3, 4]).unwrap();
    assert_eq!(stored_watermarks(&store), vec![4]);
    assert_eq!(restarted.allocate(1).unwrap(), vec![5]);
}

#[test]
fn other_instances_never_resume_foreign_blocks() {
    let store = InMemoryBlockStore::new();
    let first = generator(&store, "i1", 10);
    first.allocate(1).unwrap();

    let second = generator(&store, "i2", 10);
    assert!(second.available_ranges().unwrap().is_empty());
    assert_eq!(second.allocate(2).unwrap(), vec![10, 11]);
}

#[test]
fn conflicts_back_off_then_retry_after_exhaustion() {
    let store = ContendedStore::new(5);
    let sleeper = RecordingSleeper::default();
    let generator =
        MonotonicGenerator::with_sleeper("c", "i1", &config(10), &store, &sleeper).unwrap();

    assert_eq!(generator.allocate(2).unwrap(), vec![0, 1]);

    let stats = generator.stats();
    assert_eq!(stats.conflicts(), 5);
    assert_eq!(stats.exhausted_backoffs(), 1);
    assert_eq!(stats.reservations(), 1);

    // 1, 2, 4 ms, window exhausted, then a fresh round starting at 1 ms
    let delays = sleeper.delays.lock().unwrap();
    assert_eq!(delays.len(), 4);
    for (delay, base_ms) in delays.iter().zip([1, 2, 4, 1]) {
        let base = Duration::from_millis(base_ms);
        assert!(
            *delay >= base && *delay < base + base / 2,
            "{delay:?} outside the jitter window of {base:?}"
        );
    }
}

#[test]
fn non_transient_reservation_failures_surface() {
    let failure = StoreError::Backend("disk full".into());
    let store = ContendedStore::failing(failure.clone());
    let generator =
        MonotonicGenerator::with_sleeper("c", "i1", &config(10), &store, ThreadYield).unwrap();
    assert_eq!(generator.allocate(1), Err(Error::Store(failure)));
}

#[test]
fn exhausted_category_surfaces_instead_of_overflowing() {
    let config = GeneratorConfig::default().with_category(
        "c",
        CategoryConfig {
            block_size: 10,
            first_value: Accession::MAX - 9,
        },
    );
    let store = InMemoryBlockStore::new();
    let generator = MonotonicGenerator::new("c", "i1", &config, &store).unwrap();

    let ids = generator.allocate(10).unwrap();
    assert_eq!(ids.last(), Some(&Accession::MAX));
    generator.commit(&ids).unwrap();
    assert_eq!(stored_watermarks(&store), vec![Accession::MAX]);

    assert_eq!(
        generator.allocate(1),
        Err(Error::Store(StoreError::CategoryExhausted {
            category: "c".into(),
            size: 10,
        }))
    );
    assert_eq!(generator.stats().conflicts(), 0);
}

#[test]
fn shared_generator_never_hands_out_duplicates() {
    let store = InMemoryBlockStore::new();
    let generator = generator(&store, "i1", 7);
    let threads = num_cpus::get().clamp(2, 8);

    let issued: Vec<Vec<Accession>> = scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                s.spawn(|| {
                    let mut mine = Vec::new();
                    for round in 0..50u64 {
                        let ids = generator.allocate(1 + round % 4).unwrap();
                        let (keep, give_back) = ids.split_at(ids.len() / 2);
                        generator.release(give_back).unwrap();
                        generator.commit(keep).unwrap();
                        mine.extend_from_slice(keep);
                    }
                    mine
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen = HashSet::new();
    for id in issued.iter().flatten() {
        assert!(seen.insert(*id), "{id} committed twice");
    }
    assert_eq!(generator.pending_count().unwrap(), 0);
}
