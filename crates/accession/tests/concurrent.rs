use accession::{
    Accession, Accessioner, BackoffConfig, CategoryConfig, GeneratorConfig, InMemoryBlockStore,
    InMemoryRecordStore, MonotonicGenerator, ThreadYield,
};
use std::collections::HashSet;
use std::sync::Barrier;
use std::thread::scope;

fn config(block_size: u64) -> GeneratorConfig {
    GeneratorConfig::default()
        .with_category(
            "variants",
            CategoryConfig {
                block_size,
                first_value: 1,
            },
        )
        .with_backoff(BackoffConfig {
            initial_delay_ms: 1,
            max_delay_ms: 8,
        })
}

#[test]
fn instances_sharing_a_category_never_overlap() {
    let store = InMemoryBlockStore::new();
    let config = config(5);
    let instances = num_cpus::get().clamp(2, 6);
    let barrier = Barrier::new(instances);

    let issued: Vec<Vec<Accession>> = scope(|s| {
        let handles: Vec<_> = (0..instances)
            .map(|i| {
                let (store, config, barrier) = (&store, &config, &barrier);
                s.spawn(move || {
                    let generator = MonotonicGenerator::with_sleeper(
                        "variants",
                        format!("instance-{i}"),
                        config,
                        store,
                        ThreadYield,
                    )
                    .unwrap();
                    barrier.wait();

                    let mut issued = Vec::new();
                    for round in 0..200u64 {
                        let ids = generator.allocate(1 + round % 3).unwrap();
                        generator.commit(&ids).unwrap();
                        issued.extend(ids);
                    }
                    issued
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut all = HashSet::new();
    for id in issued.iter().flatten() {
        assert!(all.insert(*id), "{id} issued by two instances");
    }

    let blocks = store.blocks("variants").unwrap();
    let mut expected_start = 1;
    for block in &blocks {
        assert_eq!(block.start, expected_start, "gap or overlap before {block:?}");
        expected_start = block.end + 1;
    }

    // everything committed folds each block's watermark past every issued id
    for id in &all {
        let owner = blocks.iter().find(|b| b.range().contains(*id)).unwrap();
        assert!(owner.last_committed >= *id, "{id} not covered by {owner:?}");
    }
}

#[test]
fn racing_accessioners_agree_on_shared_objects() {
    let blocks = InMemoryBlockStore::new();
    let records = InMemoryRecordStore::new();
    let config = config(16);
    let instances = 4;
    let objects: Vec<String> = (0..64).map(|i| format!("object-{i}")).collect();
    let barrier = Barrier::new(instances);

    let results: Vec<Vec<(String, Accession)>> = scope(|s| {
        let handles: Vec<_> = (0..instances)
            .map(|i| {
                let (blocks, records, config, barrier, objects) =
                    (&blocks, &records, &config, &barrier, &objects);
                s.spawn(move || {
                    let accessioner = Accessioner::new(
                        "variants",
                        format!("instance-{i}"),
                        config,
                        blocks,
                        records,
                        |o: &String| o.clone(),
                    )
                    .unwrap();
                    barrier.wait();

                    let mut seen = Vec::new();
                    // each instance walks the objects in its own order and batch size
                    for chunk in objects.chunks(3 + i) {
                        let mut chunk = chunk.to_vec();
                        if i % 2 == 1 {
                            chunk.reverse();
                        }
                        for record in accessioner.get_or_create(chunk).unwrap() {
                            seen.push((record.hash, record.accession));
                        }
                    }
                    assert_eq!(accessioner.generator().pending_count().unwrap(), 0);
                    seen
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let stored = records.records().unwrap();
    assert_eq!(stored.len(), objects.len());
    let canonical: std::collections::HashMap<_, _> = stored
        .iter()
        .map(|r| (r.hash.clone(), r.accession))
        .collect();
    for (hash, accession) in results.iter().flatten() {
        assert_eq!(canonical[hash], *accession, "{hash} resolved inconsistently");
    }
}
