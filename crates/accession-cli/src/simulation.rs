//! Several accessioners racing over one corpus against shared stores.

use crate::config::SimulationConfig;
use accession::{Accession, Accessioner, Block, InMemoryBlockStore, InMemoryRecordStore};
use anyhow::{Context, anyhow, bail, ensure};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

/// What one instance observed and how much it had to fight for blocks.
#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub instance_id: String,
    pub observed: HashMap<String, Accession>,
    pub reservations: u64,
    pub conflicts: u64,
    pub exhausted_backoffs: u64,
    pub elapsed: Duration,
}

/// Final state of the shared stores plus every instance's view.
#[derive(Debug)]
pub struct SimulationReport {
    pub num_objects: usize,
    pub first_value: Accession,
    pub instances: Vec<InstanceReport>,
    pub stored: HashMap<String, Accession>,
    pub blocks: Vec<Block>,
    pub insert_attempts: u64,
    pub elapsed: Duration,
}

fn corpus(num_objects: usize) -> Vec<String> {
    (0..num_objects).map(|i| format!("sample-{i:08}")).collect()
}

/// Each instance walks the corpus from a different offset, every other one
/// backwards, so batches overlap partially rather than in lockstep.
fn submission_order(corpus: &[String], instance: usize, num_instances: usize) -> Vec<String> {
    let mut order = corpus.to_vec();
    if !order.is_empty() {
        let offset = instance * order.len() / num_instances;
        order.rotate_left(offset);
    }
    if instance % 2 == 1 {
        order.reverse();
    }
    order
}

pub fn run(config: &SimulationConfig) -> anyhow::Result<SimulationReport> {
    let first_value = config.generator.category(&config.category)?.first_value;
    let blocks = InMemoryBlockStore::new();
    let records = InMemoryRecordStore::<String>::new();
    let corpus = corpus(config.num_objects);
    let started = Instant::now();

    let instances = thread::scope(|scope| -> anyhow::Result<Vec<InstanceReport>> {
        let mut handles = Vec::with_capacity(config.num_instances);
        for instance in 0..config.num_instances {
            let instance_id = format!("instance-{instance}");
            let order = submission_order(&corpus, instance, config.num_instances);
            let (blocks, records) = (&blocks, &records);
            let handle = thread::Builder::new()
                .name(instance_id.clone())
                .spawn_scoped(scope, move || {
                    run_instance(config, instance_id, order, blocks, records)
                })
                .context("failed to spawn instance thread")?;
            handles.push(handle);
        }

        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow!("instance thread panicked"))
                    .and_then(|report| report)
            })
            .collect()
    })?;

    let stored = records
        .records()?
        .into_iter()
        .map(|record| (record.hash, record.accession))
        .collect();

    Ok(SimulationReport {
        num_objects: config.num_objects,
        first_value,
        instances,
        stored,
        blocks: blocks.blocks(&config.category)?,
        insert_attempts: records.insert_attempts(),
        elapsed: started.elapsed(),
    })
}

fn run_instance(
    config: &SimulationConfig,
    instance_id: String,
    order: Vec<String>,
    blocks: &InMemoryBlockStore,
    records: &InMemoryRecordStore<String>,
) -> anyhow::Result<InstanceReport> {
    let started = Instant::now();
    let accessioner = Accessioner::new(
        config.category.as_str(),
        instance_id.as_str(),
        &config.generator,
        blocks,
        records,
        String::clone,
    )?;

    let mut observed = HashMap::with_capacity(order.len());
    for batch in order.chunks(config.batch_size) {
        let created = accessioner
            .get_or_create(batch.iter().cloned())
            .with_context(|| format!("{instance_id} failed to accession a batch"))?;
        observed.extend(created.into_iter().map(|r| (r.hash, r.accession)));
    }

    let stats = accessioner.generator().stats();
    #[cfg(feature = "tracing")]
    tracing::info!(
        instance = %instance_id,
        reservations = stats.reservations(),
        conflicts = stats.conflicts(),
        "instance finished"
    );

    Ok(InstanceReport {
        instance_id,
        observed,
        reservations: stats.reservations(),
        conflicts: stats.conflicts(),
        exhausted_backoffs: stats.exhausted_backoffs(),
        elapsed: started.elapsed(),
    })
}

impl SimulationReport {
    /// Checks the run left the stores consistent.
    ///
    /// # Errors
    /// Describes the first violated property.
    pub fn verify(&self) -> anyhow::Result<()> {
        ensure!(
            self.stored.len() == self.num_objects,
            "expected {} stored objects, found {}",
            self.num_objects,
            self.stored.len()
        );

        let distinct: BTreeSet<Accession> = self.stored.values().copied().collect();
        ensure!(
            distinct.len() == self.stored.len(),
            "{} accessions were issued to more than one object",
            self.stored.len() - distinct.len()
        );

        for instance in &self.instances {
            for (hash, accession) in &instance.observed {
                match self.stored.get(hash) {
                    Some(stored) if stored == accession => {}
                    Some(stored) => bail!(
                        "{} saw {hash} as {accession} but the store holds {stored}",
                        instance.instance_id
                    ),
                    None => bail!("{} saw {hash} but it was never stored", instance.instance_id),
                }
            }
        }

        let mut next = Some(self.first_value);
        for block in &self.blocks {
            ensure!(
                Some(block.start) == next,
                "block [{}, {}] leaves a gap or overlap after {next:?}",
                block.start,
                block.end
            );
            next = block.next_start();
        }

        for accession in &distinct {
            ensure!(
                self.blocks.iter().any(|b| b.range().contains(*accession)),
                "accession {accession} lies outside every reserved block"
            );
        }

        for block in &self.blocks {
            if block.last_committed < block.start {
                continue;
            }
            let covered = distinct.range(block.start..=block.last_committed).count() as u64;
            let expected = block.last_committed.abs_diff(block.start) + 1;
            ensure!(
                covered == expected,
                "watermark {} of block [{}, {}] covers ids that were never stored",
                block.last_committed,
                block.start,
                block.end
            );
        }

        Ok(())
    }

    fn conflicts(&self) -> u64 {
        self.instances.iter().map(|i| i.conflicts).sum()
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "accessioned {} objects with {} instances in {:?}",
            self.stored.len(),
            self.instances.len(),
            self.elapsed
        )?;
        writeln!(
            f,
            "blocks reserved: {}, reservation conflicts: {}, insert attempts: {}",
            self.blocks.len(),
            self.conflicts(),
            self.insert_attempts
        )?;
        for instance in &self.instances {
            writeln!(
                f,
                "  {:<12} observed={:<8} reservations={:<6} conflicts={:<6} exhausted={:<4} {:?}",
                instance.instance_id,
                instance.observed.len(),
                instance.reservations,
                instance.conflicts,
                instance.exhausted_backoffs,
                instance.elapsed
            )?;
        }
        Ok(())
    }
}
