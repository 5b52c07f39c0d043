use accession::{BackoffConfig, CategoryConfig, GeneratorConfig};
use anyhow::{Context, bail};
use clap::Parser;
use std::path::PathBuf;

/// Runtime configuration for the `accession-cli` binary.
///
/// All values are parsed from CLI arguments or environment variables. An
/// optional JSON file can supply a full [`GeneratorConfig`]; explicit flags
/// then override the simulated category's entry.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "accession-cli",
    version,
    about = "Simulates several instances accessioning objects against shared stores"
)]
pub struct CliArgs {
    /// Category every simulated instance accessions into.
    ///
    /// Environment variable: `CATEGORY`
    #[arg(long, env = "CATEGORY", default_value_t = String::from("samples"))]
    pub category: String,

    /// Number of generator instances sharing the block and record stores.
    ///
    /// Each runs on its own thread with its own instance id, so they only
    /// coordinate through block reservation.
    ///
    /// Environment variable: `NUM_INSTANCES`
    #[arg(long, env = "NUM_INSTANCES", default_value_t = 4)]
    pub num_instances: usize,

    /// Number of ids leased per block.
    ///
    /// Environment variable: `BLOCK_SIZE`
    #[arg(long, env = "BLOCK_SIZE")]
    pub block_size: Option<u64>,

    /// First accession of the category.
    ///
    /// Environment variable: `FIRST_VALUE`
    #[arg(long, env = "FIRST_VALUE")]
    pub first_value: Option<i64>,

    /// Number of distinct objects in the simulated corpus.
    ///
    /// Every instance submits the whole corpus, so most objects are raced
    /// for by several instances.
    ///
    /// Environment variable: `NUM_OBJECTS`
    #[arg(long, env = "NUM_OBJECTS", default_value_t = 10_000)]
    pub num_objects: usize,

    /// Number of objects submitted per `get_or_create` call.
    ///
    /// Environment variable: `BATCH_SIZE`
    #[arg(long, env = "BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    /// Initial backoff delay after a reservation conflict, in milliseconds.
    ///
    /// Environment variable: `BACKOFF_INITIAL_MS`
    #[arg(long, env = "BACKOFF_INITIAL_MS")]
    pub backoff_initial_ms: Option<u64>,

    /// Largest backoff delay before re-evaluating capacity, in milliseconds.
    ///
    /// Environment variable: `BACKOFF_MAX_MS`
    #[arg(long, env = "BACKOFF_MAX_MS")]
    pub backoff_max_ms: Option<u64>,

    /// JSON file holding a full generator configuration.
    ///
    /// Environment variable: `GENERATOR_CONFIG`
    #[arg(long, env = "GENERATOR_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub category: String,
    pub num_instances: usize,
    pub num_objects: usize,
    pub batch_size: usize,
    pub generator: GeneratorConfig,
}

impl TryFrom<CliArgs> for SimulationConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_instances == 0 {
            bail!("NUM_INSTANCES must be greater than 0");
        }
        if args.batch_size == 0 {
            bail!("BATCH_SIZE must be greater than 0");
        }

        let mut generator = match &args.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str::<GeneratorConfig>(&raw)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => GeneratorConfig::default(),
        };

        let category = generator
            .categories
            .entry(args.category.clone())
            .or_insert_with(CategoryConfig::default);
        if let Some(block_size) = args.block_size {
            category.block_size = block_size;
        }
        if let Some(first_value) = args.first_value {
            category.first_value = first_value;
        }

        let BackoffConfig {
            initial_delay_ms,
            max_delay_ms,
        } = &mut generator.backoff;
        if let Some(initial) = args.backoff_initial_ms {
            *initial_delay_ms = initial;
        }
        if let Some(max) = args.backoff_max_ms {
            *max_delay_ms = max;
        }

        generator.validate()?;

        Ok(Self {
            category: args.category,
            num_instances: args.num_instances,
            num_objects: args.num_objects,
            batch_size: args.batch_size,
            generator,
        })
    }
}
