#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod allocator;
mod block;
mod commit;
mod config;
mod error;
mod generator;
mod mutex;
mod range;
mod service;
pub mod store;

pub use crate::allocator::*;
pub use crate::block::*;
pub use crate::commit::*;
pub use crate::config::*;
pub use crate::error::*;
pub use crate::generator::*;
pub use crate::range::*;
pub use crate::service::*;
pub use crate::store::{
    BlockStore, InMemoryBlockStore, InMemoryRecordStore, RecordStore, StoreError,
};

/// A permanent identifier handed out by a generator.
///
/// Signed so a block starting at zero can carry a watermark of `-1`.
pub type Accession = i64;
