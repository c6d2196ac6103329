//! snapdump-core — shared types: the diff-v1 wire format, image feature
//! flags, and configuration. All other snapdump crates depend on this one.

pub mod config;
pub mod diff;
pub mod features;

pub use diff::{DiffError, DiffReader, DiffRecord, DiffWriter, DIFF_MAGIC};
pub use features::{default_features, FeatureSet, ImageFeature};
