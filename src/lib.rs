//! Quality control of single cell RNA-seq data: doublet detection with
//! cluster-based call refinement and stripped-nucleus detection.
//!
//! Per sample, doublets are simulated from random cell pairs and every
//! cell gets a density-ratio score. Cells are clustered (and sub-clustered)
//! per sample, and sub-clusters with outlying median scores are called as
//! doublets. All samples are then batch corrected with fastMNN, clustered
//! jointly, and clusters enriched for the per-sample calls are promoted to
//! doublets as well. The same pooled clusters are used to flag stripped
//! nuclei via their mitochondrial fraction.

pub mod core;
pub mod error;
pub mod single_cell;
pub mod utils;

pub use crate::error::{QcError, QcResult};
pub use crate::single_cell::pipeline::{QcParams, QcPipeline, QcResults};
