//! Core building blocks that are not specific to the QC workflow: statistics,
//! decompositions, data structures, I/O and graph algorithms.

pub mod base;
pub mod data;
pub mod graph;
