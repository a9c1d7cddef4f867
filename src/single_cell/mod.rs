//! Contains the single cell QC functionality. There are dependencies on
//! other parts of the crate, specifically around the generation of kNN
//! graphs, sparse matrix methods, etc.

pub mod hvg;
pub mod methods;
pub mod pipeline;
pub mod processing;
pub mod sc_knn_snn;
pub mod validation;
