//! Specific named methods of the QC workflow are implemented here. This
//! ranges from the doublet simulation and scoring, over the clustering
//! layers and outlier tests, to batch correction and the stripped nucleus
//! calls.

pub mod call_refinement;
pub mod clustering;
pub mod doublet_detection;
pub mod fast_mnn;
pub mod outlier_clusters;
pub mod stripped_nuclei;
