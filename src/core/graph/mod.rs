//! Anything and everything related to graphs

pub mod community_detection;
pub mod graph_structures;
pub mod knn;
