//! Module containing key statistic functions: robust location/spread
//! estimates, multiple testing correction, distribution tails, loess and
//! PCA.

pub mod loess;
pub mod pca_svd;
pub mod stats;
