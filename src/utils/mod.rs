//! General helpers shared across the crate

pub mod general;
pub mod macros;
