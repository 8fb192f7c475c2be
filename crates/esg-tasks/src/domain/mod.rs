//! Domain types for the registry's internal task representation.

pub mod record;

pub use record::*;
