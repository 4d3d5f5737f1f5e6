//! arraysight: a performance-counter collection engine for storage-array
//! management planes.
//!
//! The engine polls a vendor REST API in three phases (counter schema,
//! instance enumeration, data collection), cooks raw cumulative counters
//! into deltas, rates, averages, percentages and histograms against the
//! previous poll's snapshot, and emits an in-memory matrix per object for
//! external exporters.

pub mod collector;
pub mod config;
pub mod errors;
pub mod matrix;
pub mod metadata;
pub mod rest;
pub mod template;
