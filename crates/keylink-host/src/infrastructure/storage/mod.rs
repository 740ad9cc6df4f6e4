//! Storage infrastructure: host configuration file persistence.

pub mod config;
