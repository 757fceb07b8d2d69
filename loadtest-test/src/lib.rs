//! Test utilities for the load test.
//!
//! This crate provides an in-process service for the load test to run against. See the modules
//! for all available utilities.

pub mod server;
pub mod tracing;
