//! Integration test suite for colony.
//!
//! These tests drive the public API end to end: submissions flowing through
//! the dependency graph and ready queue, health checks and recovery against
//! scripted probes, scaling decisions applied to the registry, and the
//! coordinator event loop.
//!
//! # Test Categories
//!
//! - `scheduling`: Priority order, dependencies, retries, failure propagation
//! - `recovery`: Health monitor, backup activation, escalation
//! - `scaling`: Metrics collection and bounded scale up/down
//! - `coordinator`: The event loop behind a `ColonyHandle`
//!
//! No test spawns an external process; workers are simulated in-process.

mod fixtures;

mod coordinator;
mod recovery;
mod scheduling;
