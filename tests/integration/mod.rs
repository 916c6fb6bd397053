//! Integration test suite for hive.
//!
//! These tests run a real swarm: background loops, worker dispatch, retry
//! accounting, and collective voting over the message channel.
//!
//! # Test Categories
//!
//! - `swarm_e2e`: submit paths, retries, worker lifecycle, load invariants
//! - `voting_e2e`: collective decisions through the running message loop
//!
//! All workers are scripted fixtures; nothing leaves the process.

mod fixtures;

mod swarm_e2e;
mod voting_e2e;
