//! Integration test entry point for cachemesh-node.
//!
//! Run with: cargo test --test integration -- --test-threads=1

mod harness;
mod convergence;
mod messaging;
mod invalidation;
mod multicast;
