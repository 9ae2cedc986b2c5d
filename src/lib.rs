//! Ratewindow - Approximate Sliding Window Rate Limiting
//!
//! This crate estimates per-key request rates from two fixed-size window
//! counters instead of a full timestamp log, trading exactness for constant
//! memory and constant-time checks per key. Counts live in a pluggable
//! [`CounterStore`](ratelimit::CounterStore); an in-memory store with
//! background eviction is provided.

pub mod config;
pub mod error;
pub mod ratelimit;
