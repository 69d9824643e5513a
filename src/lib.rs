//! Request Shaper - per-source traffic shaping middleware
//!
//! This crate shapes inbound HTTP traffic with one token bucket per client
//! address. Requests within a source's budget pass through, requests slightly
//! over it are held until the bucket refills, and the rest are rejected with
//! `429 Too Many Requests`. Idle buckets expire so that the number of tracked
//! sources stays bounded.

pub mod config;
pub mod error;
pub mod server;
pub mod shaping;
