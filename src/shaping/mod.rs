//! Per-source traffic shaping and its state.

mod bucket;
mod middleware;
mod policy;
mod source;
mod store;

pub use bucket::{Reservation, TokenBucket};
pub use middleware::{BucketStore, Shaping, ShapingLayer};
pub use policy::ShapingPolicy;
pub use source::{
    split_host_port, RemoteAddr, RemoteAddrExtractor, SourceExtractor, SourceRange, SourceRanges,
};
pub use store::{TtlStore, MAX_SOURCES};
