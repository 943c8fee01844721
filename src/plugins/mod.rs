//! Capability modules an instance can be assembled from.

pub mod catalog;
pub mod claims;
pub mod membership;
