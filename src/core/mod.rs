//! Core plumbing for Charter's dispatch kernel and registry.
//!
//! Storage, the serializing broker, the partition scheme and the kernel live
//! here. Capability modules live in `plugins`.

pub mod address;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod kernel;
pub mod partition;
pub mod registry;
pub mod schemas;
pub mod store;
pub mod time;
