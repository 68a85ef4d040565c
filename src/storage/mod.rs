//! Storage layers.
//!
//! [`sandbox`] holds the per-request local filesystems (memory or disk
//! backed, quota accounted); [`factory`] owns them and enforces the global
//! byte quota; [`remote`] is the object-store port the pipeline downloads
//! from and the schedule service uploads to.

pub mod factory;
pub mod remote;
pub mod sandbox;

pub use factory::SandboxFactory;
pub use remote::{MemoryRemoteStorage, RemoteStorage, RemoteStorageFactory};
pub use sandbox::{Sandbox, SandboxReader};
