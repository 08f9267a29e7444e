//! # libvolume: named volumes backed by Azure File shares
//!
//! `libvolume` maps named volume handles to remote SMB shares and serves them
//! to a container orchestrator through the volume plugin protocol.  The
//! orchestrator does not track mount state, so repeated and overlapping
//! mount/unmount calls for one volume are reconciled against the kernel's
//! mount table instead of a request counter.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Volume names, persisted metadata, views. |
//! | [`error`] | [`VolumeError`] covering every failure mode. |
//! | [`config`] | [`DriverConfig`] and its defaults. |
//! | [`metadata`] | [`MetadataStore`]: one atomically written file per volume. |
//! | [`mount`] | CIFS mount invocation and `mountinfo` inspection. |
//! | [`share`] | [`ShareClient`] trait and the Azure Files REST client. |
//! | [`driver`] | [`VolumeDriver`] trait, the operation surface. |
//! | [`coordinator`] | [`VolumeCoordinator`], the serialized lifecycle. |
//! | [`message`] | Plugin protocol requests and responses. |
//! | [`transport`] | HTTP server on TCP or a unix socket. |
//! | [`testing`] | In-memory share client and fake mounter. |

pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod message;
pub mod metadata;
pub mod mount;
pub mod share;
pub mod testing;
pub mod transport;
pub mod types;

pub use config::DriverConfig;
pub use coordinator::VolumeCoordinator;
pub use driver::VolumeDriver;
pub use error::VolumeError;
pub use metadata::MetadataStore;
pub use mount::{AccountKey, MountInspector, Mounter};
pub use share::ShareClient;
pub use transport::{ListenAddr, PluginServer};
pub use types::*;
