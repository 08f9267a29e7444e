//! Plugin transport: the HTTP endpoint the orchestrator calls.
//!
//! [`PluginServer`] speaks the volume plugin protocol over TCP or a unix
//! socket and hands every decoded call to a [`VolumeDriver`](crate::VolumeDriver).

pub mod server;

pub use server::{ListenAddr, PluginServer, handle_request};
