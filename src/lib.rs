//! coldvault - an online, encrypted, incremental backup store with
//! content-addressed, block-level storage.
//!
//! The crate is organized bottom-up, each module named after the layer of
//! spec.md it implements: wire primitives and configuration at the base,
//! then the striped object store (SOS) and object namespace (ONS), the
//! encoded file codec (EFC) and directory records (DR) on top of those,
//! account state (AS) tracking usage against them, the per-connection
//! session context (SC) tying it all together, and the offline consistency
//! checker (CC) that can repair a store without a live session.

pub mod account;
pub mod checker;
pub mod config;
pub mod crypto;
pub mod dr;
pub mod efc;
pub mod error;
pub mod housekeeping;
pub mod ons;
pub mod protocol;
pub mod server;
pub mod session;
pub mod sos;
pub mod wire;
