//! Parley relay server library.
//!
//! Exposes the relay server for use in tests and embedding.
//! The relay accepts TCP connections, registers each participant under the
//! identity it sends first, and relays broadcast and private frames between
//! them.

pub mod config;
pub mod events;
pub mod registry;
pub mod relay;
pub mod session;
