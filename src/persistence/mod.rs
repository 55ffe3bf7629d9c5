//! §6 persistence adapters over the `src/ports.rs` traits.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;
