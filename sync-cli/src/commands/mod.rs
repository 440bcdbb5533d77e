//! CLI command implementations.

pub mod discover;
pub mod pair;
pub mod servers;
pub mod sync;
