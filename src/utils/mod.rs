//! Shared helpers for the library and the binaries.

pub mod bootstrap;
pub mod retry;
