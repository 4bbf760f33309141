//! `research-powerpack` crate (library surface).
//!
//! The primary entrypoint is the `research-powerpack` binary (CLI + MCP stdio).
//! This module re-exports the backend-agnostic types and the vendor clients so
//! they can be embedded without depending on the internal crate layout.

pub use powerpack_core as core;
pub use powerpack_local as local;
