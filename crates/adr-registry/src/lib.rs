//! `adr-registry` – the variable registry the bridge writes into.
//!
//! Stands in for the hosting framework's record database: typed slots with a
//! write primitive, an operator put path and a change broadcast.
//!
//! # Modules
//!
//! - [`registry`] – [`VariableRegistry`] and its [`VariableInfo`] snapshot.

pub mod registry;
mod slot;

pub use registry::{DEFAULT_PREFIX, VariableInfo, VariableRegistry};
