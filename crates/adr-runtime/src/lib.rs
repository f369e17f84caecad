//! `adr-runtime` – process-level assembly of the ADR IOC.
//!
//! # Modules
//!
//! - [`ioc`] – [`Ioc`][ioc::Ioc] and its [`IocConfig`][ioc::IocConfig]:
//!   owns the variable registry and runs the status bridge, the command
//!   dispatcher and the operator gateway until shutdown.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console logs
//!   (text or JSON) with optional OTLP span export.

pub mod ioc;
pub mod telemetry;

pub use ioc::{Ioc, IocConfig};
pub use telemetry::{TracerProviderGuard, init_tracing};
