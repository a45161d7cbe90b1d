//! D-Bus service for the berth container agent.
//!
//! This crate exposes the [`berth_core::Agent`] over the `org.berth.Agent1`
//! D-Bus interface: clients create containers, grant them capabilities or raw
//! gateway configuration, launch processes and tear containers down. Process
//! starts and exits are published as `ProcessStateChanged` signals.

pub mod interface;
pub mod service;

pub use interface::{AgentService, API_VERSION, DBUS_INTERFACE, DBUS_NAME, DBUS_PATH};
pub use service::{run_service, ServiceError};
