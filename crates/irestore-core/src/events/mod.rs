//! Event system.
//!
//! Two layers:
//! - `hub`: per-connection protocol events (pre/post command, progress,
//!   console data) with handlers that may call back into the client.
//! - `RestoreObserver`: session-level progress for CLI/UI layers, without
//!   tight coupling to the core logic.

pub mod hub;

pub use hub::{EventAction, EventHub, EventKind, HubEvent};

use crate::error::ErrorKind;
use crate::protocol::DeviceMode;
use crate::state::RestoreState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by the restore session.
#[derive(Debug, Clone)]
pub enum RestoreEvent {
    /// State machine moved on.
    StateChanged { from: RestoreState, to: RestoreState },
    /// Device detected in a mode.
    DeviceDetected { mode: DeviceMode },
    /// Bootloader connection opened.
    DeviceConnected { mode: DeviceMode, ecid: u64 },
    DeviceDisconnected,
    /// Upload progress for the current component.
    Progress {
        component: String,
        current: u64,
        total: u64,
    },
    /// Component fully uploaded and its load command issued.
    ComponentStaged { component: String, bytes: usize },
    /// Signing ticket obtained.
    TicketReceived { ecid: u64 },
    /// Bootloader environment value read for diagnostics.
    EnvironmentRead { name: String, value: Option<String> },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Session failed.
    Error {
        state: RestoreState,
        kind: ErrorKind,
        message: String,
    },
    /// Restore finished successfully.
    Complete,
}

/// Observer trait for receiving restore events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait RestoreObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &RestoreEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl RestoreObserver for NullObserver {
    fn on_event(&self, _event: &RestoreEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl RestoreObserver for TracingObserver {
    fn on_event(&self, event: &RestoreEvent) {
        match event {
            RestoreEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State changed");
            }
            RestoreEvent::DeviceDetected { mode } => {
                tracing::info!(mode = %mode, "Device detected");
            }
            RestoreEvent::DeviceConnected { mode, ecid } => {
                tracing::info!(mode = %mode, ecid = %format!("{:016X}", ecid), "Device connected");
            }
            RestoreEvent::DeviceDisconnected => {
                tracing::debug!("Device connection closed");
            }
            RestoreEvent::Progress {
                component,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(component = %component, progress = %format!("{}%", pct), "Progress");
            }
            RestoreEvent::ComponentStaged { component, bytes } => {
                tracing::info!(component = %component, bytes, "Component staged");
            }
            RestoreEvent::TicketReceived { ecid } => {
                tracing::info!(ecid = %format!("{:016X}", ecid), "Signing ticket received");
            }
            RestoreEvent::EnvironmentRead { name, value } => match value {
                Some(v) => tracing::info!(name = %name, value = %v, "Bootloader environment"),
                None => tracing::debug!(name = %name, "Bootloader variable not set"),
            },
            RestoreEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            RestoreEvent::Error {
                state,
                kind,
                message,
            } => {
                tracing::error!(state = %state, kind = ?kind, "Error: {}", message);
            }
            RestoreEvent::Complete => {
                tracing::info!("Restore complete");
            }
        }
    }
}
