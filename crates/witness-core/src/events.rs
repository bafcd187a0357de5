//! Event system for UI decoupling.
//!
//! The provisioning session reports everything the operator needs to see
//! (prompts, countdowns, milestones) as events, so the CLI can render them
//! without the core knowing how.

use std::fmt;

use crate::provision::ProvisionState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Device personas seen during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persona {
    /// Boot ROM in serial download mode.
    Recovery,
    /// Recovery firmware exposing the MMC.
    MassStorage,
    /// Operational witness firmware.
    Operational,
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Persona::Recovery => write!(f, "serial download"),
            Persona::MassStorage => write!(f, "mass storage"),
            Persona::Operational => write!(f, "operational"),
        }
    }
}

/// Events emitted by the provisioning session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionEvent {
    /// State machine transition.
    PhaseChanged { from: ProvisionState, to: ProvisionState },
    /// The operator has to do something.
    Prompt { message: String },
    /// Seconds left before an action starts.
    Countdown { action: String, remaining_secs: u64 },
    /// A device persona appeared.
    DeviceDetected { persona: Persona, path: String },
    /// A check or step finished.
    Milestone { name: String, passed: bool },
    /// A safety check was overridden or something looks off.
    Warning { message: String },
    /// Progress update for a long running operation.
    Progress {
        operation: String,
        current: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Run finished successfully.
    Complete { serial: String, identity: String },
}

/// Observer trait for receiving provisioning events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait ProvisionObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &ProvisionEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ProvisionObserver for NullObserver {
    fn on_event(&self, _event: &ProvisionEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ProvisionObserver for TracingObserver {
    fn on_event(&self, event: &ProvisionEvent) {
        match event {
            ProvisionEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            ProvisionEvent::Prompt { message } => {
                tracing::info!("Operator: {}", message);
            }
            ProvisionEvent::Countdown {
                action,
                remaining_secs,
            } => {
                tracing::info!("{} in {}", action, remaining_secs);
            }
            ProvisionEvent::DeviceDetected { persona, path } => {
                tracing::info!(persona = %persona, path = %path, "Device detected");
            }
            ProvisionEvent::Milestone { name, passed } => {
                if *passed {
                    tracing::info!(milestone = %name, "PASS");
                } else {
                    tracing::error!(milestone = %name, "FAIL");
                }
            }
            ProvisionEvent::Warning { message } => {
                tracing::warn!("{}", message);
            }
            ProvisionEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::info!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            ProvisionEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            ProvisionEvent::Complete { serial, identity } => {
                tracing::info!(serial = %serial, identity = %identity, "Device provisioned");
            }
        }
    }
}
