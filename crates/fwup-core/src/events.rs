//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front end) to follow a transfer without
//! tight coupling to the core logic.

use std::fmt;

use crate::endpoints::Endpoint;
use crate::state::TransferState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Why a version value was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSource {
    /// Read at session start.
    Initial,
    /// Read after the device announced a boot.
    BootNotification,
}

impl fmt::Display for VersionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSource::Initial => write!(f, "initial"),
            VersionSource::BootNotification => write!(f, "boot"),
        }
    }
}

/// Events emitted during an update session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    /// Transfer state changed.
    PhaseChanged {
        from: TransferState,
        to: TransferState,
    },
    /// Device reported its firmware version.
    VersionReported { version: u32, source: VersionSource },
    /// Boot notifications are now enabled.
    NotificationsEnabled,
    /// Device reported the next offset it expects.
    OffsetReported { offset: u32, total: u32 },
    /// A chunk was handed to the transport.
    ChunkSent { offset: u32, len: usize },
    /// Bytes confirmed by the device.
    Progress { current: u64, total: u64 },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Raw GATT traffic.
    Packet {
        direction: PacketDirection,
        endpoint: Endpoint,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Session failed.
    Error { message: String },
    /// Image fully transferred.
    Complete { total: u32 },
}

/// GATT packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Client -> Device
    Rx, // Device -> Client
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving update events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait UpdateObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpdateEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpdateObserver for NullObserver {
    fn on_event(&self, _event: &UpdateEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpdateObserver for TracingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        match event {
            UpdateEvent::PhaseChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Phase changed");
            }
            UpdateEvent::VersionReported { version, source } => {
                tracing::info!(source = %source, "Current version: {}", version);
            }
            UpdateEvent::NotificationsEnabled => {
                tracing::info!("Boot notifications enabled");
            }
            UpdateEvent::OffsetReported { offset, total } => {
                tracing::debug!(offset, total, "Update offset");
            }
            UpdateEvent::ChunkSent { offset, len } => {
                tracing::trace!(offset, len, "Chunk sent");
            }
            UpdateEvent::Progress { current, total } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    100
                };
                tracing::info!(progress = %format!("{}%", pct), "{}/{} bytes", current, total);
            }
            UpdateEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            UpdateEvent::Packet {
                direction,
                endpoint,
                length,
                ..
            } => {
                tracing::trace!(dir = %direction, endpoint = %endpoint, len = length, "GATT Packet");
            }
            UpdateEvent::Error { message } => {
                tracing::error!("Update failed: {}", message);
            }
            UpdateEvent::Complete { total } => {
                tracing::info!(total, "Update complete");
            }
        }
    }
}
