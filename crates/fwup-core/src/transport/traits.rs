//! GATT transport layer abstraction.
//!
//! Defines the `GattTransport` trait for talking to the update service,
//! allowing different implementations (mock, simulated peripheral, or a
//! platform BLE stack).

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::VALUE_PROPERTY;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Enable notify failed: {0}")]
    NotifyFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Opaque attribute handle assigned by the transport.
pub type Handle = u16;

/// A characteristic discovered under a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub handle: Handle,
}

/// Properties that changed in a single "value changed" event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedFields(HashMap<String, Vec<u8>>);

impl ChangedFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for the common single-`Value` case.
    pub fn with_value(value: impl Into<Vec<u8>>) -> Self {
        let mut fields = Self::new();
        fields.insert(VALUE_PROPERTY, value);
        fields
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Asynchronous value-changed event delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueChanged {
    /// Interface that emitted the signal.
    pub interface: String,
    pub handle: Handle,
    pub changed: ChangedFields,
}

/// Abstract GATT client interface.
///
/// Every call is a request/response pair bounded by `timeout`. A call that
/// does not complete in time returns `TransportError::Timeout`.
pub trait GattTransport {
    /// List the characteristics whose parent is `service`.
    fn characteristics(&self, service: Uuid) -> Result<Vec<Characteristic>, TransportError>;

    /// Read a characteristic value.
    fn read(&self, handle: Handle, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Write a characteristic value with response.
    fn write(&self, handle: Handle, data: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Enable notifications on a characteristic.
    fn start_notify(&self, handle: Handle, timeout: Duration) -> Result<(), TransportError>;

    /// Take the next pending notification, waiting at most `timeout`.
    fn poll_notification(&self, timeout: Duration) -> Result<Option<ValueChanged>, TransportError>;
}
