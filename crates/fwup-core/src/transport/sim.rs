//! Simulated update peripheral.
//!
//! Behaves like the device side of the update service: the control
//! characteristic accepts sequence-checked chunks and reads back the next
//! expected offset, the version characteristic reports the running firmware
//! version, and the boot characteristic notifies that version.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::traits::{
    ChangedFields, Characteristic, GattTransport, Handle, TransportError, ValueChanged,
};
use crate::protocol::constants::{
    FWUPDATE_BOOT_NOTIFY_UUID, FWUPDATE_CONTROL_UUID, FWUPDATE_SERVICE_UUID,
    FWUPDATE_VERSION_UUID, GATT_CHRC_IFACE, MAX_PACKET_SIZE,
};
use crate::protocol::{Chunk, encode_u32};

pub const SIM_CONTROL_HANDLE: Handle = 0x0021;
pub const SIM_VERSION_HANDLE: Handle = 0x0023;
pub const SIM_BOOT_NOTIFY_HANDLE: Handle = 0x0025;

#[derive(Debug, Default)]
struct SimState {
    version: u32,
    received: Vec<u8>,
    notifying: bool,
    announce_on_subscribe: bool,
    notifications: VecDeque<ValueChanged>,
    writes: usize,
    rejected: usize,
    fail_write_after: Option<usize>,
    drop_ack_after: Option<usize>,
    fail_reads: bool,
}

/// In-process stand-in for an update target.
#[derive(Debug)]
pub struct SimulatedDevice {
    name: String,
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn with_version(self, version: u32) -> Self {
        self.lock().version = version;
        self
    }

    /// Start with `prefix` already received, as after an interrupted update.
    pub fn with_received(self, prefix: &[u8]) -> Self {
        self.lock().received = prefix.to_vec();
        self
    }

    /// Send a boot notification as soon as the client subscribes.
    pub fn with_boot_announcement(self) -> Self {
        self.lock().announce_on_subscribe = true;
        self
    }

    /// Fail every write after the first `n` have succeeded.
    pub fn fail_writes_after(self, n: usize) -> Self {
        self.lock().fail_write_after = Some(n);
        self
    }

    /// Apply write number `n + 1` but lose its acknowledgment.
    pub fn drop_ack_after(self, n: usize) -> Self {
        self.lock().drop_ack_after = Some(n);
        self
    }

    pub fn fail_reads(&self) {
        self.lock().fail_reads = true;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes received so far.
    pub fn received(&self) -> Vec<u8> {
        self.lock().received.clone()
    }

    /// Next offset the device expects.
    pub fn offset(&self) -> u32 {
        self.lock().received.len() as u32
    }

    /// Chunks ignored because their offset did not match.
    pub fn rejected_chunks(&self) -> usize {
        self.lock().rejected
    }

    pub fn set_version(&self, version: u32) {
        self.lock().version = version;
    }

    /// Queue a boot notification carrying the current version.
    ///
    /// Dropped when the client has not enabled notifications.
    pub fn announce_boot(&self) {
        let mut state = self.lock();
        Self::queue_boot(&mut state);
    }

    fn queue_boot(state: &mut SimState) {
        if !state.notifying {
            debug!("Boot notification dropped, client not subscribed");
            return;
        }
        let value = encode_u32(state.version).to_vec();
        state.notifications.push_back(ValueChanged {
            interface: GATT_CHRC_IFACE.to_string(),
            handle: SIM_BOOT_NOTIFY_HANDLE,
            changed: ChangedFields::with_value(value),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn accept_chunk(state: &mut SimState, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > MAX_PACKET_SIZE {
            warn!(len = data.len(), "Chunk too long");
            return Err(TransportError::WriteFailed(format!(
                "invalid attribute value length {}",
                data.len()
            )));
        }
        let chunk = Chunk::from_bytes(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        let expected = state.received.len() as u32;
        if chunk.offset != expected {
            warn!(seq = chunk.offset, expected, "Wrong seq");
            state.rejected += 1;
            return Ok(());
        }
        state.received.extend_from_slice(&chunk.payload);
        debug!(offset = state.received.len(), "Update progress");
        Ok(())
    }
}

impl GattTransport for SimulatedDevice {
    fn characteristics(&self, service: Uuid) -> Result<Vec<Characteristic>, TransportError> {
        if service != FWUPDATE_SERVICE_UUID {
            return Err(TransportError::NotFound(format!("service {}", service)));
        }
        Ok(vec![
            Characteristic {
                uuid: FWUPDATE_CONTROL_UUID,
                handle: SIM_CONTROL_HANDLE,
            },
            Characteristic {
                uuid: FWUPDATE_VERSION_UUID,
                handle: SIM_VERSION_HANDLE,
            },
            Characteristic {
                uuid: FWUPDATE_BOOT_NOTIFY_UUID,
                handle: SIM_BOOT_NOTIFY_HANDLE,
            },
        ])
    }

    fn read(&self, handle: Handle, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let state = self.lock();
        if state.fail_reads {
            return Err(TransportError::ReadFailed("simulated read failure".into()));
        }
        match handle {
            SIM_CONTROL_HANDLE => Ok(encode_u32(state.received.len() as u32).to_vec()),
            SIM_VERSION_HANDLE => Ok(encode_u32(state.version).to_vec()),
            _ => Err(TransportError::ReadFailed(format!(
                "read not permitted on handle 0x{:04X}",
                handle
            ))),
        }
    }

    fn write(&self, handle: Handle, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.lock();
        if handle != SIM_CONTROL_HANDLE {
            return Err(TransportError::WriteFailed(format!(
                "write not permitted on handle 0x{:04X}",
                handle
            )));
        }
        if state.fail_write_after.is_some_and(|n| state.writes >= n) {
            return Err(TransportError::WriteFailed("simulated write failure".into()));
        }
        let write_no = state.writes;
        state.writes += 1;
        Self::accept_chunk(&mut state, data)?;

        if state.drop_ack_after == Some(write_no) {
            info!(write_no, "Dropping acknowledgment");
            return Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    fn start_notify(&self, handle: Handle, _timeout: Duration) -> Result<(), TransportError> {
        if handle != SIM_BOOT_NOTIFY_HANDLE {
            return Err(TransportError::NotifyFailed(format!(
                "notify not supported on handle 0x{:04X}",
                handle
            )));
        }
        let mut state = self.lock();
        state.notifying = true;
        if state.announce_on_subscribe {
            Self::queue_boot(&mut state);
        }
        Ok(())
    }

    fn poll_notification(&self, _timeout: Duration) -> Result<Option<ValueChanged>, TransportError> {
        Ok(self.lock().notifications.pop_front())
    }
}
