//! Mock GATT transport for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use super::traits::{
    ChangedFields, Characteristic, GattTransport, Handle, TransportError, ValueChanged,
};
use crate::protocol::constants::{
    FWUPDATE_BOOT_NOTIFY_UUID, FWUPDATE_CONTROL_UUID, FWUPDATE_SERVICE_UUID,
    FWUPDATE_VERSION_UUID, GATT_CHRC_IFACE,
};

pub const MOCK_CONTROL_HANDLE: Handle = 0x0012;
pub const MOCK_VERSION_HANDLE: Handle = 0x0014;
pub const MOCK_BOOT_NOTIFY_HANDLE: Handle = 0x0016;

/// A call observed by the mock, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Characteristics(Uuid),
    Read(Handle),
    Write(Handle, Vec<u8>),
    StartNotify(Handle),
}

/// Mock transport for unit testing driver logic.
///
/// Reads are answered from per-handle queues; an empty queue behaves like
/// a device that never answers.
pub struct MockTransport {
    characteristics: Arc<Mutex<Vec<Characteristic>>>,
    read_queue: Arc<Mutex<HashMap<Handle, VecDeque<Result<Vec<u8>, TransportError>>>>>,
    write_results: Arc<Mutex<VecDeque<Result<(), TransportError>>>>,
    notify_result: Arc<Mutex<Result<(), TransportError>>>,
    notifications: Arc<Mutex<VecDeque<ValueChanged>>>,
    call_log: Arc<Mutex<Vec<MockCall>>>,
    connected: Arc<Mutex<bool>>,
    disconnect_after: Arc<Mutex<Option<usize>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            characteristics: Arc::new(Mutex::new(vec![
                Characteristic {
                    uuid: FWUPDATE_CONTROL_UUID,
                    handle: MOCK_CONTROL_HANDLE,
                },
                Characteristic {
                    uuid: FWUPDATE_VERSION_UUID,
                    handle: MOCK_VERSION_HANDLE,
                },
                Characteristic {
                    uuid: FWUPDATE_BOOT_NOTIFY_UUID,
                    handle: MOCK_BOOT_NOTIFY_HANDLE,
                },
            ])),
            read_queue: Arc::new(Mutex::new(HashMap::new())),
            write_results: Arc::new(Mutex::new(VecDeque::new())),
            notify_result: Arc::new(Mutex::new(Ok(()))),
            notifications: Arc::new(Mutex::new(VecDeque::new())),
            call_log: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
            disconnect_after: Arc::new(Mutex::new(None)),
        }
    }

    /// Remove a characteristic from discovery results.
    pub fn hide_characteristic(&self, uuid: Uuid) {
        self.characteristics.lock().unwrap().retain(|c| c.uuid != uuid);
    }

    /// Queue a value to be returned by the next read of `handle`.
    pub fn queue_read(&self, handle: Handle, value: &[u8]) {
        self.queue_read_result(handle, Ok(value.to_vec()));
    }

    /// Queue a u32 value for the next read of `handle`.
    pub fn queue_read_u32(&self, handle: Handle, value: u32) {
        self.queue_read(handle, &value.to_le_bytes());
    }

    pub fn queue_read_result(&self, handle: Handle, result: Result<Vec<u8>, TransportError>) {
        self.read_queue
            .lock()
            .unwrap()
            .entry(handle)
            .or_default()
            .push_back(result);
    }

    /// Queue the outcome of an upcoming write. Writes succeed by default.
    pub fn queue_write_result(&self, result: Result<(), TransportError>) {
        self.write_results.lock().unwrap().push_back(result);
    }

    pub fn set_notify_result(&self, result: Result<(), TransportError>) {
        *self.notify_result.lock().unwrap() = result;
    }

    /// Queue a value-changed event.
    pub fn push_notification(&self, handle: Handle, changed: ChangedFields) {
        self.notifications.lock().unwrap().push_back(ValueChanged {
            interface: GATT_CHRC_IFACE.to_string(),
            handle,
            changed,
        });
    }

    /// Get all captured calls.
    pub fn calls(&self) -> Vec<MockCall> {
        self.call_log.lock().unwrap().clone()
    }

    /// Get captured writes.
    pub fn writes(&self) -> Vec<(Handle, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Write(h, data) => Some((h, data)),
                _ => None,
            })
            .collect()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Drop the link once `calls` calls have been served.
    pub fn disconnect_after(&self, calls: usize) {
        *self.disconnect_after.lock().unwrap() = Some(calls);
    }

    fn is_connected(&self) -> bool {
        let served = self.call_log.lock().unwrap().len();
        let limit = *self.disconnect_after.lock().unwrap();
        *self.connected.lock().unwrap() && !limit.is_some_and(|n| served >= n)
    }

    fn log(&self, call: MockCall) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.call_log.lock().unwrap().push(call);
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl GattTransport for MockTransport {
    fn characteristics(&self, service: Uuid) -> Result<Vec<Characteristic>, TransportError> {
        self.log(MockCall::Characteristics(service))?;
        if service != FWUPDATE_SERVICE_UUID {
            return Ok(Vec::new());
        }
        Ok(self.characteristics.lock().unwrap().clone())
    }

    fn read(&self, handle: Handle, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.log(MockCall::Read(handle))?;
        self.read_queue
            .lock()
            .unwrap()
            .get_mut(&handle)
            .and_then(|q| q.pop_front())
            .unwrap_or(Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }))
    }

    fn write(&self, handle: Handle, data: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        self.log(MockCall::Write(handle, data.to_vec()))?;
        self.write_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    fn start_notify(&self, handle: Handle, _timeout: Duration) -> Result<(), TransportError> {
        self.log(MockCall::StartNotify(handle))?;
        self.notify_result.lock().unwrap().clone()
    }

    fn poll_notification(&self, _timeout: Duration) -> Result<Option<ValueChanged>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        Ok(self.notifications.lock().unwrap().pop_front())
    }
}
