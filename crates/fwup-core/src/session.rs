//! Update session - drives the transfer state machine over a transport.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, trace};
use uuid::Uuid;

use crate::endpoints::{Endpoint, EndpointTriple};
use crate::events::{PacketDirection, TracingObserver, UpdateEvent, UpdateObserver};
use crate::protocol::constants::{
    DEFAULT_ADAPTER, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_TARGET_NAME, GATT_CHRC_IFACE,
    VALUE_PROPERTY,
};
use crate::source::FirmwareLocation;
use crate::state::{Completion, Operation, Request, Step, TransferMachine, TransferSummary};
use crate::transport::{Characteristic, GattTransport, Handle, TransportError, ValueChanged};

/// Configuration for an update session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path to the firmware image.
    pub firmware_path: Option<PathBuf>,
    /// Advertised name of the update target.
    pub target_name: String,
    /// Local Bluetooth adapter.
    pub adapter: String,
    /// Timeout for each outstanding request, in milliseconds.
    pub request_timeout_ms: u64,
    /// How long to wait for notifications between requests, in milliseconds.
    pub notification_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            firmware_path: None,
            target_name: DEFAULT_TARGET_NAME.to_string(),
            adapter: DEFAULT_ADAPTER.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            notification_poll_ms: 0,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn notification_poll(&self) -> Duration {
        Duration::from_millis(self.notification_poll_ms)
    }
}

/// Update session - runs one transfer attempt against a connected peer.
pub struct UpdateSession<O: UpdateObserver> {
    config: SessionConfig,
    observer: Arc<O>,
    firmware: Option<FirmwareLocation>,
}

impl UpdateSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: UpdateObserver + 'static> UpdateSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        let firmware = config.firmware_path.clone().map(FirmwareLocation::File);
        Self {
            config,
            observer,
            firmware,
        }
    }

    /// Override the configured firmware image.
    pub fn with_firmware(mut self, firmware: FirmwareLocation) -> Self {
        self.firmware = Some(firmware);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run the transfer to completion.
    ///
    /// Failures are not retried; running a new session resumes from the
    /// offset the device reports.
    #[instrument(skip(self, transport), fields(device = %self.config.target_name))]
    pub fn run<T: GattTransport>(&self, transport: &T) -> Result<TransferSummary> {
        let endpoints =
            EndpointTriple::resolve(transport).context("Update service not usable")?;

        let transport = ObservableTransport {
            inner: transport,
            observer: &self.observer,
            endpoints,
        };

        let mut machine = TransferMachine::new(self.observer.clone())
            .with_request_timeout(self.config.request_timeout());
        if let Some(firmware) = &self.firmware {
            machine = machine.with_location(firmware.clone());
        }

        let mut queue = VecDeque::new();
        if Self::enqueue(machine.start()?, &mut queue) {
            return Ok(machine.summary());
        }

        loop {
            let request = queue
                .pop_front()
                .ok_or_else(|| anyhow!("Session stalled in {}", machine.state()))?;

            // Status reads run outside the sequenced request's deadline.
            let sequenced = machine
                .pending()
                .is_some_and(|p| p.endpoint == request.endpoint && p.kind == request.kind());

            let completion = self.perform(&transport, &endpoints, request);
            if sequenced {
                machine
                    .expire(Instant::now())
                    .context("Firmware transfer failed")?;
            }
            let step = machine
                .on_completion(completion)
                .context("Firmware transfer failed")?;
            if Self::enqueue(step, &mut queue) {
                break;
            }

            // Drain notifications that arrived while the request was outstanding.
            loop {
                let event = match transport.poll_notification(self.config.notification_poll()) {
                    Ok(Some(event)) => event,
                    Ok(None) => break,
                    Err(error) => {
                        let completion = Completion::Failed {
                            endpoint: Endpoint::BootNotify,
                            error,
                        };
                        return match machine.on_completion(completion) {
                            Err(e) => Err(anyhow::Error::new(e).context("Firmware transfer failed")),
                            Ok(_) => Err(anyhow!("Notification stream lost in {}", machine.state())),
                        };
                    }
                };
                let Some(endpoint) = Self::route(&endpoints, &event) else {
                    continue;
                };
                let step = machine.on_notification(endpoint.uuid(), &event.changed)?;
                Self::enqueue(step, &mut queue);
            }
        }

        let summary = machine.summary();
        info!(
            chunks = summary.chunks_sent,
            bytes = summary.bytes_sent,
            "Transfer finished"
        );
        Ok(summary)
    }

    /// Queue the request carried by `step`. Returns true on completion.
    fn enqueue(step: Step, queue: &mut VecDeque<Request>) -> bool {
        match step {
            Step::Issue(request) => {
                queue.push_back(request);
                false
            }
            Step::Wait => false,
            Step::Complete => true,
        }
    }

    fn route(endpoints: &EndpointTriple, event: &ValueChanged) -> Option<Endpoint> {
        if event.interface != GATT_CHRC_IFACE {
            trace!(interface = %event.interface, "Ignoring signal from foreign interface");
            return None;
        }
        let endpoint = endpoints.endpoint(event.handle);
        if endpoint.is_none() {
            trace!(handle = event.handle, "Ignoring notification for unknown handle");
        }
        endpoint
    }

    fn perform<T: GattTransport>(
        &self,
        transport: &T,
        endpoints: &EndpointTriple,
        request: Request,
    ) -> Completion {
        let endpoint = request.endpoint;
        let handle = endpoints.handle(endpoint);
        let timeout = self.config.request_timeout();

        let result = match request.op {
            Operation::Read => transport
                .read(handle, timeout)
                .map(|value| Completion::Read { endpoint, value }),
            Operation::Write(data) => transport
                .write(handle, &data, timeout)
                .map(|()| Completion::Written { endpoint }),
            Operation::EnableNotify => transport
                .start_notify(handle, timeout)
                .map(|()| Completion::NotifyEnabled { endpoint }),
        };

        result.unwrap_or_else(|error| Completion::Failed { endpoint, error })
    }
}

/// Transport wrapper that emits packet events.
struct ObservableTransport<'a, T: GattTransport, O: UpdateObserver> {
    inner: &'a T,
    observer: &'a Arc<O>,
    endpoints: EndpointTriple,
}

impl<'a, T: GattTransport, O: UpdateObserver> ObservableTransport<'a, T, O> {
    fn emit(&self, direction: PacketDirection, handle: Handle, data: &[u8]) {
        if let Some(endpoint) = self.endpoints.endpoint(handle) {
            self.observer.on_event(&UpdateEvent::Packet {
                direction,
                endpoint,
                length: data.len(),
                data: Some(data.iter().take(32).cloned().collect()),
            });
        }
    }
}

impl<'a, T: GattTransport, O: UpdateObserver> GattTransport for ObservableTransport<'a, T, O> {
    fn characteristics(&self, service: Uuid) -> Result<Vec<Characteristic>, TransportError> {
        self.inner.characteristics(service)
    }

    fn read(&self, handle: Handle, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.read(handle, timeout);
        if let Ok(data) = &res {
            self.emit(PacketDirection::Rx, handle, data);
        }
        res
    }

    fn write(&self, handle: Handle, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let res = self.inner.write(handle, data, timeout);
        if res.is_ok() {
            self.emit(PacketDirection::Tx, handle, data);
        }
        res
    }

    fn start_notify(&self, handle: Handle, timeout: Duration) -> Result<(), TransportError> {
        self.inner.start_notify(handle, timeout)
    }

    fn poll_notification(&self, timeout: Duration) -> Result<Option<ValueChanged>, TransportError> {
        let res = self.inner.poll_notification(timeout);
        if let Ok(Some(event)) = &res
            && let Some(value) = event.changed.get(VALUE_PROPERTY)
        {
            self.emit(PacketDirection::Rx, event.handle, value);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::SetupError;
    use crate::events::test_support::RecordingObserver;
    use crate::events::{NullObserver, VersionSource};
    use crate::protocol::{CHUNK_HEADER_SIZE, FWUPDATE_VERSION_UUID};
    use crate::state::{SessionError, TransferState};
    use crate::transport::mock::{
        MOCK_BOOT_NOTIFY_HANDLE, MOCK_CONTROL_HANDLE, MOCK_VERSION_HANDLE,
    };
    use crate::transport::{ChangedFields, MockCall, MockTransport, SimulatedDevice};

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    fn session(data: &[u8]) -> (UpdateSession<RecordingObserver>, Arc<RecordingObserver>) {
        let obs = Arc::new(RecordingObserver::default());
        let s = UpdateSession::with_observer(SessionConfig::default(), obs.clone())
            .with_firmware(FirmwareLocation::Memory(Arc::from(data.to_vec())));
        (s, obs)
    }

    #[test]
    fn test_full_transfer_against_simulator() {
        let data = image(1000);
        let dev = SimulatedDevice::new(DEFAULT_TARGET_NAME).with_version(1);
        let (s, obs) = session(&data);

        let summary = s.run(&dev).unwrap();
        assert_eq!(dev.received(), data);
        assert_eq!(summary.chunks_sent, 8);
        assert_eq!(summary.bytes_sent, 1000);
        assert_eq!(summary.start_offset, Some(0));
        assert_eq!(dev.rejected_chunks(), 0);
        assert!(obs.events().contains(&UpdateEvent::Complete { total: 1000 }));
    }

    #[test]
    fn test_lost_ack_then_resume() {
        let data = image(300);
        let dev = SimulatedDevice::new(DEFAULT_TARGET_NAME).drop_ack_after(1);

        let (s, _obs) = session(&data);
        let err = s.run(&dev).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Timeout {
                endpoint: Endpoint::Control,
                ..
            })
        ));
        // The dropped ack's chunk still landed.
        assert_eq!(dev.offset(), 256);

        let (s, _obs) = session(&data);
        let summary = s.run(&dev).unwrap();
        assert_eq!(summary.start_offset, Some(256));
        assert_eq!(summary.chunks_sent, 1);
        assert_eq!(summary.bytes_sent, 44);
        assert_eq!(dev.received(), data);
    }

    #[test]
    fn test_resume_from_preloaded_device() {
        let data = image(700);
        let dev = SimulatedDevice::new(DEFAULT_TARGET_NAME).with_received(&data[..512]);
        let (s, _obs) = session(&data);

        let summary = s.run(&dev).unwrap();
        assert_eq!(summary.bytes_sent, 188);
        assert_eq!(dev.received(), data);
    }

    #[test]
    fn test_already_updated_device_sends_nothing() {
        let data = image(64);
        let dev = SimulatedDevice::new(DEFAULT_TARGET_NAME).with_received(&data);
        let (s, _obs) = session(&data);

        let summary = s.run(&dev).unwrap();
        assert_eq!(summary.chunks_sent, 0);
        assert_eq!(dev.rejected_chunks(), 0);
    }

    #[test]
    fn test_boot_notification_reports_version() {
        let data = image(200);
        let dev = SimulatedDevice::new(DEFAULT_TARGET_NAME)
            .with_version(0x0102)
            .with_boot_announcement();
        let (s, obs) = session(&data);

        s.run(&dev).unwrap();
        let events = obs.events();
        assert!(events.contains(&UpdateEvent::VersionReported {
            version: 0x0102,
            source: VersionSource::Initial,
        }));
        assert!(events.contains(&UpdateEvent::VersionReported {
            version: 0x0102,
            source: VersionSource::BootNotification,
        }));
        assert_eq!(dev.received(), data);
    }

    #[test]
    fn test_missing_characteristic_is_setup_error() {
        let mock = MockTransport::new();
        mock.hide_characteristic(FWUPDATE_VERSION_UUID);
        let (s, _obs) = session(&image(10));

        let err = s.run(&mock).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SetupError>(),
            Some(SetupError::MissingEndpoint(Endpoint::VersionRead))
        ));
        // Nothing beyond discovery was attempted.
        assert_eq!(mock.calls().len(), 1);
    }

    #[test]
    fn test_write_failure_stops_all_requests() {
        let mock = MockTransport::new();
        mock.queue_read_u32(MOCK_VERSION_HANDLE, 3);
        mock.queue_read_u32(MOCK_CONTROL_HANDLE, 0);
        mock.queue_write_result(Err(TransportError::WriteFailed("att error".into())));
        let (s, _obs) = session(&image(300));

        let err = s.run(&mock).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Transport {
                endpoint: Endpoint::Control,
                ..
            })
        ));

        let calls = mock.calls();
        assert_eq!(
            &calls[1..3],
            &[
                MockCall::Read(MOCK_VERSION_HANDLE),
                MockCall::StartNotify(MOCK_BOOT_NOTIFY_HANDLE),
            ]
        );
        assert!(matches!(calls.last(), Some(MockCall::Write(MOCK_CONTROL_HANDLE, _))));
        assert_eq!(calls.len(), 5);
    }

    /// Answers Control writes only after `delay`.
    struct SlowWrites {
        inner: SimulatedDevice,
        delay: Duration,
    }

    impl GattTransport for SlowWrites {
        fn characteristics(&self, service: Uuid) -> Result<Vec<Characteristic>, TransportError> {
            self.inner.characteristics(service)
        }

        fn read(&self, handle: Handle, timeout: Duration) -> Result<Vec<u8>, TransportError> {
            self.inner.read(handle, timeout)
        }

        fn write(&self, handle: Handle, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
            std::thread::sleep(self.delay);
            self.inner.write(handle, data, timeout)
        }

        fn start_notify(&self, handle: Handle, timeout: Duration) -> Result<(), TransportError> {
            self.inner.start_notify(handle, timeout)
        }

        fn poll_notification(&self, timeout: Duration) -> Result<Option<ValueChanged>, TransportError> {
            self.inner.poll_notification(timeout)
        }
    }

    #[test]
    fn test_late_ack_past_deadline_fails() {
        let slow = SlowWrites {
            inner: SimulatedDevice::new(DEFAULT_TARGET_NAME),
            delay: Duration::from_millis(60),
        };
        let obs = Arc::new(RecordingObserver::default());
        let config = SessionConfig {
            request_timeout_ms: 10,
            ..Default::default()
        };
        let s = UpdateSession::with_observer(config, obs.clone())
            .with_firmware(FirmwareLocation::Memory(Arc::from(image(300))));

        let err = s.run(&slow).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Timeout {
                endpoint: Endpoint::Control,
                after_ms: 10
            })
        ));
        // The device applied the chunk, but no second one was sent.
        assert_eq!(slow.inner.offset(), 128);
        assert!(!obs.events().iter().any(|e| matches!(e, UpdateEvent::Complete { .. })));
    }

    #[test]
    fn test_version_read_failure_fails_session() {
        let dev = SimulatedDevice::new(DEFAULT_TARGET_NAME);
        dev.fail_reads();
        let (s, obs) = session(&image(100));

        let err = s.run(&dev).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Transport {
                endpoint: Endpoint::VersionRead,
                source: TransportError::ReadFailed(_),
            })
        ));
        assert_eq!(dev.offset(), 0);
        assert!(obs.events().iter().any(|e| matches!(e, UpdateEvent::Error { .. })));
    }

    #[test]
    fn test_offset_read_failure_stops_all_requests() {
        let mock = MockTransport::new();
        mock.queue_read_u32(MOCK_VERSION_HANDLE, 1);
        mock.queue_read_result(
            MOCK_CONTROL_HANDLE,
            Err(TransportError::ReadFailed("att error".into())),
        );
        let (s, _obs) = session(&image(300));

        let err = s.run(&mock).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Transport {
                endpoint: Endpoint::Control,
                ..
            })
        ));
        let calls = mock.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls.last(), Some(&MockCall::Read(MOCK_CONTROL_HANDLE)));
        assert!(mock.writes().is_empty());
    }

    #[test]
    fn test_enable_notify_failure_stops_all_requests() {
        let mock = MockTransport::new();
        mock.queue_read_u32(MOCK_VERSION_HANDLE, 1);
        mock.set_notify_result(Err(TransportError::NotifyFailed("not permitted".into())));
        let (s, _obs) = session(&image(300));

        let err = s.run(&mock).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Transport {
                endpoint: Endpoint::BootNotify,
                source: TransportError::NotifyFailed(_),
            })
        ));
        let calls = mock.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls.last(), Some(&MockCall::StartNotify(MOCK_BOOT_NOTIFY_HANDLE)));
    }

    #[test]
    fn test_disconnect_mid_session_fails() {
        let mock = MockTransport::new();
        mock.queue_read_u32(MOCK_VERSION_HANDLE, 1);
        mock.queue_read_u32(MOCK_CONTROL_HANDLE, 0);
        // Link drops right after notifications are enabled.
        mock.disconnect_after(3);
        let (s, obs) = session(&image(300));

        let err = s.run(&mock).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Transport {
                source: TransportError::Disconnected,
                ..
            })
        ));
        assert_eq!(mock.calls().len(), 3);
        assert!(mock.writes().is_empty());
        assert!(obs.events().contains(&UpdateEvent::PhaseChanged {
            from: TransferState::OffsetQuery,
            to: TransferState::Failed,
        }));
    }

    #[test]
    fn test_disconnected_before_discovery() {
        let mock = MockTransport::new();
        mock.disconnect();
        let s = UpdateSession::with_observer(SessionConfig::default(), Arc::new(NullObserver))
            .with_firmware(FirmwareLocation::Memory(Arc::from(image(10))));

        let err = s.run(&mock).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SetupError>(),
            Some(SetupError::Transport(TransportError::Disconnected))
        ));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_write_failure_midway_keeps_device_progress() {
        let data = image(300);
        let dev = SimulatedDevice::new(DEFAULT_TARGET_NAME).fail_writes_after(2);
        let (s, _obs) = session(&data);

        let err = s.run(&dev).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Transport {
                endpoint: Endpoint::Control,
                source: TransportError::WriteFailed(_),
            })
        ));
        assert_eq!(dev.received(), &data[..256]);
    }

    #[test]
    fn test_control_requests_strictly_alternate() {
        let mock = MockTransport::new();
        mock.queue_read_u32(MOCK_VERSION_HANDLE, 1);
        for offset in [0u32, 128, 256, 300] {
            mock.queue_read_u32(MOCK_CONTROL_HANDLE, offset);
        }
        let data = image(300);
        let (s, _obs) = session(&data);

        s.run(&mock).unwrap();

        let control: Vec<_> = mock
            .calls()
            .into_iter()
            .filter(|c| match c {
                MockCall::Read(h) | MockCall::Write(h, _) => *h == MOCK_CONTROL_HANDLE,
                _ => false,
            })
            .collect();
        assert_eq!(control.len(), 7);
        for (i, call) in control.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(call, &MockCall::Read(MOCK_CONTROL_HANDLE));
            } else {
                assert!(matches!(call, MockCall::Write(..)));
            }
        }

        let payload_lens: Vec<_> = mock
            .writes()
            .iter()
            .map(|(_, d)| d.len() - CHUNK_HEADER_SIZE)
            .collect();
        assert_eq!(payload_lens, vec![128, 128, 44]);
    }

    #[test]
    fn test_unresponsive_device_times_out() {
        let mock = MockTransport::new();
        mock.queue_read_u32(MOCK_VERSION_HANDLE, 1);
        let obs = Arc::new(RecordingObserver::default());
        let config = SessionConfig {
            request_timeout_ms: 50,
            ..Default::default()
        };
        let s = UpdateSession::with_observer(config, obs)
            .with_firmware(FirmwareLocation::Memory(Arc::from(image(10))));

        let err = s.run(&mock).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::Timeout {
                endpoint: Endpoint::Control,
                after_ms: 50
            })
        ));
    }

    #[test]
    fn test_notification_for_unknown_handle_ignored() {
        let mock = MockTransport::new();
        mock.queue_read_u32(MOCK_VERSION_HANDLE, 1);
        mock.queue_read_u32(MOCK_CONTROL_HANDLE, 4);
        mock.push_notification(0x0099, ChangedFields::with_value(vec![1, 0, 0, 0]));
        mock.push_notification(MOCK_BOOT_NOTIFY_HANDLE, ChangedFields::new());
        let (s, _obs) = session(&image(4));

        s.run(&mock).unwrap();
        let version_reads = mock
            .calls()
            .iter()
            .filter(|c| **c == MockCall::Read(MOCK_VERSION_HANDLE))
            .count();
        assert_eq!(version_reads, 1);
    }

    #[test]
    fn test_config_toml_round_trip() {
        let path = std::env::temp_dir().join(format!("fwup-config-{}.toml", std::process::id()));
        let config = SessionConfig {
            firmware_path: Some(PathBuf::from("/tmp/image_v2_signed.bin")),
            request_timeout_ms: 1500,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        std::fs::remove_file(path).unwrap();

        let partial: SessionConfig = toml::from_str("target_name = \"bench\"").unwrap();
        assert_eq!(partial.target_name, "bench");
        assert_eq!(partial.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        assert!(partial.firmware_path.is_none());
    }
}
