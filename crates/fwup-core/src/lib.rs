//! fwup-core: client side of a BLE GATT firmware-update service.
//!
//! The update target exposes one service with three characteristics:
//! a control point that takes offset-tagged chunks and reports the next
//! offset it expects, a version characteristic, and a boot characteristic
//! that notifies the running version after a reboot.
//!
//! # Architecture
//!
//! - **Protocol**: UUIDs, sizes, and the chunk wire format
//! - **Transport**: GATT abstraction (simulated peripheral, mock)
//! - **Endpoints**: Characteristic discovery and handle mapping
//! - **Dispatch**: Routing of value-changed notifications
//! - **State**: Sans-IO transfer state machine
//! - **Source**: Firmware image access
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: Driver tying the machine to a transport
//!
//! # Example
//!
//! ```no_run
//! use fwup_core::session::{SessionConfig, UpdateSession};
//! use fwup_core::transport::SimulatedDevice;
//!
//! let config = SessionConfig {
//!     firmware_path: Some("image_v2_signed.bin".into()),
//!     ..Default::default()
//! };
//!
//! let device = SimulatedDevice::new(&config.target_name);
//! let summary = UpdateSession::new(config).run(&device).expect("update failed");
//! println!("sent {} bytes", summary.bytes_sent);
//! ```

pub mod dispatch;
pub mod endpoints;
pub mod events;
pub mod protocol;
pub mod session;
pub mod source;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use dispatch::NotificationDispatcher;
pub use endpoints::{Endpoint, EndpointTriple, SetupError};
pub use events::{LogLevel, NullObserver, TracingObserver, UpdateEvent, UpdateObserver};
pub use session::{SessionConfig, UpdateSession};
pub use source::{ChunkSource, FileSource, FirmwareLocation, MemorySource, SourceError};
pub use state::{SessionError, TransferMachine, TransferState, TransferSummary};
pub use transport::{GattTransport, MockTransport, SimulatedDevice, TransportError};
