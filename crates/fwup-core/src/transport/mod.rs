//! Transport layer module.

pub mod mock;
pub mod sim;
pub mod traits;

pub use mock::{MockCall, MockTransport};
pub use sim::SimulatedDevice;
pub use traits::{
    ChangedFields, Characteristic, GattTransport, Handle, TransportError, ValueChanged,
};
