//! Logical endpoints of the update service and their resolution.

use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::constants::{
    FWUPDATE_BOOT_NOTIFY_UUID, FWUPDATE_CONTROL_UUID, FWUPDATE_SERVICE_UUID,
    FWUPDATE_VERSION_UUID,
};
use crate::transport::{Characteristic, GattTransport, Handle, TransportError};

/// The three channels of the update service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Chunk writes and offset readback.
    Control,
    /// Running firmware version.
    VersionRead,
    /// Asynchronous boot notification.
    BootNotify,
}

impl Endpoint {
    pub const ALL: [Endpoint; 3] = [Endpoint::Control, Endpoint::VersionRead, Endpoint::BootNotify];

    pub fn uuid(&self) -> Uuid {
        match self {
            Endpoint::Control => FWUPDATE_CONTROL_UUID,
            Endpoint::VersionRead => FWUPDATE_VERSION_UUID,
            Endpoint::BootNotify => FWUPDATE_BOOT_NOTIFY_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.uuid() == uuid)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Control => write!(f, "control"),
            Endpoint::VersionRead => write!(f, "version-read"),
            Endpoint::BootNotify => write!(f, "boot-notify"),
        }
    }
}

/// Fatal errors raised before a session starts.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Update service characteristic missing: {0} ({})", .0.uuid())]
    MissingEndpoint(Endpoint),

    #[error("No firmware image configured")]
    MissingFirmware,

    #[error("Service discovery failed: {0}")]
    Transport(#[from] TransportError),
}

/// Resolved handles for all three endpoints. Fixed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointTriple {
    pub control: Handle,
    pub version_read: Handle,
    pub boot_notify: Handle,
}

impl EndpointTriple {
    /// Build the triple from a service's characteristic list.
    ///
    /// Unknown characteristics are skipped.
    pub fn from_characteristics(chrcs: &[Characteristic]) -> Result<Self, SetupError> {
        let mut control = None;
        let mut version_read = None;
        let mut boot_notify = None;

        for chrc in chrcs {
            match Endpoint::from_uuid(chrc.uuid) {
                Some(Endpoint::Control) => control = Some(chrc.handle),
                Some(Endpoint::VersionRead) => version_read = Some(chrc.handle),
                Some(Endpoint::BootNotify) => boot_notify = Some(chrc.handle),
                None => warn!(uuid = %chrc.uuid, "Unrecognized characteristic"),
            }
        }

        Ok(Self {
            control: control.ok_or(SetupError::MissingEndpoint(Endpoint::Control))?,
            version_read: version_read.ok_or(SetupError::MissingEndpoint(Endpoint::VersionRead))?,
            boot_notify: boot_notify.ok_or(SetupError::MissingEndpoint(Endpoint::BootNotify))?,
        })
    }

    /// Discover the update service on `transport` and resolve its endpoints.
    pub fn resolve<T: GattTransport + ?Sized>(transport: &T) -> Result<Self, SetupError> {
        let chrcs = transport.characteristics(FWUPDATE_SERVICE_UUID)?;
        let triple = Self::from_characteristics(&chrcs)?;
        debug!(?triple, "Resolved update service endpoints");
        Ok(triple)
    }

    pub fn handle(&self, endpoint: Endpoint) -> Handle {
        match endpoint {
            Endpoint::Control => self.control,
            Endpoint::VersionRead => self.version_read,
            Endpoint::BootNotify => self.boot_notify,
        }
    }

    pub fn endpoint(&self, handle: Handle) -> Option<Endpoint> {
        Endpoint::ALL.into_iter().find(|&e| self.handle(e) == handle)
    }
}
