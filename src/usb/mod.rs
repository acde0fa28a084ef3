//! Transport seam between the protocol state machine and the USB backend.
//!
//! The core drives a device exclusively through [`UsbIo`]; enumeration and
//! opening go through [`UsbBus`]. The real backend lives in [`imp`] and is
//! built on `nusb`; tests script a mock instead.

use std::time::Duration;

use crate::Result;

#[path = "nusb.rs"]
pub mod imp;

#[cfg(test)]
pub(crate) mod mock;

/// A device as seen on the bus, before a profile has been matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Opaque handle to one queued bulk-in transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    /// The transfer timed out; any data it carries is still valid.
    TimedOut,
    Cancelled,
    /// The device is gone from the bus.
    NoDevice,
    Error,
}

/// One finished bulk-in transfer. `data` is owned by the receiver.
#[derive(Debug)]
pub struct Completion {
    pub id: TransferId,
    pub status: TransferStatus,
    pub data: Vec<u8>,
}

/// Everything the acquisition core needs from an open device.
///
/// Control transfers are synchronous vendor requests with `wValue` and
/// `wIndex` zero. Bulk-in transfers are single shot and complete through
/// [`UsbIo::poll`], in submission order per endpoint.
pub trait UsbIo {
    fn claim(&mut self, interface: u8) -> Result<()>;

    fn control_out(&mut self, request: u8, data: &[u8], timeout: Duration) -> Result<()>;
    fn control_in(&mut self, request: u8, data: &mut [u8], timeout: Duration) -> Result<usize>;

    fn bulk_out(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;

    fn submit_bulk_in(&mut self, endpoint: u8, length: usize) -> Result<TransferId>;

    /// Request cancellation. The transfer still drains through `poll` with
    /// [`TransferStatus::Cancelled`].
    fn cancel(&mut self, id: TransferId);

    /// Wait up to `timeout` for one completion. `None` means nothing
    /// finished in time.
    fn poll(&mut self, timeout: Duration) -> Option<Completion>;
}

/// Bus-level enumeration and opening.
pub trait UsbBus {
    type Io: UsbIo;

    fn devices(&mut self) -> Result<Vec<DeviceInfo>>;

    /// Open the device. The interface is claimed separately, after the
    /// firmware version has been verified.
    fn open(&mut self, info: &DeviceInfo) -> Result<Self::Io>;
}

/// Uploads device firmware over the vendor pre-boot interface. The upload
/// mechanism itself is not part of this crate.
pub trait FirmwareLoader {
    fn upload(&mut self, info: &DeviceInfo, firmware: &str) -> Result<()>;
}

/// Loader for hosts where every supported device already runs its firmware.
pub struct NoFirmware;

impl FirmwareLoader for NoFirmware {
    fn upload(&mut self, _info: &DeviceInfo, _firmware: &str) -> Result<()> {
        Err(crate::Error::Unavailable("firmware upload is not built into this host"))
    }
}
