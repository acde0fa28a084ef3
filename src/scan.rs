//! Bus scan: profile matching, firmware-presence probing, upload dispatch.

use std::time::Instant;

use crate::device::{ConfigKey, ConfigValue};
use crate::profile::{self, Channel, DeviceMode, Profile};
use crate::usb::{DeviceInfo, FirmwareLoader, UsbBus};
use crate::{Error, Result};

/// Bus address of a device that has not renumerated yet.
pub const ADDRESS_UNKNOWN: u8 = 0xff;

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Restrict the scan to a single `bus.address`.
    pub conn: Option<(u8, u8)>,
    /// DSLogic operating mode; ignored for other devices.
    pub mode: DeviceMode,
}

impl ScanOptions {
    pub fn from_config(options: &[(ConfigKey, ConfigValue)]) -> Result<ScanOptions> {
        let mut scan = ScanOptions::default();
        for (key, value) in options {
            match (key, value) {
                (ConfigKey::Conn, ConfigValue::Str(conn)) => {
                    scan.conn = Some(parse_conn(conn)?);
                }
                (ConfigKey::DeviceMode, ConfigValue::Str(name)) => {
                    scan.mode = DeviceMode::from_name(name)
                        .ok_or(Error::Arg("unknown device mode name"))?;
                }
                _ => return Err(Error::Arg("unsupported scan option")),
            }
        }
        Ok(scan)
    }
}

pub fn parse_conn(conn: &str) -> Result<(u8, u8)> {
    let (bus, address) = conn
        .split_once('.')
        .ok_or(Error::Arg("connection must be <bus>.<address>"))?;
    let bus = bus
        .parse()
        .map_err(|_| Error::Arg("connection bus is not a number"))?;
    let address = address
        .parse()
        .map_err(|_| Error::Arg("connection address is not a number"))?;
    Ok((bus, address))
}

/// A matched device, possibly still renumerating after a firmware upload.
#[derive(Debug)]
pub struct FoundDevice {
    pub profile: &'static Profile,
    /// Position among same-VID.PID candidates; identifies the unit at open
    /// time while its post-upload address is still unknown.
    pub index: usize,
    pub bus: u8,
    /// [`ADDRESS_UNKNOWN`] until the device has renumerated.
    pub address: u8,
    pub dslogic: bool,
    pub mode: DeviceMode,
    pub channels: Vec<Channel>,
    /// When firmware was uploaded during this scan.
    pub fw_updated: Option<Instant>,
}

/// Whether the device already runs an fx2lafw-compatible firmware, judged
/// by its USB string descriptors.
fn firmware_resident(info: &DeviceInfo) -> bool {
    let manufacturer = info
        .manufacturer
        .as_deref()
        .is_some_and(|s| s.starts_with("sigrok") || s.starts_with("DreamSourceLab"));
    let product = info
        .product
        .as_deref()
        .is_some_and(|s| s.starts_with("fx2lafw") || s.starts_with("DSLogic"));
    manufacturer && product
}

/// Walk the bus and return every supported device. Devices without resident
/// firmware get it uploaded here; they come back with an unknown address and
/// a fresh `fw_updated` stamp, and renumerate during `Device::open`.
pub fn scan<B: UsbBus>(
    bus: &mut B,
    loader: &mut dyn FirmwareLoader,
    options: &ScanOptions,
) -> Result<Vec<FoundDevice>> {
    let mut found: Vec<FoundDevice> = Vec::new();
    for info in bus.devices()? {
        if let Some((want_bus, want_address)) = options.conn {
            if info.bus != want_bus || info.address != want_address {
                continue;
            }
        }
        let Some(profile) = profile::find_profile(
            info.vendor_id,
            info.product_id,
            info.manufacturer.as_deref(),
            info.product.as_deref(),
        ) else {
            continue;
        };
        let dslogic = profile.model == "DSLogic";
        let mode = if dslogic { options.mode } else { DeviceMode::Logic };
        let index = found
            .iter()
            .filter(|device| {
                device.profile.vid == profile.vid && device.profile.pid == profile.pid
            })
            .count();
        let mut device = FoundDevice {
            profile,
            index,
            bus: info.bus,
            address: ADDRESS_UNKNOWN,
            dslogic,
            mode,
            channels: profile::channel_list(profile, dslogic, mode),
            fw_updated: None,
        };
        if firmware_resident(&info) {
            log::debug!("found an fx2lafw device at {}.{}", info.bus, info.address);
            device.address = info.address;
        } else {
            match loader.upload(&info, profile.firmware) {
                Ok(()) => device.fw_updated = Some(Instant::now()),
                Err(error) => log::error!(
                    "firmware upload failed for {} {}: {}",
                    profile.vendor, profile.model, error
                ),
            }
        }
        found.push(device);
    }
    Ok(found)
}
