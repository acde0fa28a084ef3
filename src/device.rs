//! Per-device lifecycle: open and renumeration, the firmware-version gate,
//! DSLogic FPGA configuration, and the configuration surface.

use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use crate::acquire::Acquisition;
use crate::profile::{self, Channel, DeviceMode, Profile, TestMode};
use crate::proto;
use crate::scan::{FoundDevice, ADDRESS_UNKNOWN};
use crate::trigger::DsTrigger;
use crate::usb::{UsbBus, UsbIo};
use crate::{Error, Result};

pub(crate) const CTRL_TIMEOUT: Duration = Duration::from_millis(100);
/// DSLogic start/stop and FPGA commands take longer to acknowledge.
pub(crate) const CTRL_TIMEOUT_SLOW: Duration = Duration::from_millis(3000);
pub(crate) const BULK_OUT_TIMEOUT: Duration = Duration::from_millis(1000);

const MAX_RENUM_DELAY: Duration = Duration::from_secs(3);
const RENUM_SETTLE: Duration = Duration::from_millis(300);
const RENUM_POLL: Duration = Duration::from_millis(100);
const FPGA_CONFIG_SETTLE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    Conn,
    DeviceMode,
    ExternalClock,
    TestMode,
    LogicAnalyzer,
    TriggerType,
    Samplerate,
    LimitSamples,
    Continuous,
    ScanOptions,
    DeviceOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    UInt64(u64),
    Int32(i32),
    Str(String),
    Bool(bool),
    Pair(u64, u64),
}

/// Result of [`Device::config_list`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigList {
    Keys(&'static [ConfigKey]),
    Samplerates(&'static [u64]),
    Names(&'static [&'static str]),
    TriggerType(&'static str),
}

static SCAN_OPTION_KEYS: [ConfigKey; 4] = [
    ConfigKey::Conn,
    ConfigKey::DeviceMode,
    ConfigKey::ExternalClock,
    ConfigKey::TestMode,
];

static DEVICE_OPTION_KEYS: [ConfigKey; 5] = [
    ConfigKey::LogicAnalyzer,
    ConfigKey::TriggerType,
    ConfigKey::Samplerate,
    ConfigKey::LimitSamples,
    ConfigKey::Continuous,
];

/// An opened, claimed device with verified firmware.
pub struct Device<U: UsbIo> {
    pub(crate) io: U,
    profile: &'static Profile,
    bus: u8,
    address: u8,
    pub(crate) channels: Vec<Channel>,
    samplerates: &'static [u64],
    pub(crate) cur_samplerate: u64,
    pub(crate) limit_samples: u64,
    pub(crate) sample_wide: bool,
    pub(crate) dslogic: bool,
    pub(crate) mode: DeviceMode,
    pub(crate) test: TestMode,
    pub(crate) ext_clock: bool,
    pub(crate) trigger: DsTrigger,
    /// DSLogic FPGA bitstream, streamed at every acquisition start.
    pub(crate) fpga_bitstream: std::path::PathBuf,
    pub(crate) acq: Option<Acquisition>,
}

impl<U: UsbIo> std::fmt::Debug for Device<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("profile", &self.profile)
            .field("bus", &self.bus)
            .field("address", &self.address)
            .field("channels", &self.channels)
            .field("cur_samplerate", &self.cur_samplerate)
            .field("limit_samples", &self.limit_samples)
            .field("sample_wide", &self.sample_wide)
            .field("dslogic", &self.dslogic)
            .field("mode", &self.mode)
            .field("test", &self.test)
            .field("ext_clock", &self.ext_clock)
            .field("trigger", &self.trigger)
            .field("fpga_bitstream", &self.fpga_bitstream)
            .field("acq", &self.acq)
            .finish()
    }
}

fn try_open<B: UsbBus>(
    bus: &mut B,
    found: &FoundDevice,
) -> Result<(B::Io, u8, proto::VersionInfo, u8)> {
    let mut skip = 0;
    for info in bus.devices()? {
        if info.vendor_id != found.profile.vid || info.product_id != found.profile.pid {
            continue;
        }
        if found.address == ADDRESS_UNKNOWN {
            // still enumerating after a firmware upload; pick by position
            if skip != found.index {
                skip += 1;
                continue;
            }
        } else if info.bus != found.bus || info.address != found.address {
            continue;
        }
        let mut io = bus.open(&info)?;
        let mut raw = [0u8; 2];
        let read = io.control_in(proto::CMD_GET_FW_VERSION, &mut raw, CTRL_TIMEOUT)?;
        if read < 2 {
            return Err(Error::Protocol("short firmware version report".into()));
        }
        let version = proto::VersionInfo::from_bytes(raw);
        let revid_request = if found.dslogic {
            proto::CMD_DSLOGIC_GET_REVID_VERSION
        } else {
            proto::CMD_GET_REVID_VERSION
        };
        let mut revid = [0u8; 1];
        io.control_in(revid_request, &mut revid, CTRL_TIMEOUT)?;
        return Ok((io, info.address, version, revid[0]));
    }
    Err(Error::Arg("device not found on the bus"))
}

impl<U: UsbIo> Device<U> {
    /// Open a scanned device: rescan the bus, find the unit, verify its
    /// firmware, claim the interface and (DSLogic) load the FPGA bitstream.
    ///
    /// After a firmware upload the FX2 drops off the bus and renumerates
    /// under a new address; opening retries for up to three seconds.
    pub fn open<B: UsbBus<Io = U>>(bus: &mut B, found: &mut FoundDevice) -> Result<Device<U>> {
        let (mut io, address, version, revid) = if let Some(uploaded) = found.fw_updated {
            log::info!("waiting for the device to renumerate");
            // the FX2 takes 300 ms or more to drop off the bus
            sleep(RENUM_SETTLE);
            loop {
                match try_open(bus, found) {
                    Ok(opened) => {
                        log::info!(
                            "device came back after {} ms",
                            uploaded.elapsed().as_millis()
                        );
                        break opened;
                    }
                    Err(error) => {
                        if uploaded.elapsed() >= MAX_RENUM_DELAY {
                            log::error!("device failed to renumerate");
                            return Err(error);
                        }
                        sleep(RENUM_POLL);
                    }
                }
            }
        } else {
            log::info!("firmware upload was not needed");
            try_open(bus, found)?
        };

        // major version changes mean incompatible request layouts; minor
        // versions are compatible with each other
        if version.major != proto::REQUIRED_FW_VERSION_MAJOR {
            return Err(Error::Protocol(format!(
                "expected firmware version {}.x, got {}.{}",
                proto::REQUIRED_FW_VERSION_MAJOR, version.major, version.minor
            )));
        }

        io.claim(proto::USB_INTERFACE)?;
        found.address = address;
        log::info!(
            "opened device on {}.{}, interface {}, firmware {}.{}",
            found.bus, address, proto::USB_INTERFACE, version.major, version.minor
        );
        log::info!(
            "detected REVID={}, it's a Cypress CY7C68013{}",
            revid,
            if revid != 1 { " (FX2)" } else { "A (FX2LP)" }
        );

        Ok(Device::with_io_inner(io, found))
    }

    fn with_io_inner(io: U, found: &FoundDevice) -> Device<U> {
        let samplerates: &'static [u64] = if found.dslogic {
            &profile::DSLOGIC_SAMPLERATES
        } else {
            &profile::SAMPLERATES
        };
        Device {
            io,
            profile: found.profile,
            bus: found.bus,
            address: found.address,
            channels: found.channels.clone(),
            samplerates,
            // default to the slowest rate until one is configured
            cur_samplerate: samplerates[0],
            limit_samples: 0,
            sample_wide: false,
            dslogic: found.dslogic,
            mode: found.mode,
            test: TestMode::None,
            ext_clock: false,
            trigger: DsTrigger::new(),
            fpga_bitstream: profile::firmware_dir().join(profile::FPGA_BITSTREAM),
            acq: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_io(io: U, found: &FoundDevice) -> Device<U> {
        Device::with_io_inner(io, found)
    }

    /// Put the FX2 into FPGA configuration mode and stream the bitstream.
    /// Runs as the first phase of every DSLogic acquisition start.
    pub fn configure_fpga(&mut self, bitstream: &Path) -> Result<()> {
        if !self.dslogic {
            return Err(Error::Unavailable("only the DSLogic carries an FPGA"));
        }
        log::info!("configuring FPGA from {}", bitstream.display());
        self.io
            .control_out(proto::CMD_DSLOGIC_CONFIG, &[], CTRL_TIMEOUT_SLOW)?;
        // the FX2 needs a moment before it accepts bitstream data
        sleep(FPGA_CONFIG_SETTLE);
        let data = std::fs::read(bitstream)?;
        for chunk in data.chunks(proto::FPGA_BITSTREAM_CHUNK) {
            let written = self
                .io
                .bulk_out(proto::EP_DSLOGIC_OUT, chunk, BULK_OUT_TIMEOUT)?;
            if written != chunk.len() {
                return Err(Error::Protocol(format!(
                    "short FPGA bitstream transfer: {} of {} bytes",
                    written,
                    chunk.len()
                )));
            }
            log::debug!("configured {} bytes", chunk.len());
        }
        log::info!("FPGA configuration done");
        Ok(())
    }

    pub fn profile(&self) -> &'static Profile {
        self.profile
    }

    pub fn is_dslogic(&self) -> bool {
        self.dslogic
    }

    pub fn device_mode(&self) -> DeviceMode {
        self.mode
    }

    pub fn samplerates(&self) -> &'static [u64] {
        self.samplerates
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [Channel] {
        &mut self.channels
    }

    /// The FPGA trigger matrix. Only meaningful on the DSLogic.
    pub fn trigger(&self) -> Result<&DsTrigger> {
        if !self.dslogic {
            return Err(Error::Unavailable("only the DSLogic has an FPGA trigger"));
        }
        Ok(&self.trigger)
    }

    pub fn trigger_mut(&mut self) -> Result<&mut DsTrigger> {
        if !self.dslogic {
            return Err(Error::Unavailable("only the DSLogic has an FPGA trigger"));
        }
        Ok(&mut self.trigger)
    }

    pub fn config_get(&self, key: ConfigKey) -> Result<ConfigValue> {
        match key {
            ConfigKey::Conn => {
                if self.address == ADDRESS_UNKNOWN {
                    // still renumerating; the future address is anyone's guess
                    return Err(Error::Unavailable("device address is not known yet"));
                }
                Ok(ConfigValue::Str(format!("{}.{}", self.bus, self.address)))
            }
            ConfigKey::Samplerate => Ok(ConfigValue::UInt64(self.cur_samplerate)),
            ConfigKey::LimitSamples => Ok(ConfigValue::UInt64(self.limit_samples)),
            ConfigKey::DeviceMode => Ok(ConfigValue::Str(self.mode.name().to_owned())),
            ConfigKey::ExternalClock => {
                if !self.dslogic {
                    return Err(Error::Unavailable("external clock requires a DSLogic"));
                }
                Ok(ConfigValue::Bool(self.ext_clock))
            }
            ConfigKey::TestMode => {
                if !self.dslogic {
                    return Err(Error::Unavailable("test modes require a DSLogic"));
                }
                Ok(ConfigValue::Str(self.test.name().to_owned()))
            }
            _ => Err(Error::Arg("unknown configuration key")),
        }
    }

    pub fn config_set(&mut self, key: ConfigKey, value: ConfigValue) -> Result<()> {
        match (key, value) {
            (ConfigKey::Samplerate, ConfigValue::UInt64(rate)) => {
                self.cur_samplerate = rate;
                Ok(())
            }
            (ConfigKey::LimitSamples, ConfigValue::UInt64(limit)) => {
                self.limit_samples = limit;
                Ok(())
            }
            (ConfigKey::ExternalClock, ConfigValue::Bool(enabled)) => {
                if !self.dslogic {
                    return Err(Error::Unavailable("external clock requires a DSLogic"));
                }
                self.ext_clock = enabled;
                Ok(())
            }
            (ConfigKey::TestMode, ConfigValue::Str(name)) => {
                if !self.dslogic {
                    return Err(Error::Unavailable("test modes require a DSLogic"));
                }
                self.test = TestMode::from_name(&name)
                    .ok_or(Error::Arg("unknown test mode name"))?;
                Ok(())
            }
            (
                ConfigKey::Samplerate
                | ConfigKey::LimitSamples
                | ConfigKey::ExternalClock
                | ConfigKey::TestMode,
                _,
            ) => Err(Error::Arg("wrong value type for this key")),
            _ => Err(Error::Arg("key cannot be set on an open device")),
        }
    }

    pub fn config_list(&self, key: ConfigKey) -> Result<ConfigList> {
        match key {
            ConfigKey::ScanOptions => Ok(ConfigList::Keys(&SCAN_OPTION_KEYS)),
            ConfigKey::DeviceOptions => Ok(ConfigList::Keys(&DEVICE_OPTION_KEYS)),
            ConfigKey::Samplerate => Ok(ConfigList::Samplerates(self.samplerates)),
            ConfigKey::TriggerType => Ok(ConfigList::TriggerType(profile::TRIGGER_TYPE)),
            ConfigKey::DeviceMode => Ok(ConfigList::Names(&DeviceMode::NAMES)),
            ConfigKey::TestMode => Ok(ConfigList::Names(&TestMode::NAMES)),
            _ => Err(Error::Arg("unknown configuration key")),
        }
    }

    pub fn close(self) {
        log::info!(
            "closing device on {}.{} interface {}",
            self.bus, self.address, proto::USB_INTERFACE
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::profile::find_profile;
    use crate::scan::FoundDevice;
    use crate::usb::mock::{MockBus, MockIo};
    use crate::usb::DeviceInfo;

    fn info(bus: u8, address: u8, vid: u16, pid: u16) -> DeviceInfo {
        DeviceInfo {
            bus,
            address,
            vendor_id: vid,
            product_id: pid,
            manufacturer: Some("sigrok".to_owned()),
            product: Some("fx2lafw".to_owned()),
        }
    }

    fn usbee_ax(bus: u8, address: u8) -> FoundDevice {
        let profile = find_profile(0x08a9, 0x0014, None, None).unwrap();
        FoundDevice {
            profile,
            index: 0,
            bus,
            address,
            dslogic: false,
            mode: DeviceMode::Logic,
            channels: profile::channel_list(profile, false, DeviceMode::Logic),
            fw_updated: None,
        }
    }

    #[test]
    fn test_open_claims_and_defaults() {
        let mut bus = MockBus::default();
        bus.devices.push(info(1, 7, 0x08a9, 0x0014));
        let io = MockIo::with_firmware(1, 3, proto::CMD_GET_REVID_VERSION, 1);
        let claimed = io.claimed.clone();
        bus.handles.push_back(io);
        let mut found = usbee_ax(1, 7);
        let device = Device::open(&mut bus, &mut found).unwrap();
        assert_eq!(*claimed.borrow(), vec![proto::USB_INTERFACE]);
        assert_eq!(device.cur_samplerate, 20_000);
        assert_eq!(bus.opened.len(), 1);
        assert_eq!(bus.opened[0].address, 7);
    }

    #[test]
    fn test_open_rejects_wrong_major_version_before_claim() {
        let mut bus = MockBus::default();
        bus.devices.push(info(1, 7, 0x08a9, 0x0014));
        let io = MockIo::with_firmware(proto::REQUIRED_FW_VERSION_MAJOR + 1, 0,
            proto::CMD_GET_REVID_VERSION, 1);
        let claimed = io.claimed.clone();
        bus.handles.push_back(io);
        let mut found = usbee_ax(1, 7);
        let error = Device::open(&mut bus, &mut found).unwrap_err();
        assert!(matches!(error, Error::Protocol(_)), "{:?}", error);
        assert!(claimed.borrow().is_empty());
    }

    #[test]
    fn test_open_matches_by_bus_address() {
        let mut bus = MockBus::default();
        bus.devices.push(info(1, 4, 0x08a9, 0x0014));
        bus.devices.push(info(1, 7, 0x08a9, 0x0014));
        bus.handles
            .push_back(MockIo::with_firmware(1, 0, proto::CMD_GET_REVID_VERSION, 1));
        let mut found = usbee_ax(1, 7);
        Device::open(&mut bus, &mut found).unwrap();
        assert_eq!(bus.opened[0].address, 7);
    }

    #[test]
    fn test_open_by_index_adopts_address() {
        let mut bus = MockBus::default();
        bus.devices.push(info(1, 4, 0x08a9, 0x0014));
        bus.devices.push(info(1, 9, 0x08a9, 0x0014));
        bus.handles
            .push_back(MockIo::with_firmware(1, 0, proto::CMD_GET_REVID_VERSION, 1));
        let mut found = usbee_ax(1, ADDRESS_UNKNOWN);
        found.index = 1;
        Device::open(&mut bus, &mut found).unwrap();
        assert_eq!(bus.opened[0].address, 9);
        assert_eq!(found.address, 9);
    }

    #[test]
    fn test_open_missing_device() {
        let mut bus = MockBus::default();
        let mut found = usbee_ax(1, 7);
        assert!(matches!(
            Device::open(&mut bus, &mut found),
            Err(Error::Arg(_))
        ));
    }

    #[test]
    fn test_config_surface_base_device() {
        let mut found = usbee_ax(1, 7);
        found.address = 7;
        let mut device = Device::with_io(MockIo::new(), &found);

        device
            .config_set(ConfigKey::Samplerate, ConfigValue::UInt64(1_000_000))
            .unwrap();
        device
            .config_set(ConfigKey::LimitSamples, ConfigValue::UInt64(1024))
            .unwrap();
        assert_eq!(
            device.config_get(ConfigKey::Samplerate).unwrap(),
            ConfigValue::UInt64(1_000_000)
        );
        assert_eq!(
            device.config_get(ConfigKey::Conn).unwrap(),
            ConfigValue::Str("1.7".to_owned())
        );
        // DSLogic-only settings are refused, with the right error kind
        assert!(matches!(
            device.config_set(ConfigKey::ExternalClock, ConfigValue::Bool(true)),
            Err(Error::Unavailable(_))
        ));
        assert!(matches!(
            device.config_get(ConfigKey::TestMode),
            Err(Error::Unavailable(_))
        ));
        assert!(matches!(
            device.config_set(ConfigKey::Samplerate, ConfigValue::Bool(true)),
            Err(Error::Arg(_))
        ));
        assert!(matches!(device.trigger_mut(), Err(Error::Unavailable(_))));
    }

    #[test]
    fn test_config_list() {
        let found = usbee_ax(1, 7);
        let device = Device::with_io(MockIo::new(), &found);
        assert_eq!(
            device.config_list(ConfigKey::Samplerate).unwrap(),
            ConfigList::Samplerates(&profile::SAMPLERATES[..])
        );
        assert_eq!(
            device.config_list(ConfigKey::TriggerType).unwrap(),
            ConfigList::TriggerType("01")
        );
        assert!(matches!(
            device.config_list(ConfigKey::ScanOptions).unwrap(),
            ConfigList::Keys(keys) if keys.contains(&ConfigKey::Conn)
        ));
        assert!(matches!(
            device.config_list(ConfigKey::DeviceMode).unwrap(),
            ConfigList::Names(names) if names.contains(&"Oscilloscope")
        ));
        assert!(device.config_list(ConfigKey::Continuous).is_err());
    }
}
