//! Static knowledge about the supported hardware: the profile table, the
//! samplerate tables, and the channel model.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        /// The device samples 16 logic channels rather than 8.
        const WIDE_16BIT = 1 << 0;
    }
}

/// One entry of the supported-hardware table.
#[derive(Debug, PartialEq, Eq)]
pub struct Profile {
    pub vid: u16,
    pub pid: u16,
    pub vendor: &'static str,
    pub model: &'static str,
    pub model_version: Option<&'static str>,
    /// Firmware file name, resolved against the firmware directory.
    pub firmware: &'static str,
    pub caps: Caps,
    /// When set, the USB string descriptors must match too. This tells the
    /// renumerated DSLogic apart from a Saleae Logic on the same VID.PID.
    pub usb_manufacturer: Option<&'static str>,
    pub usb_product: Option<&'static str>,
}

/// Table order is significant: the first matching entry wins.
pub static PROFILES: [Profile; 8] = [
    // CWAV USBee AX, EE Electronics ESLA201A, ARMFLY AX-Pro
    Profile {
        vid: 0x08a9, pid: 0x0014,
        vendor: "CWAV", model: "USBee AX", model_version: None,
        firmware: "fx2lafw-cwav-usbeeax.fw",
        caps: Caps::empty(),
        usb_manufacturer: None, usb_product: None,
    },
    // CWAV USBee DX, XZL-Studio DX
    Profile {
        vid: 0x08a9, pid: 0x0015,
        vendor: "CWAV", model: "USBee DX", model_version: None,
        firmware: "fx2lafw-cwav-usbeedx.fw",
        caps: Caps::WIDE_16BIT,
        usb_manufacturer: None, usb_product: None,
    },
    // CWAV USBee SX
    Profile {
        vid: 0x08a9, pid: 0x0009,
        vendor: "CWAV", model: "USBee SX", model_version: None,
        firmware: "fx2lafw-cwav-usbeesx.fw",
        caps: Caps::empty(),
        usb_manufacturer: None, usb_product: None,
    },
    // DreamSourceLab DSLogic before firmware upload
    Profile {
        vid: 0x2a0e, pid: 0x0001,
        vendor: "DreamSourceLab", model: "DSLogic", model_version: None,
        firmware: "dreamsourcelab-dslogic-fx2.fw",
        caps: Caps::WIDE_16BIT,
        usb_manufacturer: None, usb_product: None,
    },
    // DreamSourceLab DSLogic after firmware upload
    Profile {
        vid: 0x0925, pid: 0x3881,
        vendor: "DreamSourceLab", model: "DSLogic", model_version: None,
        firmware: "dreamsourcelab-dslogic-fx2.fw",
        caps: Caps::WIDE_16BIT,
        usb_manufacturer: Some("DreamSourceLab"), usb_product: Some("DSLogic"),
    },
    // Saleae Logic, EE Electronics ESLA100, Robomotic MiniLogic/BugLogic 3
    Profile {
        vid: 0x0925, pid: 0x3881,
        vendor: "Saleae", model: "Logic", model_version: None,
        firmware: "fx2lafw-saleae-logic.fw",
        caps: Caps::empty(),
        usb_manufacturer: None, usb_product: None,
    },
    // Default Cypress FX2 without EEPROM, e.g. Lcsoft Mini Board
    Profile {
        vid: 0x04b4, pid: 0x8613,
        vendor: "Cypress", model: "FX2", model_version: None,
        firmware: "fx2lafw-cypress-fx2.fw",
        caps: Caps::WIDE_16BIT,
        usb_manufacturer: None, usb_product: None,
    },
    // Braintechnology USB-LPS
    Profile {
        vid: 0x16d0, pid: 0x0498,
        vendor: "Braintechnology", model: "USB-LPS", model_version: None,
        firmware: "fx2lafw-braintechnology-usb-lps.fw",
        caps: Caps::WIDE_16BIT,
        usb_manufacturer: None, usb_product: None,
    },
];

/// First profile matching the descriptor, honoring required USB strings.
pub fn find_profile(
    vid: u16,
    pid: u16,
    manufacturer: Option<&str>,
    product: Option<&str>,
) -> Option<&'static Profile> {
    PROFILES.iter().find(|profile| {
        profile.vid == vid
            && profile.pid == pid
            && profile
                .usb_manufacturer
                .map_or(true, |required| manufacturer == Some(required))
            && profile
                .usb_product
                .map_or(true, |required| product == Some(required))
    })
}

const fn khz(rate: u64) -> u64 {
    rate * 1_000
}

const fn mhz(rate: u64) -> u64 {
    rate * 1_000_000
}

pub static SAMPLERATES: [u64; 16] = [
    khz(20), khz(25), khz(50), khz(100), khz(200), khz(250), khz(500),
    mhz(1), mhz(2), mhz(3), mhz(4), mhz(6), mhz(8), mhz(12), mhz(16), mhz(24),
];

pub static DSLOGIC_SAMPLERATES: [u64; 16] = [
    khz(10), khz(20), khz(50), khz(100), khz(200), khz(500),
    mhz(1), mhz(2), mhz(5), mhz(10), mhz(20), mhz(25), mhz(50),
    mhz(100), mhz(200), mhz(400),
];

/// Trigger symbols understood by the software matcher.
pub const TRIGGER_TYPE: &str = "01";

/// DSLogic FPGA bitstream file name, resolved like profile firmware.
pub const FPGA_BITSTREAM: &str = "dreamsourcelab-dslogic-fpga.bitstream";

/// Directory holding firmware and bitstream files. Overridable through the
/// `FX2LA_FIRMWARE_DIR` environment variable.
pub fn firmware_dir() -> std::path::PathBuf {
    std::env::var_os("FX2LA_FIRMWARE_DIR")
        .map(Into::into)
        .unwrap_or_else(|| std::path::PathBuf::from("firmware"))
}

/// DSLogic operating modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceMode {
    /// Logic analyzer, 16 logic channels.
    #[default]
    Logic,
    /// Oscilloscope, 2 analog channels.
    Dso,
    /// Data acquisition, 9 analog channels.
    Analog,
}

impl DeviceMode {
    pub const NAMES: [&'static str; 3] =
        ["Logic Analyzer", "Oscilloscope", "Data Acquisition"];

    pub fn name(self) -> &'static str {
        Self::NAMES[self as usize]
    }

    pub fn from_name(name: &str) -> Option<DeviceMode> {
        match name {
            "Logic Analyzer" => Some(DeviceMode::Logic),
            "Oscilloscope" => Some(DeviceMode::Dso),
            "Data Acquisition" => Some(DeviceMode::Analog),
            _ => None,
        }
    }
}

/// DSLogic self-test modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestMode {
    #[default]
    None,
    /// Internally generated counting pattern.
    Internal,
    /// Externally fed counting pattern.
    External,
    /// DRAM loopback.
    Loopback,
}

impl TestMode {
    pub const NAMES: [&'static str; 4] =
        ["None", "Internal Test", "External Test", "DRAM Loopback Test"];

    pub fn name(self) -> &'static str {
        Self::NAMES[self as usize]
    }

    pub fn from_name(name: &str) -> Option<TestMode> {
        match name {
            "None" => Some(TestMode::None),
            "Internal Test" => Some(TestMode::Internal),
            "External Test" => Some(TestMode::External),
            "DRAM Loopback Test" => Some(TestMode::Loopback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Logic,
    Analog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub index: u8,
    pub kind: ChannelKind,
    pub enabled: bool,
    pub name: String,
    /// Per-channel software trigger pattern, one `'0'`/`'1'` per stage.
    pub trigger: Option<String>,
}

/// Build the channel list for a matched profile. DSLogic channels outside
/// logic mode are analog.
pub fn channel_list(profile: &Profile, dslogic: bool, mode: DeviceMode) -> Vec<Channel> {
    let count = if profile.caps.contains(Caps::WIDE_16BIT) { 16 } else { 8 };
    let kind = if dslogic && mode != DeviceMode::Logic {
        ChannelKind::Analog
    } else {
        ChannelKind::Logic
    };
    (0..count)
        .map(|index| Channel {
            index,
            kind,
            enabled: true,
            name: index.to_string(),
            trigger: None,
        })
        .collect()
}
