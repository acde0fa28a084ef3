//! Vendor protocol: request codes, the start command, the sample-clock
//! solver, and the packed frames exchanged with the DSLogic FPGA.

use bitflags::bitflags;

use crate::trigger::{DsTrigger, TriggerMode, NUM_TRIGGER_STAGES, STAGES};
use crate::{Error, Result};

pub const USB_INTERFACE: u8 = 0;

pub const CMD_GET_FW_VERSION: u8 = 0xb0;
pub const CMD_START: u8 = 0xb1;
pub const CMD_GET_REVID_VERSION: u8 = 0xb2;

// The DSLogic firmware reuses the same code points with shifted meanings.
pub const CMD_DSLOGIC_GET_REVID_VERSION: u8 = 0xb1;
pub const CMD_DSLOGIC_START: u8 = 0xb2;
pub const CMD_DSLOGIC_CONFIG: u8 = 0xb3;
pub const CMD_DSLOGIC_SETTING: u8 = 0xb4;

pub const EP_DATA_IN: u8 = 0x82;
pub const EP_DSLOGIC_IN: u8 = 0x86;
pub const EP_DSLOGIC_OUT: u8 = 0x02;

pub const REQUIRED_FW_VERSION_MAJOR: u8 = 1;

pub const MAX_8BIT_SAMPLE_RATE: u64 = 24_000_000;
pub const MAX_16BIT_SAMPLE_RATE: u64 = 12_000_000;

/// 6 delay states of up to 256 clock ticks.
pub const MAX_SAMPLE_DELAY: u64 = 6 * 256;

/// The DSLogic bitstream is streamed to the FX2 in chunks of this size.
pub const FPGA_BITSTREAM_CHUNK: usize = 340604;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StartFlags: u8 {
        /// 16-bit samples (8-bit when clear).
        const SAMPLE_16BIT = 1 << 5;
        /// 48 MHz base clock (30 MHz when clear).
        const CLK_48MHZ    = 1 << 6;
        /// DSLogic only: stop the running acquisition.
        const DSLOGIC_STOP = 1 << 7;
    }
}

/// Firmware version report (`CMD_GET_FW_VERSION`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub major: u8,
    pub minor: u8,
}

impl VersionInfo {
    pub fn from_bytes(raw: [u8; 2]) -> VersionInfo {
        VersionInfo { major: raw[0], minor: raw[1] }
    }
}

/// Payload of the start request: flags plus the GPIF sample delay,
/// big-endian within its two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartCmd {
    pub flags: StartFlags,
    pub delay: u16,
}

impl StartCmd {
    pub fn dslogic_stop() -> StartCmd {
        StartCmd { flags: StartFlags::DSLOGIC_STOP, delay: 0 }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.flags.bits(), (self.delay >> 8) as u8, self.delay as u8]
    }
}

/// Solve for the GPIF delay and clock source of the base variant.
///
/// The 48 MHz clock is preferred; if the rate does not divide it, or the
/// divided delay exceeds the GPIF waveform limit, the 30 MHz clock is
/// tried instead. The result is a pure function of the inputs.
pub fn sample_delay(samplerate: u64, wide: bool) -> Result<StartCmd> {
    let width_flag = if wide { StartFlags::SAMPLE_16BIT } else { StartFlags::empty() };
    if samplerate == 0 || samplerate > MAX_8BIT_SAMPLE_RATE {
        return Err(Error::Protocol(format!("cannot sample at {} Hz", samplerate)));
    }
    if wide && samplerate > MAX_16BIT_SAMPLE_RATE {
        return Err(Error::Protocol(format!(
            "cannot sample at {} Hz when collecting 16-bit samples", samplerate)));
    }
    const MHZ_48: u64 = 48_000_000;
    const MHZ_30: u64 = 30_000_000;
    if MHZ_48 % samplerate == 0 {
        let delay = MHZ_48 / samplerate - 1;
        if delay > 0 && delay <= MAX_SAMPLE_DELAY {
            return Ok(StartCmd { flags: StartFlags::CLK_48MHZ | width_flag, delay: delay as u16 });
        }
    }
    if MHZ_30 % samplerate == 0 {
        let delay = MHZ_30 / samplerate - 1;
        if delay > 0 && delay <= MAX_SAMPLE_DELAY {
            return Ok(StartCmd { flags: width_flag, delay: delay as u16 });
        }
    }
    Err(Error::Protocol(format!("cannot sample at {} Hz", samplerate)))
}

/// FPGA base clock the DSLogic divides for sampling.
pub fn clock_divider(samplerate: u64) -> u32 {
    const MHZ_100: u64 = 100_000_000;
    (MHZ_100.div_ceil(samplerate)) as u32
}

/// Compose the `mode` word of the settings frame.
pub fn mode_word(
    trigger_en: bool,
    test: crate::profile::TestMode,
    mode: crate::profile::DeviceMode,
    ext_clock: bool,
    samplerate: u64,
) -> u16 {
    use crate::profile::{DeviceMode, TestMode};
    let ext_test = test == TestMode::External;
    let loopback = test == TestMode::Loopback;
    let analog = mode == DeviceMode::Analog;
    ((ext_test as u16) << 15)
        | ((ext_test as u16) << 14)
        | ((loopback as u16) << 13)
        | trigger_en as u16
        | (((mode != DeviceMode::Logic) as u16) << 4)
        | ((ext_clock as u16) << 1)
        | ((((samplerate == 200_000_000) || analog) as u16) << 5)
        | (((samplerate == 400_000_000) as u16) << 6)
        | ((analog as u16) << 7)
}

const SETTING_SYNC: u32 = 0xffff_ffff;
const SETTING_MODE_HEADER: u16 = 0x0001;
const SETTING_DIVIDER_HEADER: u32 = 0x0102_ffff;
const SETTING_COUNT_HEADER: u32 = 0x0302_ffff;
const SETTING_TRIG_POS_HEADER: u32 = 0x0502_ffff;
const SETTING_TRIG_GLB_HEADER: u16 = 0x0701;
const SETTING_TRIG_ADP_HEADER: u32 = 0x0a02_ffff;
const SETTING_TRIG_SDA_HEADER: u32 = 0x0c02_ffff;
const SETTING_TRIG_MASK0_HEADER: u32 = 0x1010_ffff;
const SETTING_TRIG_MASK1_HEADER: u32 = 0x1110_ffff;
const SETTING_TRIG_VALUE0_HEADER: u32 = 0x1410_ffff;
const SETTING_TRIG_VALUE1_HEADER: u32 = 0x1510_ffff;
const SETTING_TRIG_EDGE0_HEADER: u32 = 0x1810_ffff;
const SETTING_TRIG_EDGE1_HEADER: u32 = 0x1910_ffff;
const SETTING_TRIG_COUNT0_HEADER: u32 = 0x1c10_ffff;
const SETTING_TRIG_COUNT1_HEADER: u32 = 0x1d10_ffff;
const SETTING_TRIG_LOGIC0_HEADER: u32 = 0x2010_ffff;
const SETTING_TRIG_LOGIC1_HEADER: u32 = 0x2110_ffff;
const SETTING_END_SYNC: u32 = 0x0000_0000;

/// The packed settings frame written to bulk-out endpoint 2 before a
/// DSLogic acquisition. Sixteen plane entries per section; entries beyond
/// the active stages hold neutral values the matcher ignores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpgaSettings {
    pub mode: u16,
    pub divider: u32,
    pub count: u32,
    pub trig_pos: u32,
    pub trig_glb: u16,
    pub trig_adp: u32,
    pub trig_sda: u32,
    pub mask0: [u16; STAGES],
    pub mask1: [u16; STAGES],
    pub value0: [u16; STAGES],
    pub value1: [u16; STAGES],
    pub edge0: [u16; STAGES],
    pub edge1: [u16; STAGES],
    pub count0: [u16; STAGES],
    pub count1: [u16; STAGES],
    pub logic0: [u16; STAGES],
    pub logic1: [u16; STAGES],
}

impl FpgaSettings {
    pub const BYTE_LEN: usize = 416;

    /// Length of the serialized frame in 16-bit words, as reported in the
    /// `CMD_DSLOGIC_SETTING` payload.
    pub const WORD_COUNT: u32 = (Self::BYTE_LEN / 2) as u32;

    pub fn new(
        trigger: &DsTrigger,
        mode: u16,
        divider: u32,
        count: u32,
        trig_pos: u32,
    ) -> FpgaSettings {
        let mut settings = FpgaSettings {
            mode,
            divider,
            count,
            trig_pos,
            trig_glb: trigger.stages(),
            trig_adp: count.wrapping_sub(trig_pos).wrapping_sub(1),
            trig_sda: 0,
            mask0: [1; STAGES],
            mask1: [1; STAGES],
            value0: [0; STAGES],
            value1: [0; STAGES],
            edge0: [0; STAGES],
            edge1: [0; STAGES],
            count0: [0; STAGES],
            count1: [0; STAGES],
            logic0: [2; STAGES],
            logic1: [2; STAGES],
        };
        match trigger.mode() {
            TriggerMode::Simple => settings.fill_plane(trigger, 0, STAGES),
            TriggerMode::Advanced => {
                for stage in 0..NUM_TRIGGER_STAGES {
                    settings.fill_plane(trigger, stage, stage);
                }
            }
        }
        settings
    }

    fn fill_plane(&mut self, trigger: &DsTrigger, index: usize, stage: usize) {
        self.mask0[index] = trigger.mask0(stage);
        self.mask1[index] = trigger.mask1(stage);
        self.value0[index] = trigger.value0(stage);
        self.value1[index] = trigger.value1(stage);
        self.edge0[index] = trigger.edge0(stage);
        self.edge1[index] = trigger.edge1(stage);
        self.count0[index] = trigger.count0(stage);
        self.count1[index] = trigger.count1(stage);
        self.logic0[index] = trigger.logic0(stage);
        self.logic1[index] = trigger.logic1(stage);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::BYTE_LEN);
        fn u16le(out: &mut Vec<u8>, value: u16) {
            out.extend_from_slice(&value.to_le_bytes());
        }
        fn u32le(out: &mut Vec<u8>, value: u32) {
            out.extend_from_slice(&value.to_le_bytes());
        }
        fn plane(out: &mut Vec<u8>, header: u32, values: &[u16; STAGES]) {
            u32le(out, header);
            for &value in values {
                u16le(out, value);
            }
        }
        u32le(&mut out, SETTING_SYNC);
        u16le(&mut out, SETTING_MODE_HEADER);
        u16le(&mut out, self.mode);
        u32le(&mut out, SETTING_DIVIDER_HEADER);
        u32le(&mut out, self.divider);
        u32le(&mut out, SETTING_COUNT_HEADER);
        u32le(&mut out, self.count);
        u32le(&mut out, SETTING_TRIG_POS_HEADER);
        u32le(&mut out, self.trig_pos);
        u16le(&mut out, SETTING_TRIG_GLB_HEADER);
        u16le(&mut out, self.trig_glb);
        u32le(&mut out, SETTING_TRIG_ADP_HEADER);
        u32le(&mut out, self.trig_adp);
        u32le(&mut out, SETTING_TRIG_SDA_HEADER);
        u32le(&mut out, self.trig_sda);
        plane(&mut out, SETTING_TRIG_MASK0_HEADER, &self.mask0);
        plane(&mut out, SETTING_TRIG_MASK1_HEADER, &self.mask1);
        plane(&mut out, SETTING_TRIG_VALUE0_HEADER, &self.value0);
        plane(&mut out, SETTING_TRIG_VALUE1_HEADER, &self.value1);
        plane(&mut out, SETTING_TRIG_EDGE0_HEADER, &self.edge0);
        plane(&mut out, SETTING_TRIG_EDGE1_HEADER, &self.edge1);
        plane(&mut out, SETTING_TRIG_COUNT0_HEADER, &self.count0);
        plane(&mut out, SETTING_TRIG_COUNT1_HEADER, &self.count1);
        plane(&mut out, SETTING_TRIG_LOGIC0_HEADER, &self.logic0);
        plane(&mut out, SETTING_TRIG_LOGIC1_HEADER, &self.logic1);
        u32le(&mut out, SETTING_END_SYNC);
        debug_assert_eq!(out.len(), Self::BYTE_LEN);
        out
    }
}

/// First frame on the DSLogic data endpoint: where the hardware trigger
/// fired, plus the first block of captured memory. Forwarded verbatim as
/// the trigger packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerPos {
    pub real_pos: u32,
    pub ram_saddr: u32,
    pub first_block: [u8; 504],
}

impl TriggerPos {
    pub const BYTE_LEN: usize = 512;

    pub fn from_bytes(raw: &[u8]) -> Option<TriggerPos> {
        if raw.len() < Self::BYTE_LEN {
            return None;
        }
        let mut first_block = [0u8; 504];
        first_block.copy_from_slice(&raw[8..512]);
        Some(TriggerPos {
            real_pos: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            ram_saddr: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            first_block,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::profile::{DeviceMode, TestMode};

    #[test]
    fn test_sample_delay_48mhz_parent() {
        let cmd = sample_delay(1_000_000, false).unwrap();
        assert_eq!(cmd.delay, 47);
        assert_eq!(cmd.flags, StartFlags::CLK_48MHZ);
    }

    #[test]
    fn test_sample_delay_wide_flag() {
        let cmd = sample_delay(1_000_000, true).unwrap();
        assert_eq!(cmd.flags, StartFlags::CLK_48MHZ | StartFlags::SAMPLE_16BIT);
    }

    #[test]
    fn test_sample_delay_idempotent() {
        let first = sample_delay(250_000, false).unwrap();
        let second = sample_delay(250_000, false).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sample_delay_falls_through_to_30mhz() {
        // 48 MHz / 25 kHz exceeds the waveform limit; 30 MHz divides evenly
        let cmd = sample_delay(25_000, false).unwrap();
        assert_eq!(cmd.delay, 1199);
        assert_eq!(cmd.flags, StartFlags::empty());
    }

    #[test]
    fn test_sample_delay_lowest_rate_uses_30mhz() {
        let cmd = sample_delay(20_000, false).unwrap();
        assert_eq!(cmd.delay, 1499);
        assert_eq!(cmd.flags, StartFlags::empty());
    }

    #[test]
    fn test_sample_delay_rejects_fast_wide() {
        assert!(sample_delay(24_000_000, true).is_err());
    }

    #[test]
    fn test_sample_delay_rejects_odd_rate() {
        assert!(sample_delay(7_000, false).is_err());
    }

    #[test]
    fn test_start_cmd_layout() {
        let cmd = StartCmd { flags: StartFlags::CLK_48MHZ, delay: 0x1234 };
        assert_eq!(cmd.to_bytes(), [0x40, 0x12, 0x34]);
        assert_eq!(StartCmd::dslogic_stop().to_bytes(), [0x80, 0, 0]);
    }

    #[test]
    fn test_clock_divider() {
        assert_eq!(clock_divider(400_000_000), 1);
        assert_eq!(clock_divider(200_000_000), 1);
        assert_eq!(clock_divider(100_000_000), 1);
        assert_eq!(clock_divider(50_000_000), 2);
        assert_eq!(clock_divider(10_000), 10_000);
    }

    #[test]
    fn test_mode_word_samplerate_bits() {
        let word = mode_word(false, TestMode::None, DeviceMode::Logic, false, 400_000_000);
        assert_eq!(word, 1 << 6);
        let word = mode_word(false, TestMode::None, DeviceMode::Logic, false, 200_000_000);
        assert_eq!(word, 1 << 5);
    }

    #[test]
    fn test_mode_word_analog() {
        let word = mode_word(false, TestMode::None, DeviceMode::Analog, false, 1_000_000);
        assert_eq!(word, (1 << 7) | (1 << 5) | (1 << 4));
    }

    #[test]
    fn test_mode_word_test_and_clock_bits() {
        let word = mode_word(true, TestMode::External, DeviceMode::Logic, true, 1_000_000);
        assert_eq!(word, (1 << 15) | (1 << 14) | 1 | (1 << 1));
        let word = mode_word(false, TestMode::Loopback, DeviceMode::Logic, false, 1_000_000);
        assert_eq!(word, 1 << 13);
    }

    #[test]
    fn test_settings_frame_layout() {
        let trigger = DsTrigger::new();
        let frame = FpgaSettings::new(&trigger, 0xaa55, 2, 0x1000, 0x800);
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), FpgaSettings::BYTE_LEN);
        assert_eq!(FpgaSettings::WORD_COUNT, 208);
        // sync, mode header, mode
        assert_eq!(&bytes[0..4], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(&bytes[4..6], &[0x01, 0x00]);
        assert_eq!(&bytes[6..8], &[0x55, 0xaa]);
        // divider section
        assert_eq!(&bytes[8..12], &[0xff, 0xff, 0x02, 0x01]);
        assert_eq!(&bytes[12..16], &[0x02, 0x00, 0x00, 0x00]);
        // adp = count - pos - 1
        assert_eq!(frame.trig_adp, 0x7ff);
        // end sync
        assert_eq!(&bytes[412..416], &[0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_settings_frame_simple_trigger_planes() {
        let mut trigger = DsTrigger::new();
        trigger.probe_set(0, b'R', b'R').unwrap();
        trigger.set_mode(TriggerMode::Simple);
        let frame = FpgaSettings::new(&trigger, 0, 1, 1024, 0);
        assert_eq!(frame.edge0[0], 1);
        assert_eq!(frame.edge1[0], 1);
        assert_eq!(frame.value0[0], 1);
        assert_eq!(frame.value1[0], 1);
        // probe 0 is the one non-don't-care column
        assert_eq!(frame.mask0[0], 0xfffe);
        assert_eq!(frame.mask1[0], 0xfffe);
        for stage in 1..STAGES {
            assert_eq!(frame.mask0[stage], 1);
            assert_eq!(frame.value0[stage], 0);
            assert_eq!(frame.edge0[stage], 0);
            assert_eq!(frame.count0[stage], 0);
            assert_eq!(frame.logic0[stage], 2);
            assert_eq!(frame.logic1[stage], 2);
        }
    }

    #[test]
    fn test_trigger_pos_round_trip() {
        let mut raw = vec![0u8; TriggerPos::BYTE_LEN];
        raw[0..4].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        raw[4..8].copy_from_slice(&0x9abc_def0u32.to_le_bytes());
        raw[8] = 0x42;
        let pos = TriggerPos::from_bytes(&raw).unwrap();
        assert_eq!(pos.real_pos, 0x1234_5678);
        assert_eq!(pos.ram_saddr, 0x9abc_def0);
        assert_eq!(pos.first_block[0], 0x42);
        assert!(TriggerPos::from_bytes(&raw[..511]).is_none());
    }
}
