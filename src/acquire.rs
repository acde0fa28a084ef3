//! The acquisition engine: transfer pool sizing and submission, completion
//! handling, software triggering, packet emission, and termination.
//!
//! The host event loop drives everything by calling
//! [`Device::handle_events`]; completion handlers run on that thread and
//! the engine holds no locks.

use std::time::Duration;

use crate::device::{Device, BULK_OUT_TIMEOUT, CTRL_TIMEOUT, CTRL_TIMEOUT_SLOW};
use crate::packet::{self, Consumer, Packet, Quantity};
use crate::profile::{ChannelKind, DeviceMode, TestMode};
use crate::proto::{self, FpgaSettings, StartCmd, StartFlags, TriggerPos};
use crate::trigger::SoftTrigger;
use crate::usb::{Completion, TransferId, TransferStatus, UsbIo};
use crate::{Error, Result};

pub(crate) const NUM_SIMUL_TRANSFERS: usize = 32;
pub(crate) const MAX_EMPTY_TRANSFERS: usize = NUM_SIMUL_TRANSFERS * 2;

const DSLOGIC_ANALOG_TRANSFER_SIZE: usize = 128;
const DSLOGIC_DSO_TRANSFER_SIZE: usize = 16 * 1024;

/// DSLogic acquisition phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Error,
    Init,
    /// FPGA programmed, waiting for the trigger-position report.
    Start,
    /// Trigger position received, data transfers submitted.
    Triggered,
    /// Sample data is flowing.
    Data,
    Stop,
}

/// State of one running acquisition. Owned by the device, dropped when the
/// last in-flight transfer frees and the end packet has been delivered.
pub(crate) struct Acquisition {
    consumer: Consumer,
    soft: SoftTrigger,
    slots: Vec<Option<TransferId>>,
    submitted: usize,
    /// Emitted samples; -1 once the acquisition has ended, after which
    /// late completions only drain.
    num_samples: i64,
    empty_transfers: usize,
    phase: Phase,
    endpoint: u8,
    transfer_size: usize,
    /// Next expected sample of the DSLogic counting-pattern self test.
    test_expected: Option<u16>,
}

impl std::fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquisition")
            .field("slots", &self.slots)
            .field("submitted", &self.submitted)
            .field("num_samples", &self.num_samples)
            .field("empty_transfers", &self.empty_transfers)
            .field("phase", &self.phase)
            .field("endpoint", &self.endpoint)
            .field("transfer_size", &self.transfer_size)
            .field("test_expected", &self.test_expected)
            .finish()
    }
}

impl Acquisition {
    fn emit(&mut self, packet: Packet<'_>) {
        (self.consumer)(packet);
    }

    /// Release the slot of a finished transfer. True when it was the last
    /// one in flight.
    fn free(&mut self, id: TransferId) -> bool {
        let mut found = false;
        for slot in &mut self.slots {
            if *slot == Some(id) {
                *slot = None;
                self.submitted -= 1;
                found = true;
                break;
            }
        }
        found && self.submitted == 0
    }
}

fn abort<U: UsbIo>(io: &mut U, acq: &mut Acquisition) {
    if acq.num_samples == -1 {
        return;
    }
    acq.num_samples = -1;
    if acq.phase != Phase::Error {
        acq.phase = Phase::Stop;
    }
    for id in acq.slots.iter().rev().flatten() {
        io.cancel(*id);
    }
}

/// Validate the DSLogic self-test stream: emitted 16-bit samples count up
/// modulo 65001, seeded by the first observed value. In external mode one
/// mismatch ends the check for the transfer.
fn check_test_pattern(acq: &mut Acquisition, payload: &[u8], test: TestMode) {
    for chunk in payload.chunks_exact(2) {
        let sample = u16::from_le_bytes([chunk[0], chunk[1]]);
        let mut stop = false;
        if let Some(expected) = acq.test_expected {
            if sample != expected {
                log::error!(
                    "test pattern mismatch: expected {}, got {}",
                    expected, sample
                );
                stop = test == TestMode::External;
            }
        }
        acq.test_expected = Some(((sample as u32 + 1) % 65001) as u16);
        if stop {
            break;
        }
    }
}

impl<U: UsbIo> Device<U> {
    fn bytes_per_ms(&self) -> u64 {
        self.cur_samplerate / 1000 * packet::unit_size(self.sample_wide) as u64
    }

    /// Transfer buffer size: 10 ms of data, rounded up to a multiple of 512.
    fn buffer_size(&self) -> usize {
        let size = 10 * self.bytes_per_ms() as usize;
        (size + 511) & !511
    }

    /// Enough transfers in flight to cover 500 ms of data (100 ms on the
    /// DSLogic), capped at the pool limit.
    fn transfer_count(&self) -> usize {
        let window_ms: u64 = if self.dslogic { 100 } else { 500 };
        let count = (window_ms * self.bytes_per_ms()) as usize / self.buffer_size();
        count.clamp(1, NUM_SIMUL_TRANSFERS)
    }

    fn transfer_size(&self) -> usize {
        if self.dslogic && self.mode == DeviceMode::Analog {
            DSLOGIC_ANALOG_TRANSFER_SIZE
        } else if self.dslogic && self.mode == DeviceMode::Dso {
            DSLOGIC_DSO_TRANSFER_SIZE
        } else {
            self.buffer_size()
        }
    }

    /// Poll timeout for the host event loop: the time the whole pool takes
    /// to fill, plus 25% headroom.
    pub fn acquisition_timeout(&self) -> Duration {
        if self.dslogic {
            return Duration::from_millis(1000);
        }
        let total = (self.buffer_size() * self.transfer_count()) as u64;
        let timeout = total / self.bytes_per_ms();
        Duration::from_millis(timeout + timeout / 4)
    }

    /// Derive the capture width and compile the software trigger from the
    /// enabled channels.
    fn configure_channels(&mut self) -> Result<SoftTrigger> {
        let mut wide = false;
        for channel in self.channels.iter().filter(|ch| ch.enabled) {
            if self.dslogic {
                if (channel.kind == ChannelKind::Logic && channel.index > 7)
                    || (channel.kind == ChannelKind::Analog && channel.index > 0)
                {
                    wide = true;
                }
            } else if channel.index > 7 {
                wide = true;
            }
        }
        self.sample_wide = wide;
        SoftTrigger::compile(&self.channels)
    }

    fn fpga_settings(&self) -> FpgaSettings {
        let mode = proto::mode_word(
            self.trigger.enable(),
            self.test,
            self.mode,
            self.ext_clock,
            self.cur_samplerate,
        );
        let divider = proto::clock_divider(self.cur_samplerate);
        let count = self.limit_samples as u32;
        let trig_pos = (self.trigger.position() as u64 * self.limit_samples / 100) as u32;
        FpgaSettings::new(&self.trigger, mode, divider, count, trig_pos)
    }

    /// Begin an acquisition. Packets flow to `consumer` as the host calls
    /// [`Device::handle_events`]; the stream starts with `Header` and is
    /// closed by exactly one `End`.
    ///
    /// A failed start leaves the device inactive with no transfer state
    /// behind.
    pub fn start_acquisition(&mut self, consumer: Consumer) -> Result<()> {
        if self.acq.is_some() {
            return Err(Error::Arg("an acquisition is already running"));
        }
        let soft = self.configure_channels()?;
        let mut acq = Acquisition {
            consumer,
            soft,
            slots: Vec::new(),
            submitted: 0,
            num_samples: 0,
            empty_transfers: 0,
            phase: Phase::Init,
            endpoint: if self.dslogic { proto::EP_DSLOGIC_IN } else { proto::EP_DATA_IN },
            transfer_size: self.transfer_size(),
            test_expected: None,
        };

        if self.dslogic {
            // stop whatever the FPGA was doing before reprogramming it
            self.io.control_out(
                proto::CMD_DSLOGIC_START,
                &StartCmd::dslogic_stop().to_bytes(),
                CTRL_TIMEOUT_SLOW,
            )?;
            let bitstream = self.fpga_bitstream.clone();
            self.configure_fpga(&bitstream)?;
            let frame = self.fpga_settings().to_bytes();
            let words = FpgaSettings::WORD_COUNT;
            self.io.control_out(
                proto::CMD_DSLOGIC_SETTING,
                &[words as u8, (words >> 8) as u8, (words >> 16) as u8],
                CTRL_TIMEOUT,
            )?;
            let written = self
                .io
                .bulk_out(proto::EP_DSLOGIC_OUT, &frame, BULK_OUT_TIMEOUT)?;
            if written != frame.len() {
                return Err(Error::Protocol(format!(
                    "short FPGA settings transfer: {} of {} bytes",
                    written,
                    frame.len()
                )));
            }
            log::info!(
                "FPGA settings done, trigger mode {:?}, {} stages",
                self.trigger.mode(), self.trigger.stages()
            );
            // the first frame on the data endpoint reports where the
            // hardware trigger fired
            let id = self
                .io
                .submit_bulk_in(proto::EP_DSLOGIC_IN, TriggerPos::BYTE_LEN)?;
            acq.slots.push(Some(id));
            acq.submitted = 1;
            acq.phase = Phase::Start;
            acq.emit(Packet::Header);
            self.acq = Some(acq);
        } else {
            let start = proto::sample_delay(self.cur_samplerate, self.sample_wide)?;
            self.submit_transfers(&mut acq)?;
            self.acq = Some(acq);
            if let Err(error) =
                self.io
                    .control_out(proto::CMD_START, &start.to_bytes(), CTRL_TIMEOUT)
            {
                self.stop_acquisition();
                return Err(error);
            }
            log::info!(
                "GPIF delay = {}, clock source = {} MHz",
                start.delay,
                if start.flags.contains(StartFlags::CLK_48MHZ) { 48 } else { 30 }
            );
            self.acq.as_mut().expect("just stored").emit(Packet::Header);
        }
        Ok(())
    }

    /// End a running acquisition. Idempotent; in-flight transfers drain
    /// through the completion path, which emits the final `End`.
    pub fn stop_acquisition(&mut self) {
        if let Some(acq) = self.acq.as_mut() {
            abort(&mut self.io, acq);
        }
    }

    /// Drive the acquisition: wait up to `timeout` for one bulk completion
    /// and process it. Returns whether an acquisition is still running.
    pub fn handle_events(&mut self, timeout: Duration) -> bool {
        if let Some(completion) = self.io.poll(timeout) {
            self.on_completion(completion);
        }
        self.acq.is_some()
    }

    fn on_completion(&mut self, completion: Completion) {
        let Some(mut acq) = self.acq.take() else {
            log::debug!("stray completion after acquisition teardown");
            return;
        };
        let finished = if self.dslogic && acq.phase == Phase::Start {
            self.on_trigger_pos(&mut acq, completion)
        } else {
            self.on_data(&mut acq, completion)
        };
        if !finished {
            self.acq = Some(acq);
        }
    }

    fn submit_transfers(&mut self, acq: &mut Acquisition) -> Result<()> {
        let count = self.transfer_count();
        acq.slots = Vec::with_capacity(count);
        acq.submitted = 0;
        for _ in 0..count {
            match self.io.submit_bulk_in(acq.endpoint, acq.transfer_size) {
                Ok(id) => {
                    acq.slots.push(Some(id));
                    acq.submitted += 1;
                }
                Err(error) => {
                    log::error!("failed to submit transfer: {}", error);
                    abort(&mut self.io, acq);
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    fn on_trigger_pos(&mut self, acq: &mut Acquisition, completion: Completion) -> bool {
        if acq.num_samples == -1 {
            if acq.free(completion.id) {
                acq.emit(Packet::End);
                return true;
            }
            return false;
        }
        log::debug!(
            "trigger position: {:?}, {} bytes",
            completion.status,
            completion.data.len()
        );
        match completion.status {
            TransferStatus::Completed if completion.data.len() >= TriggerPos::BYTE_LEN => {
                acq.emit(Packet::Trigger { pos: Some(&completion.data) });
                // the slot is consumed by the phase change, not freed
                acq.slots.clear();
                acq.submitted = 0;
                acq.phase = Phase::Triggered;
                if let Err(error) = self.submit_transfers(acq) {
                    log::error!("could not start data transfers: {}", error);
                    acq.phase = Phase::Error;
                    if acq.submitted == 0 {
                        acq.emit(Packet::End);
                        return true;
                    }
                }
                false
            }
            _ => {
                acq.phase = Phase::Error;
                abort(&mut self.io, acq);
                if acq.free(completion.id) {
                    acq.emit(Packet::End);
                    return true;
                }
                false
            }
        }
    }

    fn on_data(&mut self, acq: &mut Acquisition, completion: Completion) -> bool {
        if acq.num_samples == -1 {
            if acq.free(completion.id) {
                acq.emit(Packet::End);
                return true;
            }
            return false;
        }
        if self.dslogic && acq.phase == Phase::Triggered {
            acq.phase = Phase::Data;
        }
        log::trace!(
            "transfer done: {:?}, {} bytes",
            completion.status,
            completion.data.len()
        );

        let mut failed = false;
        match completion.status {
            TransferStatus::NoDevice => {
                abort(&mut self.io, acq);
                if acq.free(completion.id) {
                    acq.emit(Packet::End);
                    return true;
                }
                return false;
            }
            // a timed-out transfer may still carry valid data
            TransferStatus::Completed | TransferStatus::TimedOut => {}
            _ => failed = true,
        }

        if completion.data.is_empty() || failed {
            acq.empty_transfers += 1;
            if acq.empty_transfers > MAX_EMPTY_TRANSFERS {
                // the FX2 gave up; end with a short count and let the
                // consumer reconcile it
                abort(&mut self.io, acq);
                if acq.free(completion.id) {
                    acq.emit(Packet::End);
                    return true;
                }
                return false;
            }
            return self.resubmit(acq, completion.id);
        }
        acq.empty_transfers = 0;

        let width = packet::unit_size(self.sample_wide);
        let mut offset = 0;
        if !acq.soft.fired() {
            match acq.soft.scan(&completion.data, self.sample_wide) {
                Some(fire) => {
                    acq.emit(Packet::Trigger { pos: None });
                    // re-emit the matched samples, since the tail skips them
                    acq.emit(Packet::Logic { unit_size: width, data: &fire.matched });
                    acq.num_samples += (fire.matched.len() / width) as i64;
                    offset = fire.offset;
                }
                // pre-trigger data beyond the stage buffer is discarded
                None => return self.resubmit(acq, completion.id),
            }
        }

        // emit the post-trigger tail, bounded by the remaining budget
        let tail = &completion.data[(offset * width).min(completion.data.len())..];
        let budget = if self.limit_samples > 0 {
            (self.limit_samples as i64 - acq.num_samples).max(0) as usize
        } else {
            usize::MAX
        };
        let take = (tail.len() / width).min(budget);
        let payload = &tail[..take * width];
        if !payload.is_empty() {
            if !self.dslogic || self.mode == DeviceMode::Logic {
                acq.emit(Packet::Logic { unit_size: width, data: payload });
            } else {
                acq.emit(Packet::Analog {
                    num_samples: take,
                    quantity: Quantity::Voltage,
                    quantity_flags: 0,
                    data: payload,
                });
            }
            if self.dslogic
                && (self.test == TestMode::Internal || self.test == TestMode::External)
            {
                check_test_pattern(acq, payload, self.test);
            }
            acq.num_samples += take as i64;
        }

        if self.limit_samples > 0 && acq.num_samples >= self.limit_samples as i64 {
            abort(&mut self.io, acq);
            if acq.free(completion.id) {
                acq.emit(Packet::End);
                return true;
            }
            return false;
        }
        self.resubmit(acq, completion.id)
    }

    fn resubmit(&mut self, acq: &mut Acquisition, old: TransferId) -> bool {
        match self.io.submit_bulk_in(acq.endpoint, acq.transfer_size) {
            Ok(new) => {
                for slot in &mut acq.slots {
                    if *slot == Some(old) {
                        *slot = Some(new);
                        break;
                    }
                }
                false
            }
            Err(error) => {
                log::error!("failed to resubmit transfer: {}", error);
                if acq.free(old) {
                    acq.emit(Packet::End);
                    return true;
                }
                false
            }
        }
    }
}
