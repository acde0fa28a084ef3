//! Scripted transport for exercising the protocol state machine without
//! hardware.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use super::{Completion, DeviceInfo, FirmwareLoader, TransferId, TransferStatus, UsbBus, UsbIo};
use crate::{Error, Result};

fn transport(msg: &str) -> Error {
    Error::Transport(msg.to_string().into())
}

#[derive(Debug, Default)]
pub(crate) struct MockIo {
    /// Shared so tests can observe claims after the handle is consumed.
    pub claimed: Rc<RefCell<Vec<u8>>>,
    pub control_out_log: Vec<(u8, Vec<u8>)>,
    pub control_in_replies: HashMap<u8, VecDeque<Vec<u8>>>,
    pub bulk_out_log: Vec<(u8, Vec<u8>)>,
    /// Replies served, in order, to bulk-in transfers as they are polled.
    pub bulk_in_script: VecDeque<(TransferStatus, Vec<u8>)>,
    /// (endpoint, length) of every submission, for assertions.
    pub submissions: Vec<(u8, usize)>,
    /// Write side failure injection.
    pub fail_control_out: HashSet<u8>,
    pub fail_submit: bool,
    /// Caps the byte count reported by `bulk_out`.
    pub bulk_out_limit: Option<usize>,
    pending: VecDeque<TransferId>,
    cancelled: HashSet<TransferId>,
    next_id: u64,
}

impl MockIo {
    pub fn new() -> MockIo {
        MockIo::default()
    }

    /// A device that reports the given firmware version and REVID.
    pub fn with_firmware(major: u8, minor: u8, revid_request: u8, revid: u8) -> MockIo {
        let mut io = MockIo::new();
        io.reply_control_in(crate::proto::CMD_GET_FW_VERSION, vec![major, minor]);
        io.reply_control_in(revid_request, vec![revid]);
        io
    }

    pub fn reply_control_in(&mut self, request: u8, data: Vec<u8>) {
        self.control_in_replies
            .entry(request)
            .or_default()
            .push_back(data);
    }

    pub fn script_bulk_in(&mut self, status: TransferStatus, data: Vec<u8>) {
        self.bulk_in_script.push_back((status, data));
    }
}

impl UsbIo for MockIo {
    fn claim(&mut self, interface: u8) -> Result<()> {
        self.claimed.borrow_mut().push(interface);
        Ok(())
    }

    fn control_out(&mut self, request: u8, data: &[u8], _timeout: Duration) -> Result<()> {
        if self.fail_control_out.contains(&request) {
            return Err(transport("scripted control-out failure"));
        }
        self.control_out_log.push((request, data.to_vec()));
        Ok(())
    }

    fn control_in(&mut self, request: u8, data: &mut [u8], _timeout: Duration) -> Result<usize> {
        let reply = self
            .control_in_replies
            .get_mut(&request)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| transport("no scripted control-in reply"))?;
        let read = reply.len().min(data.len());
        data[..read].copy_from_slice(&reply[..read]);
        Ok(read)
    }

    fn bulk_out(&mut self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
        self.bulk_out_log.push((endpoint, data.to_vec()));
        Ok(self.bulk_out_limit.unwrap_or(data.len()).min(data.len()))
    }

    fn submit_bulk_in(&mut self, endpoint: u8, length: usize) -> Result<TransferId> {
        if self.fail_submit {
            return Err(transport("scripted submission failure"));
        }
        let id = TransferId(self.next_id);
        self.next_id += 1;
        self.submissions.push((endpoint, length));
        self.pending.push_back(id);
        Ok(id)
    }

    fn cancel(&mut self, id: TransferId) {
        self.cancelled.insert(id);
    }

    fn poll(&mut self, _timeout: Duration) -> Option<Completion> {
        let id = *self.pending.front()?;
        if self.cancelled.contains(&id) {
            self.pending.pop_front();
            return Some(Completion {
                id,
                status: TransferStatus::Cancelled,
                data: Vec::new(),
            });
        }
        let (status, data) = self.bulk_in_script.pop_front()?;
        self.pending.pop_front();
        Some(Completion { id, status, data })
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockBus {
    pub devices: Vec<DeviceInfo>,
    pub handles: VecDeque<MockIo>,
    pub opened: Vec<DeviceInfo>,
}

impl UsbBus for MockBus {
    type Io = MockIo;

    fn devices(&mut self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.clone())
    }

    fn open(&mut self, info: &DeviceInfo) -> Result<MockIo> {
        self.opened.push(info.clone());
        self.handles
            .pop_front()
            .ok_or_else(|| transport("no scripted handle"))
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingLoader {
    pub uploads: Vec<(u16, u16, String)>,
    pub fail: bool,
}

impl FirmwareLoader for RecordingLoader {
    fn upload(&mut self, info: &DeviceInfo, firmware: &str) -> Result<()> {
        if self.fail {
            return Err(transport("scripted upload failure"));
        }
        self.uploads
            .push((info.vendor_id, info.product_id, firmware.to_owned()));
        Ok(())
    }
}
