//! Real transport over the `nusb` crate.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use nusb::transfer::{
    Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient, TransferError,
};
use nusb::{Endpoint, MaybeFuture};

use super::{Completion, DeviceInfo, TransferId, TransferStatus, UsbBus, UsbIo};
use crate::{Error, Result};

/// The host's USB bus, enumerated through `nusb::list_devices`.
pub struct HostBus {
    cache: Vec<nusb::DeviceInfo>,
}

impl HostBus {
    pub fn new() -> HostBus {
        HostBus { cache: Vec::new() }
    }
}

impl Default for HostBus {
    fn default() -> Self {
        HostBus::new()
    }
}

fn bus_number(info: &nusb::DeviceInfo) -> u8 {
    // bus ids are decimal strings on the platforms this driver targets
    info.bus_id().parse().unwrap_or(0)
}

impl UsbBus for HostBus {
    type Io = Handle;

    fn devices(&mut self) -> Result<Vec<DeviceInfo>> {
        self.cache = nusb::list_devices().wait()?.collect();
        Ok(self
            .cache
            .iter()
            .map(|info| DeviceInfo {
                bus: bus_number(info),
                address: info.device_address(),
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
                manufacturer: info.manufacturer_string().map(str::to_owned),
                product: info.product_string().map(str::to_owned),
            })
            .collect())
    }

    fn open(&mut self, info: &DeviceInfo) -> Result<Handle> {
        let entry = self
            .cache
            .iter()
            .find(|cached| {
                bus_number(cached) == info.bus
                    && cached.device_address() == info.address
                    && cached.vendor_id() == info.vendor_id
                    && cached.product_id() == info.product_id
            })
            .ok_or(Error::Arg("device is no longer on the bus"))?;
        let device = entry.open().wait()?;
        log::debug!("opened {:03}.{:03}", info.bus, info.address);
        Ok(Handle {
            device,
            interface: None,
            bulk_in: HashMap::new(),
            next_id: 0,
        })
    }
}

struct InEndpoint {
    endpoint: Endpoint<Bulk, In>,
    queued: VecDeque<TransferId>,
}

/// An open device handle. Bulk-in endpoints are opened lazily on first
/// submission and kept for the lifetime of the handle; completions are
/// reported in submission order, which `nusb` guarantees per endpoint.
pub struct Handle {
    device: nusb::Device,
    interface: Option<nusb::Interface>,
    bulk_in: HashMap<u8, InEndpoint>,
    next_id: u64,
}

impl Handle {
    fn interface(&self) -> Result<&nusb::Interface> {
        self.interface
            .as_ref()
            .ok_or(Error::Bug("bulk transfer before the interface was claimed"))
    }
}

impl UsbIo for Handle {
    fn claim(&mut self, interface: u8) -> Result<()> {
        self.interface = Some(self.device.claim_interface(interface).wait()?);
        Ok(())
    }

    fn control_out(&mut self, request: u8, data: &[u8], timeout: Duration) -> Result<()> {
        self.device
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value: 0,
                    index: 0,
                    data,
                },
                timeout,
            )
            .wait()?;
        Ok(())
    }

    fn control_in(&mut self, request: u8, data: &mut [u8], timeout: Duration) -> Result<usize> {
        let reply = self
            .device
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value: 0,
                    index: 0,
                    length: data.len() as u16,
                },
                timeout,
            )
            .wait()?;
        let read = reply.len().min(data.len());
        data[..read].copy_from_slice(&reply[..read]);
        Ok(read)
    }

    fn bulk_out(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        let mut endpoint = self.interface()?.endpoint::<Bulk, Out>(endpoint)?;
        let completion = endpoint.transfer_blocking(Buffer::from(data.to_vec()), timeout);
        completion.status?;
        Ok(completion.actual_len)
    }

    fn submit_bulk_in(&mut self, endpoint: u8, length: usize) -> Result<TransferId> {
        let state = match self.bulk_in.entry(endpoint) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let opened = self
                    .interface
                    .as_ref()
                    .ok_or(Error::Bug("bulk transfer before the interface was claimed"))?
                    .endpoint::<Bulk, In>(endpoint)?;
                entry.insert(InEndpoint {
                    endpoint: opened,
                    queued: VecDeque::new(),
                })
            }
        };
        // nusb requires the requested length to be a multiple of the packet size
        let max_packet = state.endpoint.max_packet_size();
        let requested = length.div_ceil(max_packet) * max_packet;
        let mut buffer = Buffer::new(requested);
        buffer.set_requested_len(requested);
        state.endpoint.submit(buffer);
        let id = TransferId(self.next_id);
        self.next_id += 1;
        state.queued.push_back(id);
        Ok(id)
    }

    fn cancel(&mut self, _id: TransferId) {
        // host-controller cancellation is endpoint wide; the core only ever
        // cancels the whole pool, so this loses nothing
        for state in self.bulk_in.values_mut() {
            state.endpoint.cancel_all();
        }
    }

    fn poll(&mut self, timeout: Duration) -> Option<Completion> {
        let state = self.bulk_in.values_mut().find(|s| !s.queued.is_empty())?;
        let completion = state.endpoint.wait_next_complete(timeout)?;
        let id = state
            .queued
            .pop_front()
            .expect("completion without a queued transfer");
        let status = match completion.status {
            Ok(()) => TransferStatus::Completed,
            Err(TransferError::Cancelled) => TransferStatus::Cancelled,
            Err(TransferError::Disconnected) => TransferStatus::NoDevice,
            Err(_) => TransferStatus::Error,
        };
        let data = completion.buffer[..completion.actual_len].to_vec();
        Some(Completion { id, status, data })
    }
}
