//! Datafeed packets delivered to the acquisition consumer.

/// What an analog packet measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Voltage,
}

/// One packet of the acquisition stream.
///
/// `Header` is always first; `End` is always last and is delivered exactly
/// once per acquisition. A `Trigger` precedes the logic packet that carries
/// its matched samples. Borrowed payloads are only valid for the duration
/// of the callback.
#[derive(Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    Header,
    Logic {
        /// Bytes per sample; `data.len()` is a multiple of this.
        unit_size: usize,
        data: &'a [u8],
    },
    Analog {
        num_samples: usize,
        quantity: Quantity,
        quantity_flags: u32,
        data: &'a [u8],
    },
    Trigger {
        /// Raw trigger-position report on the DSLogic; `None` for the
        /// software trigger.
        pos: Option<&'a [u8]>,
    },
    FrameBegin,
    FrameEnd,
    End,
}

/// Consumer callback supplied at acquisition start. Runs on the host's
/// event-loop thread, inside `Device::handle_events`.
pub type Consumer = Box<dyn FnMut(Packet<'_>)>;

/// Bytes per sample for the given capture width.
pub fn unit_size(wide: bool) -> usize {
    if wide { 2 } else { 1 }
}
