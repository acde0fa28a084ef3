mod usb;
mod proto;
mod profile;
mod trigger;
mod packet;
mod scan;
mod device;
mod acquire;

#[derive(Debug)]
pub enum Error {
    /// An input precondition was violated: out-of-range stage or probe,
    /// unknown configuration key, missing device, oversized trigger pattern.
    Arg(&'static str),
    /// The feature exists but not on this hardware variant.
    Unavailable(&'static str),
    /// The underlying USB operation failed.
    Transport(Box<dyn std::error::Error + Send + Sync + 'static>),
    /// The device answered, but not the way this driver requires.
    Protocol(String),
    /// A host-side resource (memory, firmware file) could not be obtained.
    Resource(String),
    /// A driver invariant was broken.
    Bug(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Arg(msg) =>
                write!(f, "invalid argument: {}", msg),
            Self::Unavailable(msg) =>
                write!(f, "not supported by this device: {}", msg),
            Self::Transport(error) =>
                write!(f, "USB transport error: {}", error),
            Self::Protocol(msg) =>
                write!(f, "protocol error: {}", msg),
            Self::Resource(msg) =>
                write!(f, "resource error: {}", msg),
            Self::Bug(msg) =>
                write!(f, "driver bug: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(error) => Some(error.as_ref()),
            _ => None
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Resource(error.to_string())
    }
}

impl From<nusb::Error> for Error {
    fn from(error: nusb::Error) -> Self {
        Error::Transport(Box::new(error))
    }
}

impl From<nusb::transfer::TransferError> for Error {
    fn from(error: nusb::transfer::TransferError) -> Self {
        Error::Transport(Box::new(error))
    }
}

pub type Result<T> =
    core::result::Result<T, Error>;

pub use usb::{
    Completion,
    DeviceInfo,
    FirmwareLoader,
    NoFirmware,
    TransferId,
    TransferStatus,
    UsbBus,
    UsbIo,
};

pub use usb::imp::HostBus;

pub use proto::{
    sample_delay,
    FpgaSettings,
    StartCmd,
    StartFlags,
    TriggerPos,
    VersionInfo,
};

pub use profile::{
    Caps,
    Channel,
    ChannelKind,
    DeviceMode,
    Profile,
    TestMode,
    DSLOGIC_SAMPLERATES,
    PROFILES,
    SAMPLERATES,
};

pub use trigger::{
    DsTrigger,
    Fire,
    SoftTrigger,
    TriggerMode,
    NUM_TRIGGER_STAGES,
    PROBES,
    STAGES,
};

pub use packet::{
    Consumer,
    Packet,
    Quantity,
};

pub use scan::{
    scan,
    FoundDevice,
    ScanOptions,
    ADDRESS_UNKNOWN,
};

pub use device::{
    ConfigKey,
    ConfigList,
    ConfigValue,
    Device,
};
