use std::cell::RefCell;
use std::rc::Rc;

use fx2la::{ConfigKey, ConfigValue, Device, HostBus, NoFirmware, Packet, ScanOptions};

fn main() -> fx2la::Result<()> {
    env_logger::init();

    let mut bus = HostBus::new();
    let mut loader = NoFirmware;
    let mut found = fx2la::scan(&mut bus, &mut loader, &ScanOptions::default())?;
    let Some(first) = found.first_mut() else {
        eprintln!("no supported device found");
        return Ok(());
    };
    println!("found {} {}", first.profile.vendor, first.profile.model);

    let mut device = Device::open(&mut bus, first)?;
    device.config_set(ConfigKey::Samplerate, ConfigValue::UInt64(1_000_000))?;
    device.config_set(ConfigKey::LimitSamples, ConfigValue::UInt64(65_536))?;

    let samples = Rc::new(RefCell::new(Vec::new()));
    let sink = samples.clone();
    device.start_acquisition(Box::new(move |packet: Packet| match packet {
        Packet::Logic { data, .. } => sink.borrow_mut().extend_from_slice(data),
        Packet::Trigger { .. } => println!("triggered"),
        Packet::End => println!("capture complete"),
        _ => {}
    }))?;

    let timeout = device.acquisition_timeout();
    while device.handle_events(timeout) {}

    let samples = samples.borrow();
    println!("captured {} bytes", samples.len());
    std::fs::write("capture.data", &samples[..])?;
    device.close();
    Ok(())
}
