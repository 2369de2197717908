use std::time::Duration;

use particle_usb::{list_devices, ListOptions, OpenOptions, RequestOptions};

fn main() {
    env_logger::init();
    let devices = list_devices(ListOptions::new().include_dfu()).unwrap();
    if devices.is_empty() {
        println!("No Particle devices attached");
        return;
    }
    for device in devices {
        println!(
            "{} ({:04x}:{:04x}) serial {}",
            device.platform().name(),
            device.vendor_id(),
            device.product_id(),
            device.serial_number().as_deref().unwrap_or("?")
        );
        if device.is_in_dfu_mode() {
            println!("  in DFU mode");
            continue;
        }
        if let Err(e) = device.open(OpenOptions::new()) {
            println!("  failed to open: {e}");
            continue;
        }
        let reply = device
            .send_raw_request(
                particle_usb::request_type::GET_SYSTEM_VERSION,
                &[],
                RequestOptions::new().timeout(Duration::from_secs(5)),
            )
            .expect("version request failed");
        println!(
            "  Device OS version: {}",
            String::from_utf8_lossy(&reply.payload)
        );
        device.close(Default::default()).unwrap();
    }
}
