//! List devices, sensors and stream profiles of a simulated rig.

use std::sync::Arc;

use depthlink::native::sim::{SimDevice, SimSdk};
use depthlink::{CameraInfo, Runtime, SensorOption};

fn main() {
    env_logger::init();

    let sdk = Arc::new(SimSdk::with_devices(vec![
        SimDevice::d400("f0000001"),
        SimDevice::tracking("t0000001"),
    ]));
    let rt = Runtime::new(sdk);

    if let Err(e) = run(&rt) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    println!("released {} objects", rt.cleanup());
}

fn run(rt: &Runtime) -> depthlink::Result<()> {
    let ctx = rt.context()?;
    let Some(list) = ctx.query_devices()? else {
        println!("No devices");
        return Ok(());
    };
    println!("Found {} device(s):", list.len()?);
    for (i, device) in list.devices()?.iter().enumerate() {
        println!("  [{}]", i);
        for (info, value) in device.camera_info_all()? {
            println!("      {:<24} {}", info, value);
        }
        for sensor in device.query_sensors()? {
            println!(
                "    sensor {:?} caps={:?}",
                sensor.name()?.unwrap_or_default(),
                sensor.capabilities()?
            );
            if let Some(scale) = sensor.depth_scale()? {
                println!("      depth scale {}", scale);
            }
            if let Some(power) = sensor.option(SensorOption::LaserPower)? {
                println!("      laser power {}", power);
            }
            for profile in sensor.stream_profiles()? {
                if profile.is_default() {
                    println!("      {}", profile);
                }
            }
        }
        if let Some(serial) = device.camera_info(CameraInfo::SerialNumber)? {
            println!("    serial {}", serial);
        }
    }
    Ok(())
}
