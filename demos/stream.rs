//! Stream a few depth/color cycles from a simulated camera, aligning depth
//! to color and colorizing it.

use std::sync::Arc;
use std::time::Duration;

use depthlink::native::sim::{SimDevice, SimSdk};
use depthlink::{FrameMetadata, Runtime, StreamKind, StreamRequest};

fn main() {
    env_logger::init();

    let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("f0000001")]));
    let rt = Runtime::new(sdk.clone());
    rt.on_error(|e| eprintln!("native error: {}", e));

    if let Err(e) = run(&rt, &sdk) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    rt.cleanup();
}

fn run(rt: &Runtime, sdk: &SimSdk) -> depthlink::Result<()> {
    let config = rt.config()?;
    config.enable_stream(StreamRequest::new(StreamKind::Depth).resolution(640, 480).fps(30))?;
    config.enable_stream(StreamRequest::new(StreamKind::Color))?;

    let mut pipe = rt.pipeline()?;
    if let Some(profile) = pipe.start_with_config(&config)?.profile() {
        for stream in profile.streams()? {
            println!("enabled {}", stream);
        }
    }

    let mut align = rt.align(StreamKind::Color)?;
    let mut colorizer = rt.colorizer()?;
    let started = rt.time()?;

    for _ in 0..5 {
        sdk.deliver_all();
        let Some(frames) = pipe.wait_for_frames_timeout(Duration::from_millis(100))? else {
            println!("timeout");
            continue;
        };
        if let Some(depth) = frames.depth_frame()? {
            let number = depth.frame_number()?;
            if let Some(d) = depth.as_depth() {
                let center = d.distance(d.width() / 2, d.height() / 2)?;
                println!("#{} depth {}x{} center {:.3} m", number, d.width(), d.height(), center);
            }
        }
        if let Some(color) = frames.color_frame()? {
            let fps = color.metadata(FrameMetadata::ActualFps)?;
            let bytes = color.data()?.len();
            println!("   color {} bytes, fps {:?}", bytes, fps);
        }
        let Some(aligned) = align.process(frames)? else {
            continue;
        };
        if let Some(depth) = aligned.depth_frame()? {
            if let Some(colored) = colorizer.colorize(depth)? {
                println!("   colorized {} bytes", colored.data()?.len());
            }
        }
    }
    println!("streamed for {:.1} ms", rt.time()? - started);

    pipe.stop()?;
    Ok(())
}
