//! # depthlink - managed resources and streaming sessions for depth cameras
//!
//! Wraps a native depth-camera capture SDK behind owned Rust types:
//! - Every native handle has exactly one owner, is released once, and fails
//!   cleanly with [`DepthlinkError::Destroyed`] when used after `destroy`
//! - A [`Runtime`] tracks every live object so [`Runtime::cleanup`] can tear
//!   everything down newest-first
//! - [`Pipeline`] runs the start/stop/wait/poll session state machine and
//!   serves frames from a slot cache reused across cycles
//! - Hot-plug and sensor notifications fan out from one native callback to
//!   any number of listeners
//! - [`Align`], [`Colorizer`] and [`Syncer`] post-process frames under the
//!   same ownership rules
//!
//! The SDK itself sits behind the [`native::Sdk`] trait. [`native::sim::SimSdk`]
//! is an in-process implementation for tests and demos; the `realsense`
//! feature adds a librealsense2 binding.
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use depthlink::native::sim::{SimDevice, SimSdk};
//! use depthlink::Runtime;
//!
//! let sdk = Arc::new(SimSdk::with_devices(vec![SimDevice::d400("0001")]));
//! let rt = Runtime::new(sdk.clone());
//! let mut pipe = rt.pipeline().unwrap();
//! pipe.start().unwrap();
//!
//! sdk.deliver_all();
//! if let Some(frames) = pipe.wait_for_frames().unwrap() {
//!     if let Some(depth) = frames.depth_frame().unwrap() {
//!         let d = depth.as_depth().unwrap();
//!         println!("center: {:.3} m", d.distance(d.width() / 2, d.height() / 2).unwrap());
//!     }
//! }
//! pipe.stop().unwrap();
//! rt.cleanup();
//! ```

pub mod error;
pub mod types;
pub mod settings;
pub mod native;
pub mod registry;
mod handle;
pub mod event;
pub mod runtime;
pub mod context;
pub mod device;
pub mod sensor;
pub mod stream_profile;
pub mod config;
pub mod frame;
pub mod frameset;
pub mod pipeline;
pub mod processing;

pub use error::{DepthlinkError, NativeError, NativeErrorKind};
pub use types::*;
pub use settings::Settings;
pub use registry::{Destroyable, Registry};
pub use event::{EventBridge, EventDelivery, Emitter, EventQueue};
pub use runtime::Runtime;
pub use context::{Context, DeviceList, DevicesChanged};
pub use device::Device;
pub use sensor::Sensor;
pub use stream_profile::StreamProfile;
pub use config::{Config, StreamRequest};
pub use frame::{DepthFrame, Frame, FrameData, FrameKind, VideoFrame};
pub use frameset::{FrameSet, SlotId};
pub use pipeline::{Pipeline, PipelineProfile, PipelineState, StartOutcome};
pub use processing::{Align, Colorizer, Syncer};

/// Result type alias for depthlink operations.
pub type Result<T> = std::result::Result<T, DepthlinkError>;
