use std::fmt;
use std::sync::Arc;

use crate::handle::Handle;
use crate::native::{HandleKind, RawHandle};
use crate::registry::Destroyable;
use crate::runtime::Shared;
use crate::types::{Format, StreamKind};
use crate::Result;

/// Request for one stream. Unset fields are wildcards the SDK resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub kind: StreamKind,
    /// `-1` for any index.
    pub index: i32,
    /// `0` for any width.
    pub width: u32,
    /// `0` for any height.
    pub height: u32,
    pub format: Format,
    /// `0` for any frame rate.
    pub fps: u32,
}

impl StreamRequest {
    pub const ANY_INDEX: i32 = -1;

    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            index: Self::ANY_INDEX,
            width: 0,
            height: 0,
            format: Format::Any,
            fps: 0,
        }
    }

    pub fn index(mut self, index: i32) -> Self {
        self.index = index;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }
}

/// Stream selection handed to `Pipeline::start_with_config`.
pub struct Config {
    handle: Arc<Handle>,
}

impl Config {
    pub(crate) fn create(shared: &Arc<Shared>) -> Result<Self> {
        let raw = shared.sdk.create_config().map_err(|e| shared.report(e))?;
        Ok(Self {
            handle: Handle::adopt(shared, HandleKind::Config, raw),
        })
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        self.handle.raw()
    }

    pub fn enable_stream(&self, request: StreamRequest) -> Result<()> {
        log::debug!("config: enable {:?}", request);
        self.handle.call(|sdk, c| sdk.config_enable_stream(c, &request))
    }

    /// Drop a previously enabled stream. `index: None` disables every index
    /// of `kind`.
    pub fn disable_stream(&self, kind: StreamKind, index: Option<i32>) -> Result<()> {
        self.handle.call(|sdk, c| sdk.config_disable_stream(c, kind, index))
    }

    pub fn enable_all_streams(&self) -> Result<()> {
        self.handle.call(|sdk, c| sdk.config_enable_all_streams(c))
    }

    pub fn disable_all_streams(&self) -> Result<()> {
        self.handle.call(|sdk, c| sdk.config_disable_all_streams(c))
    }

    /// Restrict the pipeline to the device with this serial number.
    pub fn enable_device(&self, serial: &str) -> Result<()> {
        self.handle.call(|sdk, c| sdk.config_enable_device(c, serial))
    }

    pub fn destroy(&self) {
        self.handle.destroy();
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("destroyed", &!self.handle.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_are_wildcards() {
        let r = StreamRequest::new(StreamKind::Color);
        assert_eq!(r.index, -1);
        assert_eq!((r.width, r.height, r.fps), (0, 0, 0));
        assert_eq!(r.format, Format::Any);

        let r = r.index(0).resolution(1280, 720).format(Format::Rgb8).fps(30);
        assert_eq!(r.index, 0);
        assert_eq!((r.width, r.height, r.fps), (1280, 720, 30));
    }
}
