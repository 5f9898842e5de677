use std::fmt;

/// Errors returned by the managed layer.
///
/// Expected absence (no frames, no device, already started) is never an error;
/// those cases come back as `Ok(None)` or a sentinel value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DepthlinkError {
    #[error("native error: {0}")]
    Native(#[from] NativeError),

    #[error("{0} has already been destroyed")]
    Destroyed(&'static str),

    #[error("event queue closed")]
    EventQueueClosed,
}

impl DepthlinkError {
    /// The underlying native error, if this is a native-call failure.
    pub fn native(&self) -> Option<&NativeError> {
        match self {
            DepthlinkError::Native(e) => Some(e),
            _ => None,
        }
    }

    /// True if this error came from calling into a destroyed wrapper.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, DepthlinkError::Destroyed(_))
    }
}

/// Exception category reported by the capture SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeErrorKind {
    Unknown,
    CameraDisconnected,
    Backend,
    InvalidValue,
    WrongApiCallSequence,
    NotImplemented,
    Device,
    Io,
}

impl NativeErrorKind {
    /// Map the SDK's numeric exception type.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => NativeErrorKind::CameraDisconnected,
            2 => NativeErrorKind::Backend,
            3 => NativeErrorKind::InvalidValue,
            4 => NativeErrorKind::WrongApiCallSequence,
            5 => NativeErrorKind::NotImplemented,
            6 => NativeErrorKind::Device,
            7 => NativeErrorKind::Io,
            _ => NativeErrorKind::Unknown,
        }
    }
}

/// A failed call into the capture SDK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    /// Name of the native function that failed.
    pub function: String,
    /// Message reported by the SDK.
    pub message: String,
    pub kind: NativeErrorKind,
}

impl NativeError {
    pub fn new(function: impl Into<String>, message: impl Into<String>, kind: NativeErrorKind) -> Self {
        Self {
            function: function.into(),
            message: message.into(),
            kind,
        }
    }

    /// Argument and call-sequence errors leave the device usable; everything
    /// else is expected to end the capture session.
    pub fn recoverable(&self) -> bool {
        matches!(
            self.kind,
            NativeErrorKind::InvalidValue
                | NativeErrorKind::WrongApiCallSequence
                | NativeErrorKind::NotImplemented
        )
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.function, self.message)
    }
}

impl std::error::Error for NativeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        let e = NativeError::new("rs2_set_option", "out of range", NativeErrorKind::InvalidValue);
        assert!(e.recoverable());
        let e = NativeError::new("rs2_pipeline_start", "gone", NativeErrorKind::CameraDisconnected);
        assert!(!e.recoverable());
    }

    #[test]
    fn test_display_carries_native_message() {
        let err: DepthlinkError =
            NativeError::new("rs2_open", "busy", NativeErrorKind::Backend).into();
        assert_eq!(err.to_string(), "native error: rs2_open failed: busy");
        assert!(err.native().is_some());
        assert!(!err.is_destroyed());
        assert!(DepthlinkError::Destroyed("pipeline").is_destroyed());
    }
}
