use failure::Fail;
use std::time::Duration;

#[derive(Debug, Fail)]
pub enum CameraError {
    #[fail(display = "camera permission denied")]
    PermissionDenied,
    #[fail(display = "no camera available")]
    NotFound,
    #[fail(display = "camera API unsupported")]
    Unsupported,
    #[fail(display = "camera cannot satisfy constraints: {}", _0)]
    Overconstrained(String),
    #[fail(display = "camera stream not ready after {:?}", _0)]
    Timeout(Duration),
}

#[derive(Debug, Fail)]
pub enum EngineError {
    #[fail(display = "OCR engine unavailable: {}", _0)]
    Unavailable(String),
    #[fail(display = "OCR engine rejected parameters: {}", _0)]
    InvalidParams(String),
}

#[derive(Debug, Fail)]
pub enum RecognitionError {
    #[fail(display = "OCR engine is not initialized")]
    NotReady,
    #[fail(display = "could not encode frame: {}", _0)]
    Encode(String),
    #[fail(display = "OCR engine failed: {}", _0)]
    Engine(String),
}

#[derive(Debug, Fail)]
pub enum LookupError {
    #[fail(display = "lookup request failed: {}", _0)]
    Network(String),
    #[fail(display = "lookup returned HTTP {}", _0)]
    Status(u16),
    #[fail(display = "lookup returned malformed body: {}", _0)]
    Malformed(String),
}

/// Errors that end (or refuse) a scan session.
#[derive(Debug, Fail)]
pub enum ScanError {
    #[fail(display = "camera could not start: {}", _0)]
    Camera(#[cause] CameraError),
    #[fail(display = "OCR engine could not start: {}", _0)]
    Engine(#[cause] EngineError),
    #[fail(display = "scan session already active")]
    AlreadyActive,
    #[fail(display = "no matched plate to retry from")]
    NotMatched,
    #[fail(display = "scan session stopped while starting")]
    Cancelled,
}

#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "invalid value {:?} for {}", value, name)]
    Invalid { name: &'static str, value: String },
}
