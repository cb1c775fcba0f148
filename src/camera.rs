use crate::error::CameraError;
use crate::types::Frame;
use futures::future::BoxFuture;
use image::GenericImageView;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    /// Rear camera, pointed away from the operator.
    Environment,
    User,
}

impl FacingMode {
    pub fn parse(s: &str) -> Option<FacingMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "environment" | "rear" | "back" => Some(FacingMode::Environment),
            "user" | "front" => Some(FacingMode::User),
            _ => None,
        }
    }
}

/// What to ask the camera for. `None` fields are unconstrained; the
/// resolution is an ideal, not a requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraConstraints {
    pub facing: Option<FacingMode>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl CameraConstraints {
    pub fn any_video() -> Self {
        CameraConstraints {
            facing: None,
            width: None,
            height: None,
        }
    }

    /// Rear camera at the ideal resolution, then rear camera at any
    /// resolution, then whatever video the device has.
    pub fn fallback_tiers(width: u32, height: u32) -> Vec<CameraConstraints> {
        vec![
            CameraConstraints {
                facing: Some(FacingMode::Environment),
                width: Some(width),
                height: Some(height),
            },
            CameraConstraints {
                facing: Some(FacingMode::Environment),
                width: None,
                height: None,
            },
            CameraConstraints::any_video(),
        ]
    }
}

impl fmt::Display for CameraConstraints {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.facing, self.width, self.height) {
            (None, None, None) => write!(f, "any video"),
            (facing, width, height) => write!(f, "facing={:?} size={:?}x{:?}", facing, width, height),
        }
    }
}

/// A source of camera streams.
pub trait CameraDevice: Send + Sync {
    fn open<'a>(
        &'a self,
        constraints: &'a CameraConstraints,
    ) -> BoxFuture<'a, Result<Box<dyn VideoStream>, CameraError>>;
}

/// A live stream handed out by a [`CameraDevice`].
pub trait VideoStream: Send + Sync {
    /// Resolves once the stream produces frames.
    fn ready(&self) -> BoxFuture<'_, ()>;
    /// The most recent frame, or `None` if nothing has been produced yet.
    fn current_frame(&self) -> Option<Frame>;
    /// Releases the underlying tracks.
    fn stop(&self);
}

pub struct FrameSampler {
    device: Arc<dyn CameraDevice>,
    tiers: Vec<CameraConstraints>,
    ready_timeout: Duration,
    stream: Mutex<Option<Box<dyn VideoStream>>>,
}

impl FrameSampler {
    pub fn new(
        device: Arc<dyn CameraDevice>,
        tiers: Vec<CameraConstraints>,
        ready_timeout: Duration,
    ) -> Self {
        FrameSampler {
            device,
            tiers,
            ready_timeout,
            stream: Mutex::new(None),
        }
    }

    /// Opens the camera, walking the constraint tiers until one is accepted,
    /// and waits for the first frame. Permission errors end the walk early.
    pub async fn start(&self) -> Result<(), CameraError> {
        self.stop();
        let stream = self.open().await?;
        self.install(stream);
        Ok(())
    }

    /// Walks the tiers and returns a stream that has produced a frame,
    /// without making it the current one.
    pub async fn open(&self) -> Result<Box<dyn VideoStream>, CameraError> {
        let mut last_error = CameraError::NotFound;
        for constraints in self.tiers.iter() {
            let stream = match self.device.open(constraints).await {
                Ok(stream) => stream,
                Err(CameraError::PermissionDenied) => return Err(CameraError::PermissionDenied),
                Err(e) => {
                    warn!("Camera rejected {}: {}", constraints, e);
                    last_error = e;
                    continue;
                }
            };
            if timeout(self.ready_timeout, stream.ready()).await.is_err() {
                stream.stop();
                return Err(CameraError::Timeout(self.ready_timeout));
            }
            info!("Camera stream opened with {}", constraints);
            return Ok(stream);
        }
        Err(last_error)
    }

    /// Makes `stream` the one frames are captured from. A stream it replaces
    /// is stopped.
    pub fn install(&self, stream: Box<dyn VideoStream>) {
        if let Some(old) = self.stream.lock().replace(stream) {
            old.stop();
            info!("Replaced camera stream stopped");
        }
    }

    /// Snapshot of the current frame; `None` means skip this tick.
    pub fn capture_frame(&self) -> Option<Frame> {
        let guard = self.stream.lock();
        let frame = guard.as_ref()?.current_frame()?;
        if frame.width() == 0 || frame.height() == 0 {
            debug!("Ignoring empty frame");
            return None;
        }
        Some(frame)
    }

    pub fn is_running(&self) -> bool {
        self.stream.lock().is_some()
    }

    pub fn stop(&self) {
        if let Some(stream) = self.stream.lock().take() {
            stream.stop();
            info!("Camera stream stopped");
        }
    }
}
