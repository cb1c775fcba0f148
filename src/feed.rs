//! A camera whose frames are pushed in over HTTP by the capture device.

use crate::camera::{CameraConstraints, CameraDevice, FacingMode, VideoStream};
use crate::error::CameraError;
use crate::types::Frame;
use futures::future::{self, BoxFuture, FutureExt};
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

struct Shared {
    facing: Mutex<FacingMode>,
    latest: Mutex<Option<Frame>>,
    pushed: AtomicU64,
    /// Carries the push count; every waiting stream sees each push.
    arrived_tx: watch::Sender<u64>,
    arrived_rx: watch::Receiver<u64>,
}

#[derive(Clone)]
pub struct FrameFeed {
    shared: Arc<Shared>,
}

impl FrameFeed {
    /// `facing` is the direction the pushing device's camera points.
    pub fn new(facing: FacingMode) -> Self {
        let (arrived_tx, arrived_rx) = watch::channel(0);
        FrameFeed {
            shared: Arc::new(Shared {
                facing: Mutex::new(facing),
                latest: Mutex::new(None),
                pushed: AtomicU64::new(0),
                arrived_tx,
                arrived_rx,
            }),
        }
    }

    pub fn push(&self, frame: Frame) {
        *self.shared.latest.lock() = Some(frame);
        let n = self.shared.pushed.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Frame {} received", n);
        let _ = self.shared.arrived_tx.broadcast(n);
    }

    pub fn facing(&self) -> FacingMode {
        *self.shared.facing.lock()
    }

    /// Called when the capture device reports which way it now points.
    /// Only streams opened afterwards are checked against it.
    pub fn set_facing(&self, facing: FacingMode) {
        let mut current = self.shared.facing.lock();
        if *current != facing {
            debug!("Feed now faces {:?}", facing);
            *current = facing;
        }
    }

    pub fn frames_received(&self) -> u64 {
        self.shared.pushed.load(Ordering::Relaxed)
    }
}

impl CameraDevice for FrameFeed {
    fn open<'a>(
        &'a self,
        constraints: &'a CameraConstraints,
    ) -> BoxFuture<'a, Result<Box<dyn VideoStream>, CameraError>> {
        let feed_facing = self.facing();
        let result: Result<Box<dyn VideoStream>, CameraError> = match constraints.facing {
            Some(facing) if facing != feed_facing => Err(CameraError::Overconstrained(
                format!("feed faces {:?}", feed_facing),
            )),
            _ => Ok(Box::new(FeedStream {
                shared: self.shared.clone(),
                stopped: AtomicBool::new(false),
            })),
        };
        future::ready(result).boxed()
    }
}

struct FeedStream {
    shared: Arc<Shared>,
    stopped: AtomicBool,
}

impl VideoStream for FeedStream {
    fn ready(&self) -> BoxFuture<'_, ()> {
        async move {
            let mut arrived = self.shared.arrived_rx.clone();
            loop {
                let has_frame = self.shared.latest.lock().is_some();
                if has_frame {
                    return;
                }
                if arrived.recv().await.is_none() {
                    return;
                }
            }
        }
        .boxed()
    }

    fn current_frame(&self) -> Option<Frame> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        self.shared.latest.lock().clone()
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            // A restarted stream must wait for a fresh frame.
            *self.shared.latest.lock() = None;
        }
    }
}
