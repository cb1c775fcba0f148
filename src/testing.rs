//! Hand-written collaborators for unit tests.

use crate::camera::{CameraConstraints, CameraDevice, FacingMode, VideoStream};
use crate::coordinator::ScanObserver;
use crate::error::{CameraError, EngineError, LookupError, RecognitionError, ScanError};
use crate::lookup::PlateLookup;
use crate::recognizer::{OcrEngine, OcrParams};
use crate::types::{Frame, LookupOutcome, MatchKind, PlateMatch, RecognitionResult, ScanEvent};
use futures::future::{self, BoxFuture, FutureExt};
use image::DynamicImage;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{delay_for, Instant};

/// Polls `cond` until it holds or two seconds pass.
pub async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        delay_for(Duration::from_millis(5)).await;
    }
    cond()
}

struct CameraShared {
    ready: AtomicBool,
    stopped: AtomicBool,
    captures: AtomicUsize,
    streams_opened: AtomicUsize,
    streams_stopped: AtomicUsize,
}

pub struct MockCamera {
    facing: FacingMode,
    deny: bool,
    opened: Mutex<Vec<CameraConstraints>>,
    shared: Arc<CameraShared>,
}

impl MockCamera {
    pub fn new() -> Self {
        MockCamera {
            facing: FacingMode::Environment,
            deny: false,
            opened: Mutex::new(Vec::new()),
            shared: Arc::new(CameraShared {
                ready: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                captures: AtomicUsize::new(0),
                streams_opened: AtomicUsize::new(0),
                streams_stopped: AtomicUsize::new(0),
            }),
        }
    }

    pub fn facing(mut self, facing: FacingMode) -> Self {
        self.facing = facing;
        self
    }

    pub fn deny(mut self) -> Self {
        self.deny = true;
        self
    }

    pub fn never_ready(self) -> Self {
        self.shared.ready.store(false, Ordering::SeqCst);
        self
    }

    pub fn set_ready(&self) {
        self.shared.ready.store(true, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<CameraConstraints> {
        self.opened.lock().clone()
    }

    pub fn stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.shared.captures.load(Ordering::SeqCst)
    }

    pub fn streams_opened(&self) -> usize {
        self.shared.streams_opened.load(Ordering::SeqCst)
    }

    pub fn streams_stopped(&self) -> usize {
        self.shared.streams_stopped.load(Ordering::SeqCst)
    }
}

impl CameraDevice for MockCamera {
    fn open<'a>(
        &'a self,
        constraints: &'a CameraConstraints,
    ) -> BoxFuture<'a, Result<Box<dyn VideoStream>, CameraError>> {
        self.opened.lock().push(constraints.clone());
        let result: Result<Box<dyn VideoStream>, CameraError> = if self.deny {
            Err(CameraError::PermissionDenied)
        } else if constraints.facing.map_or(false, |f| f != self.facing) {
            Err(CameraError::Overconstrained("facing".to_string()))
        } else {
            self.shared.stopped.store(false, Ordering::SeqCst);
            self.shared.streams_opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockStream {
                shared: self.shared.clone(),
                stopped: AtomicBool::new(false),
            }))
        };
        future::ready(result).boxed()
    }
}

struct MockStream {
    shared: Arc<CameraShared>,
    stopped: AtomicBool,
}

impl VideoStream for MockStream {
    fn ready(&self) -> BoxFuture<'_, ()> {
        async move {
            // Polled so that every stream waiting on the camera sees it.
            while !self.shared.ready.load(Ordering::SeqCst) {
                delay_for(Duration::from_millis(2)).await;
            }
        }
        .boxed()
    }

    fn current_frame(&self) -> Option<Frame> {
        self.shared.captures.fetch_add(1, Ordering::SeqCst);
        Some(DynamicImage::new_rgb8(16, 8))
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.shared.streams_stopped.fetch_add(1, Ordering::SeqCst);
        }
        self.shared.stopped.store(true, Ordering::SeqCst);
    }
}

/// Returns its scripted texts in order, wrapping around.
pub struct ScriptedEngine {
    texts: Vec<String>,
    confidence: f64,
    gate: Option<Arc<Notify>>,
    fail_init: bool,
    fail_first: bool,
    calls: AtomicUsize,
    inits: AtomicUsize,
    terminations: AtomicUsize,
    params: Mutex<Option<OcrParams>>,
}

impl ScriptedEngine {
    pub fn new(texts: &[&str]) -> Self {
        ScriptedEngine {
            texts: texts.iter().map(|t| t.to_string()).collect(),
            confidence: 75.0,
            gate: None,
            fail_init: false,
            fail_first: false,
            calls: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
            terminations: AtomicUsize::new(0),
            params: Mutex::new(None),
        }
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Every recognition waits for one `notify` on `gate`.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn failing_first(mut self) -> Self {
        self.fail_first = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.params.lock().is_some()
    }

    pub fn init_params(&self) -> Option<OcrParams> {
        self.params.lock().clone()
    }
}

impl OcrEngine for ScriptedEngine {
    fn init<'a>(&'a self, params: &'a OcrParams) -> BoxFuture<'a, Result<(), EngineError>> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail_init {
            Err(EngineError::Unavailable("scripted".to_string()))
        } else {
            *self.params.lock() = Some(params.clone());
            Ok(())
        };
        future::ready(result).boxed()
    }

    fn recognize<'a>(
        &'a self,
        _frame: &'a Frame,
    ) -> BoxFuture<'a, Result<RecognitionResult, RecognitionError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_first && call == 0 {
                return Err(RecognitionError::Engine("scripted".to_string()));
            }
            let text = if self.texts.is_empty() {
                String::new()
            } else {
                self.texts[call % self.texts.len()].clone()
            };
            Ok(RecognitionResult {
                text,
                confidence: self.confidence,
            })
        }
        .boxed()
    }

    fn terminate(&self) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.params.lock().take();
    }
}

/// Plates not configured with `with` are not registered.
pub struct MockLookup {
    outcomes: HashMap<String, LookupOutcome>,
    failing: HashSet<String>,
    gate: Option<Arc<Notify>>,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl MockLookup {
    pub fn new() -> Self {
        MockLookup {
            outcomes: HashMap::new(),
            failing: HashSet::new(),
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with(mut self, plate: &str, outcome: LookupOutcome) -> Self {
        self.outcomes.insert(plate.to_string(), outcome);
        self
    }

    pub fn failing(mut self, plate: &str) -> Self {
        self.failing.insert(plate.to_string());
        self
    }

    /// Every lookup waits for one `notify` on `gate` before answering.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(plate, _)| plate.clone()).collect()
    }

    /// When each lookup was issued, in call order.
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().iter().map(|(_, at)| *at).collect()
    }
}

impl PlateLookup for MockLookup {
    fn lookup<'a>(&'a self, plate: &'a str) -> BoxFuture<'a, Result<LookupOutcome, LookupError>> {
        self.calls.lock().push((plate.to_string(), Instant::now()));
        async move {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.failing.contains(plate) {
                return Err(LookupError::Network("scripted".to_string()));
            }
            Ok(self
                .outcomes
                .get(plate)
                .cloned()
                .unwrap_or(LookupOutcome::NotRegistered))
        }
        .boxed()
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ScanEvent>>,
    no_matches: AtomicUsize,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<ScanEvent> {
        self.events.lock().clone()
    }

    pub fn no_matches(&self) -> usize {
        self.no_matches.load(Ordering::SeqCst)
    }
}

impl ScanObserver for RecordingObserver {
    fn on_matched(&self, kind: MatchKind, plate_match: &PlateMatch) {
        assert_eq!(kind, plate_match.kind);
        self.events.lock().push(ScanEvent::Matched(plate_match.clone()));
    }

    fn on_error(&self, error: &ScanError) {
        self.events.lock().push(ScanEvent::Failed(error.to_string()));
    }

    fn on_stopped(&self) {
        self.events.lock().push(ScanEvent::Stopped);
    }

    fn on_no_match(&self) {
        self.no_matches.fetch_add(1, Ordering::SeqCst);
    }
}
