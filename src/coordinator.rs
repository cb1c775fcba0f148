//! The scan session state machine.
//!
//! One fixed-interval ticker drives the pipeline capture -> recognize ->
//! extract -> lookup. At most one cycle is in flight; a tick that finds the
//! previous cycle still running is dropped, not queued.
//!
//! Every session carries an epoch. Stopping (or restarting) bumps it, and any
//! cycle or start sequence that resumes under an old epoch discards its
//! result without touching the session. A cycle from a stopped session still
//! counts as in flight until it returns, so a restarted session cannot run a
//! second recognition next to it.

use crate::camera::FrameSampler;
use crate::error::ScanError;
use crate::extractor::PlateExtractor;
use crate::lookup::PlateLookup;
use crate::recognizer::TextRecognizer;
use crate::types::{MatchKind, PlateCandidate, PlateMatch, ScanEvent, VehicleRecord};
use futures::future::{abortable, AbortHandle};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::time::{self, delay_for, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Starting,
    Scanning,
    Matched,
    Stopped,
    Failed,
}

impl ScanState {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Starting => "starting",
            ScanState::Scanning => "scanning",
            ScanState::Matched => "matched",
            ScanState::Stopped => "stopped",
            ScanState::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// UI side of the scanner.
pub trait ScanObserver: Send + Sync {
    fn on_matched(&self, kind: MatchKind, plate_match: &PlateMatch);
    fn on_error(&self, error: &ScanError);
    fn on_stopped(&self);
    /// A cycle finished without a registered plate; scanning continues.
    fn on_no_match(&self) {}
}

/// Forwards observer callbacks as [`ScanEvent`]s over a channel.
pub struct ChannelObserver {
    tx: Mutex<Sender<ScanEvent>>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<ScanEvent>) -> Self {
        ChannelObserver { tx: Mutex::new(tx) }
    }

    fn forward(&self, event: ScanEvent) {
        if let Err(e) = self.tx.lock().try_send(event) {
            warn!("Dropping scan event: {}", e);
        }
    }
}

impl ScanObserver for ChannelObserver {
    fn on_matched(&self, _kind: MatchKind, plate_match: &PlateMatch) {
        self.forward(ScanEvent::Matched(plate_match.clone()));
    }

    fn on_error(&self, error: &ScanError) {
        self.forward(ScanEvent::Failed(error.to_string()));
    }

    fn on_stopped(&self) {
        self.forward(ScanEvent::Stopped);
    }
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub tick_interval: Duration,
    /// Pause between consecutive lookups within one cycle.
    pub lookup_delay: Duration,
}

/// Shortest tick period the ticker will run at.
const MIN_TICK: Duration = Duration::from_millis(1);

impl Default for ScanSettings {
    fn default() -> Self {
        ScanSettings {
            tick_interval: Duration::from_secs(1),
            lookup_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: ScanState,
    pub busy: bool,
    pub tick_count: u64,
    pub skipped_ticks: u64,
    pub last_error: Option<String>,
    pub matched: Option<PlateMatch>,
}

impl SessionSnapshot {
    pub fn is_active(&self) -> bool {
        match self.state {
            ScanState::Starting | ScanState::Scanning => true,
            _ => false,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "sessionId": self.session_id.to_string(),
            "state": self.state.as_str(),
            "active": self.is_active(),
            "busy": self.busy,
            "tickCount": self.tick_count,
            "skippedTicks": self.skipped_ticks,
            "lastError": self.last_error,
            "matched": self.matched.as_ref().map(PlateMatch::to_json),
        })
    }
}

struct Session {
    id: Uuid,
    epoch: u64,
    state: ScanState,
    busy: bool,
    /// A spawned cycle has not returned yet. Survives `stop`.
    in_flight: bool,
    tick_count: u64,
    skipped_ticks: u64,
    last_error: Option<String>,
    matched: Option<PlateMatch>,
    ticker: Option<AbortHandle>,
}

impl Session {
    fn cancel_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

struct Inner {
    settings: ScanSettings,
    sampler: FrameSampler,
    recognizer: TextRecognizer,
    extractor: PlateExtractor,
    lookup: Arc<dyn PlateLookup>,
    observer: Arc<dyn ScanObserver>,
    session: Mutex<Session>,
}

#[derive(Clone)]
pub struct ScanCoordinator {
    inner: Arc<Inner>,
}

impl ScanCoordinator {
    pub fn new(
        settings: ScanSettings,
        sampler: FrameSampler,
        recognizer: TextRecognizer,
        lookup: Arc<dyn PlateLookup>,
        observer: Arc<dyn ScanObserver>,
    ) -> Self {
        ScanCoordinator {
            inner: Arc::new(Inner {
                settings,
                sampler,
                recognizer,
                extractor: PlateExtractor::new(),
                lookup,
                observer,
                session: Mutex::new(Session {
                    id: Uuid::nil(),
                    epoch: 0,
                    state: ScanState::Idle,
                    busy: false,
                    in_flight: false,
                    tick_count: 0,
                    skipped_ticks: 0,
                    last_error: None,
                    matched: None,
                    ticker: None,
                }),
            }),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let s = self.inner.session.lock();
        SessionSnapshot {
            session_id: s.id,
            state: s.state,
            busy: s.busy,
            tick_count: s.tick_count,
            skipped_ticks: s.skipped_ticks,
            last_error: s.last_error.clone(),
            matched: s.matched.clone(),
        }
    }

    pub fn state(&self) -> ScanState {
        self.inner.session.lock().state
    }

    /// Opens the camera, then the OCR engine, then arms the ticker. Allowed
    /// from `Idle`, `Stopped` and `Failed`.
    pub async fn start(&self) -> Result<(), ScanError> {
        let (epoch, id) = {
            let mut s = self.inner.session.lock();
            match s.state {
                ScanState::Starting | ScanState::Scanning | ScanState::Matched => {
                    return Err(ScanError::AlreadyActive)
                }
                ScanState::Idle | ScanState::Stopped | ScanState::Failed => {}
            }
            s.epoch += 1;
            s.id = Uuid::new_v4();
            s.state = ScanState::Starting;
            s.busy = false;
            s.tick_count = 0;
            s.skipped_ticks = 0;
            s.last_error = None;
            s.matched = None;
            (s.epoch, s.id)
        };
        info!("[{}] Starting scan session", id);

        let stream = match self.inner.sampler.open().await {
            Ok(stream) => stream,
            Err(e) => return Err(self.inner.fail_start(epoch, ScanError::Camera(e))),
        };
        {
            let s = self.inner.session.lock();
            if s.epoch != epoch {
                drop(s);
                stream.stop();
                return Err(self.inner.abandon_start(id));
            }
            self.inner.sampler.install(stream);
        }
        if let Err(e) = self.inner.recognizer.init().await {
            return Err(self.inner.fail_start(epoch, ScanError::Engine(e)));
        }

        let mut s = self.inner.session.lock();
        if s.epoch != epoch {
            drop(s);
            return Err(self.inner.abandon_start(id));
        }
        s.state = ScanState::Scanning;
        s.ticker = Some(self.inner.arm_ticker(epoch));
        info!("[{}] Scanning every {:?}", id, self.inner.settings.tick_interval);
        Ok(())
    }

    /// Leaves `Matched` and resumes scanning with the camera and engine still
    /// warm.
    pub fn retry(&self) -> Result<(), ScanError> {
        let mut s = self.inner.session.lock();
        if s.state != ScanState::Matched {
            return Err(ScanError::NotMatched);
        }
        s.matched = None;
        s.busy = false;
        s.state = ScanState::Scanning;
        s.ticker = Some(self.inner.arm_ticker(s.epoch));
        info!("[{}] Scanning again", s.id);
        Ok(())
    }

    /// Cancels the ticker and releases the camera and engine. Safe from any
    /// state, including while `start` or a cycle is still running.
    pub fn stop(&self) {
        let (previous, id) = {
            let mut s = self.inner.session.lock();
            s.cancel_ticker();
            s.epoch += 1;
            s.busy = false;
            let previous = s.state;
            s.state = ScanState::Stopped;
            (previous, s.id)
        };
        self.inner.sampler.stop();
        self.inner.recognizer.terminate();
        if previous != ScanState::Stopped {
            info!("[{}] Scan session stopped ({} -> stopped)", id, previous);
            self.inner.observer.on_stopped();
        }
    }
}

impl Inner {
    fn is_current(&self, epoch: u64) -> bool {
        self.session.lock().epoch == epoch
    }

    fn release(&self) {
        self.sampler.stop();
        self.recognizer.terminate();
    }

    /// Cleanup for a start that lost its session. A newer session may already
    /// own the camera and engine, in which case they are left alone.
    fn abandon_start(&self, id: Uuid) -> ScanError {
        info!("[{}] Start abandoned; session was stopped", id);
        let newer_active = match self.session.lock().state {
            ScanState::Starting | ScanState::Scanning | ScanState::Matched => true,
            ScanState::Idle | ScanState::Stopped | ScanState::Failed => false,
        };
        if !newer_active {
            self.release();
        }
        ScanError::Cancelled
    }

    fn fail_start(&self, epoch: u64, err: ScanError) -> ScanError {
        let id = {
            let mut s = self.session.lock();
            if s.epoch != epoch {
                let id = s.id;
                drop(s);
                debug!("[{}] Ignoring start failure of a stopped session: {}", id, err);
                return self.abandon_start(id);
            }
            s.state = ScanState::Failed;
            s.last_error = Some(err.to_string());
            s.id
        };
        self.release();
        error!("[{}] {}", id, err);
        self.observer.on_error(&err);
        err
    }

    fn arm_ticker(self: &Arc<Self>, epoch: u64) -> AbortHandle {
        let inner = Arc::clone(self);
        let period = self.settings.tick_interval.max(MIN_TICK);
        let (ticker, handle) = abortable(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            while inner.is_current(epoch) {
                interval.tick().await;
                inner.on_tick(epoch);
            }
        });
        tokio::spawn(ticker);
        handle
    }

    fn on_tick(self: &Arc<Self>, epoch: u64) {
        let (id, tick) = {
            let mut s = self.session.lock();
            if s.epoch != epoch || s.state != ScanState::Scanning {
                return;
            }
            if s.busy || s.in_flight {
                s.skipped_ticks += 1;
                debug!("[{}] Previous cycle still running; tick skipped", s.id);
                return;
            }
            s.busy = true;
            s.in_flight = true;
            s.tick_count += 1;
            (s.id, s.tick_count)
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let found = inner.scan_frame(epoch, id, tick).await;
            inner.finish_cycle(epoch, found);
        });
    }

    /// One cycle. Returns the first candidate the backend recognises.
    async fn scan_frame(
        &self,
        epoch: u64,
        id: Uuid,
        tick: u64,
    ) -> Option<(PlateCandidate, MatchKind, VehicleRecord)> {
        let frame = match self.sampler.capture_frame() {
            Some(frame) => frame,
            None => {
                debug!("[{}] Tick {}: no frame yet", id, tick);
                return None;
            }
        };
        let result = match self.recognizer.recognize(&frame).await {
            Ok(result) => result,
            Err(e) => {
                warn!("[{}] Tick {}: recognition failed: {}", id, tick, e);
                return None;
            }
        };
        if !self.is_current(epoch) {
            return None;
        }

        let candidates = self.extractor.extract(&result.text);
        if candidates.is_empty() {
            debug!("[{}] Tick {}: no plate in {:?}", id, tick, result.text);
            return None;
        }
        debug!(
            "[{}] Tick {}: candidates {:?}",
            id,
            tick,
            candidates.iter().map(|c| c.plate.as_str()).collect::<Vec<_>>()
        );

        for (i, candidate) in candidates.into_iter().enumerate() {
            if i > 0 {
                delay_for(self.settings.lookup_delay).await;
            }
            if !self.is_current(epoch) {
                return None;
            }
            match self.lookup.lookup(&candidate.plate).await {
                Ok(outcome) => match outcome.into_match() {
                    Some((kind, record)) => return Some((candidate, kind, record)),
                    None => debug!("[{}] {} is not registered", id, candidate.plate),
                },
                Err(e) => warn!("[{}] Lookup for {} failed: {}", id, candidate.plate, e),
            }
        }
        None
    }

    fn finish_cycle(&self, epoch: u64, found: Option<(PlateCandidate, MatchKind, VehicleRecord)>) {
        let plate_match = {
            let mut s = self.session.lock();
            s.in_flight = false;
            if s.epoch != epoch || s.state != ScanState::Scanning {
                debug!("[{}] Discarding result of a cancelled cycle", s.id);
                return;
            }
            match found {
                None => {
                    s.busy = false;
                    None
                }
                Some((candidate, kind, record)) => {
                    s.cancel_ticker();
                    s.state = ScanState::Matched;
                    let plate_match = PlateMatch {
                        kind,
                        candidate,
                        record,
                    };
                    s.matched = Some(plate_match.clone());
                    info!("[{}] Matched {} ({})", s.id, plate_match.candidate.plate, kind);
                    Some(plate_match)
                }
            }
        };
        match plate_match {
            Some(m) => self.observer.on_matched(m.kind, &m),
            None => self.observer.on_no_match(),
        }
    }
}
