use crate::error::{EngineError, RecognitionError};
use crate::types::{Frame, RecognitionResult};
use futures::future::BoxFuture;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;

pub const PLATE_WHITELIST: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSegMode {
    /// Treat the image as a single line of text.
    SingleLine,
    Auto,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrParams {
    pub language: String,
    pub whitelist: String,
    pub page_seg_mode: PageSegMode,
}

impl OcrParams {
    /// Single line, uppercase letters and digits only.
    pub fn plate(language: &str) -> Self {
        OcrParams {
            language: language.to_string(),
            whitelist: PLATE_WHITELIST.to_string(),
            page_seg_mode: PageSegMode::SingleLine,
        }
    }
}

/// An OCR backend. Implementations need not guard against concurrent
/// `recognize` calls; the coordinator never makes them.
pub trait OcrEngine: Send + Sync {
    fn init<'a>(&'a self, params: &'a OcrParams) -> BoxFuture<'a, Result<(), EngineError>>;
    fn recognize<'a>(
        &'a self,
        frame: &'a Frame,
    ) -> BoxFuture<'a, Result<RecognitionResult, RecognitionError>>;
    fn terminate(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Uninitialized,
    Ready,
    Terminated,
}

/// Owns the lifecycle of one [`OcrEngine`].
pub struct TextRecognizer {
    engine: Arc<dyn OcrEngine>,
    params: OcrParams,
    state: Mutex<EngineState>,
}

impl TextRecognizer {
    pub fn new(engine: Arc<dyn OcrEngine>, params: OcrParams) -> Self {
        TextRecognizer {
            engine,
            params,
            state: Mutex::new(EngineState::Uninitialized),
        }
    }

    pub async fn init(&self) -> Result<(), EngineError> {
        if self.is_ready() {
            return Ok(());
        }
        self.engine.init(&self.params).await?;
        *self.state.lock() = EngineState::Ready;
        info!("OCR engine ready ({:?})", self.params.page_seg_mode);
        Ok(())
    }

    /// No confidence threshold is applied here; shape filtering happens in
    /// the extractor.
    pub async fn recognize(&self, frame: &Frame) -> Result<RecognitionResult, RecognitionError> {
        if !self.is_ready() {
            return Err(RecognitionError::NotReady);
        }
        let mut result = self.engine.recognize(frame).await?;
        result.confidence = result.confidence.max(0.0).min(100.0);
        debug!("OCR read {:?} ({:.0}%)", result.text, result.confidence);
        Ok(result)
    }

    pub fn is_ready(&self) -> bool {
        *self.state.lock() == EngineState::Ready
    }

    pub fn terminate(&self) {
        let mut state = self.state.lock();
        if *state == EngineState::Ready {
            self.engine.terminate();
            info!("OCR engine terminated");
        }
        if *state != EngineState::Uninitialized {
            *state = EngineState::Terminated;
        }
    }
}
