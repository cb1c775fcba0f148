//! [`OcrEngine`] backed by the `tesseract` command line tool.

use crate::error::{EngineError, RecognitionError};
use crate::recognizer::{OcrEngine, OcrParams, PageSegMode};
use crate::types::{Frame, RecognitionResult};
use futures::future::{BoxFuture, FutureExt};
use image::ImageOutputFormat;
use log::debug;
use parking_lot::Mutex;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub struct TesseractEngine {
    program: String,
    args: Mutex<Option<Vec<String>>>,
}

impl TesseractEngine {
    pub fn new(program: &str) -> Self {
        TesseractEngine {
            program: program.to_string(),
            args: Mutex::new(None),
        }
    }

    async fn check_installed(&self) -> Result<(), EngineError> {
        let output = Command::new(&self.program)
            .arg("--version")
            .output()
            .await
            .map_err(|e| EngineError::Unavailable(format!("{}: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(EngineError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        debug!(
            "Using {}",
            String::from_utf8_lossy(&output.stdout).lines().next().unwrap_or("tesseract")
        );
        Ok(())
    }

    async fn run(&self, args: Vec<String>, png: Vec<u8>) -> Result<String, RecognitionError> {
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RecognitionError::Engine(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&png)
                .await
                .map_err(|e| RecognitionError::Engine(e.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RecognitionError::Engine(e.to_string()))?;
        if !output.status.success() {
            return Err(RecognitionError::Engine(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn command_args(params: &OcrParams) -> Result<Vec<String>, EngineError> {
    if params.language.trim().is_empty() {
        return Err(EngineError::InvalidParams("empty language".to_string()));
    }
    let psm = match params.page_seg_mode {
        PageSegMode::SingleLine => "7",
        PageSegMode::Auto => "3",
    };
    let mut args = vec![
        "stdin".to_string(),
        "stdout".to_string(),
        "-l".to_string(),
        params.language.clone(),
        "--psm".to_string(),
        psm.to_string(),
    ];
    if !params.whitelist.is_empty() {
        args.push("-c".to_string());
        args.push(format!("tessedit_char_whitelist={}", params.whitelist));
    }
    args.push("tsv".to_string());
    Ok(args)
}

/// Rebuilds line text and mean word confidence from tesseract's TSV output.
pub fn parse_tsv(tsv: &str) -> RecognitionResult {
    let mut lines: Vec<((u32, u32, u32, u32), Vec<String>)> = Vec::new();
    let mut confidences = Vec::new();
    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let word = cols[11].trim();
        let conf: f64 = cols[10].parse().unwrap_or(-1.0);
        if word.is_empty() || conf < 0.0 {
            continue;
        }
        let n = |i: usize| cols[i].parse::<u32>().unwrap_or(0);
        let key = (n(1), n(2), n(3), n(4));
        match lines.last_mut() {
            Some((k, words)) if *k == key => words.push(word.to_string()),
            _ => lines.push((key, vec![word.to_string()])),
        }
        confidences.push(conf);
    }
    let text = lines
        .iter()
        .map(|(_, words)| words.join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };
    RecognitionResult { text, confidence }
}

impl OcrEngine for TesseractEngine {
    fn init<'a>(&'a self, params: &'a OcrParams) -> BoxFuture<'a, Result<(), EngineError>> {
        async move {
            let args = command_args(params)?;
            self.check_installed().await?;
            *self.args.lock() = Some(args);
            Ok(())
        }
        .boxed()
    }

    fn recognize<'a>(
        &'a self,
        frame: &'a Frame,
    ) -> BoxFuture<'a, Result<RecognitionResult, RecognitionError>> {
        async move {
            let args = self.args.lock().clone().ok_or(RecognitionError::NotReady)?;
            let mut png = Vec::new();
            frame
                .write_to(&mut png, ImageOutputFormat::Png)
                .map_err(|e| RecognitionError::Encode(e.to_string()))?;
            let tsv = self.run(args, png).await?;
            Ok(parse_tsv(&tsv))
        }
        .boxed()
    }

    fn terminate(&self) {
        self.args.lock().take();
    }
}
