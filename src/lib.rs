#[macro_use]
extern crate failure;

pub mod camera;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod extractor;
pub mod feed;
pub mod lookup;
pub mod recognizer;
pub mod tesseract;
pub mod types;
pub mod webhook;
pub mod websocket;

#[cfg(test)]
mod testing;
