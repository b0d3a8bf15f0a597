//! Input rerouting for PSK entry (spec.md §9 redesign guidance): instead of
//! sharing mode flags between a chat prompt and a PSK prompt, a single
//! `InputSource` is asked for the next line with an explicit `kind` and
//! `timeout`, driven by the state machine rather than by the prompt itself.
//!
//! Password masking and input history are part of the interactive terminal
//! UI, explicitly out of scope here — [`StdinInputSource`] is a minimal,
//! non-interactive-aware implementation of the trait.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Chat,
    Psk,
}

/// The input source did not produce a line before the requested timeout
/// elapsed, or the stream ended.
#[derive(Debug)]
pub struct Timeout;

#[async_trait::async_trait]
pub trait InputSource: Send + Sync {
    async fn request_input(&self, kind: InputKind, timeout: Duration) -> Result<String, Timeout>;
}

/// Reads one line from stdin per request. Applies no masking or history;
/// those remain a UI concern outside this crate.
pub struct StdinInputSource {
    reader: Mutex<BufReader<Stdin>>,
}

impl StdinInputSource {
    pub fn new() -> Self {
        Self {
            reader: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }
}

impl Default for StdinInputSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl InputSource for StdinInputSource {
    async fn request_input(&self, _kind: InputKind, timeout: Duration) -> Result<String, Timeout> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        match tokio::time::timeout(timeout, reader.read_line(&mut line)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => Err(Timeout),
            Ok(Ok(_)) => Ok(line.trim_end().to_string()),
        }
    }
}
