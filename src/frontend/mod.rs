//! Request frontends
//!
//! Thin producers that synthesize a [`TaskContext`](crate::dispatch::TaskContext)
//! and hand it to the dispatcher: a background [`ambient`] timer, named
//! [`hotkey`] chords, and the [`voice`] loop. This module also holds the
//! speech collaborator contracts (ASR, TTS, wake word) and their scripted
//! mocks.

pub mod ambient;
pub mod hotkey;
pub mod voice;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Speech-to-text contract. "No speech" surfaces as an empty string, never
/// as an error.
#[async_trait]
pub trait Asr: Send + Sync {
    async fn transcribe_until_silence(&self, silence_ms: u64, max_ms: u64) -> Result<String>;
}

/// Text-to-speech contract.
#[async_trait]
pub trait Tts: Send + Sync {
    async fn speak(&self, text: &str, blocking: bool) -> Result<()>;
}

/// Wake-word detector contract. When no detector is available the voice
/// frontend degrades to barge-in (always listening).
#[async_trait]
pub trait WakeWord: Send + Sync {
    /// Wait up to `timeout` for the wake word; `Ok(false)` on timeout.
    async fn listen_once(&self, timeout: Duration) -> Result<bool>;
}

// ============================================================================
// SCRIPTED MOCKS
// ============================================================================

/// Queued transcripts; empty string once the queue is dry.
#[derive(Clone, Default)]
pub struct MockAsr {
    transcripts: Arc<Mutex<Vec<String>>>,
}

impl MockAsr {
    pub fn with_transcripts<I, S>(transcripts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transcripts: Arc::new(Mutex::new(
                transcripts.into_iter().map(Into::into).collect(),
            )),
        }
    }
}

#[async_trait]
impl Asr for MockAsr {
    async fn transcribe_until_silence(&self, _silence_ms: u64, _max_ms: u64) -> Result<String> {
        let mut queue = self.transcripts.lock().unwrap();
        Ok(if queue.is_empty() {
            String::new()
        } else {
            queue.remove(0)
        })
    }
}

/// Records everything spoken.
#[derive(Clone, Default)]
pub struct MockTts {
    spoken: Arc<Mutex<Vec<String>>>,
}

impl MockTts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tts for MockTts {
    async fn speak(&self, text: &str, _blocking: bool) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Always-triggered wake word.
#[derive(Clone, Default)]
pub struct MockWakeWord;

#[async_trait]
impl WakeWord for MockWakeWord {
    async fn listen_once(&self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }
}
