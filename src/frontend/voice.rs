//! Voice frontend - wake-word-gated (or barge-in) speech loop
//!
//! Each user turn: capture speech until silence, transcribe, dispatch, speak
//! the summary (and the answer when it differs). Clarifying questions are
//! spoken and answered on the same channel, so the dispatcher's
//! same-source-clarification rule holds by construction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Asr, Tts, WakeWord};
use crate::dispatch::{Clarifier, Dispatcher, TaskContext, TaskStatus};

/// Default end-of-utterance silence window
pub const DEFAULT_SILENCE_MS: u64 = 3000;
/// Default hard cap per capture
pub const DEFAULT_MAX_MS: u64 = 30_000;
/// Wake-word poll window
const WAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Utterances that end the loop
fn is_exit(utterance: &str) -> bool {
    matches!(
        utterance.trim().to_lowercase().as_str(),
        "exit" | "quit" | "goodbye"
    )
}

pub struct VoiceFrontend {
    dispatcher: Arc<Dispatcher>,
    asr: Arc<dyn Asr>,
    tts: Arc<dyn Tts>,
    /// `None` degrades to barge-in mode (always listening)
    wake: Option<Arc<dyn WakeWord>>,
    silence_ms: u64,
    max_ms: u64,
}

impl VoiceFrontend {
    pub fn new(dispatcher: Arc<Dispatcher>, asr: Arc<dyn Asr>, tts: Arc<dyn Tts>) -> Self {
        Self {
            dispatcher,
            asr,
            tts,
            wake: None,
            silence_ms: DEFAULT_SILENCE_MS,
            max_ms: DEFAULT_MAX_MS,
        }
    }

    pub fn with_wake_word(mut self, wake: Arc<dyn WakeWord>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn with_timing(mut self, silence_ms: u64, max_ms: u64) -> Self {
        self.silence_ms = silence_ms;
        self.max_ms = max_ms;
        self
    }

    /// Run until an exit utterance or cancellation. Returns completed turns.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        let mut turns = 0u64;
        info!(
            barge_in = self.wake.is_none(),
            "voice frontend listening"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Some(wake) = &self.wake {
                let woke = tokio::select! {
                    woke = wake.listen_once(WAKE_TIMEOUT) => woke.unwrap_or(false),
                    _ = cancel.cancelled() => break,
                };
                if !woke {
                    continue;
                }
            }

            let transcript = tokio::select! {
                r = self.asr.transcribe_until_silence(self.silence_ms, self.max_ms) => r,
                _ = cancel.cancelled() => break,
            };
            let utterance = match transcript {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "transcription failed");
                    continue;
                }
            };
            if utterance.trim().is_empty() {
                debug!("no speech captured");
                // Brief pause keeps barge-in mode from spinning between
                // captures.
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            if is_exit(&utterance) {
                let _ = self.tts.speak("Goodbye.", true).await;
                break;
            }

            let clarifier = VoiceClarifier {
                asr: Arc::clone(&self.asr),
                tts: Arc::clone(&self.tts),
                silence_ms: self.silence_ms,
                max_ms: self.max_ms,
            };
            let result = self
                .dispatcher
                .dispatch_with(
                    TaskContext::voice(utterance),
                    &clarifier,
                    cancel.child_token(),
                )
                .await;

            let _ = self.tts.speak(&result.summary, true).await;
            if result.status == TaskStatus::Ok {
                if let Some(answer) = &result.answer {
                    if answer != &result.summary {
                        let _ = self.tts.speak(answer, true).await;
                    }
                }
            }
            turns += 1;
        }

        turns
    }
}

/// Clarification channel that speaks the question and listens for one reply.
pub struct VoiceClarifier {
    asr: Arc<dyn Asr>,
    tts: Arc<dyn Tts>,
    silence_ms: u64,
    max_ms: u64,
}

#[async_trait]
impl Clarifier for VoiceClarifier {
    async fn ask(&self, question: &str) -> Option<String> {
        self.tts.speak(question, true).await.ok()?;
        let reply = self
            .asr
            .transcribe_until_silence(self.silence_ms, self.max_ms)
            .await
            .ok()?;
        if reply.trim().is_empty() {
            None
        } else {
            Some(reply)
        }
    }
}
