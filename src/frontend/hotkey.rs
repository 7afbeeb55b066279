//! Hotkey manager - named key chords mapped to canned dispatches
//!
//! The OS-level key hook is an external collaborator; this module owns the
//! chord → handler table and the handlers themselves. The default `*` chord
//! runs the three standing summaries (calendar day, mail unread, drive
//! recent) in sequence and concatenates their results.

use std::sync::Arc;

use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use tracing::info;

use crate::dispatch::{Dispatcher, Source, TaskContext};

/// Async handler bound to a chord
pub type HotkeyHandler = Arc<dyn Fn() -> BoxFuture<'static, String> + Send + Sync>;

/// The three utterances behind the default `*` chord
const OVERVIEW_UTTERANCES: [&str; 3] = [
    "what's on my calendar today",
    "summarize my unread email inbox",
    "list recent files in my drive",
];

pub struct HotkeyManager {
    dispatcher: Arc<Dispatcher>,
    bindings: FxHashMap<String, HotkeyHandler>,
}

impl HotkeyManager {
    /// New manager with the default `*` overview chord installed.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let mut manager = Self {
            dispatcher: Arc::clone(&dispatcher),
            bindings: FxHashMap::default(),
        };

        manager.bind("*", {
            let dispatcher = Arc::clone(&dispatcher);
            move || {
                let dispatcher = Arc::clone(&dispatcher);
                Box::pin(async move { overview(dispatcher).await })
            }
        });
        manager
    }

    /// Bind (or rebind) a chord to a handler.
    pub fn bind<F>(&mut self, chord: impl Into<String>, handler: F)
    where
        F: Fn() -> BoxFuture<'static, String> + Send + Sync + 'static,
    {
        self.bindings.insert(chord.into(), Arc::new(handler));
    }

    /// Bind a chord to a plain dispatcher utterance.
    pub fn bind_utterance(&mut self, chord: impl Into<String>, utterance: impl Into<String>) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let utterance = utterance.into();
        self.bind(chord, move || {
            let dispatcher = Arc::clone(&dispatcher);
            let utterance = utterance.clone();
            Box::pin(async move {
                dispatcher
                    .dispatch(TaskContext::new(utterance, Source::Hotkey))
                    .await
                    .summary
            })
        });
    }

    pub fn chords(&self) -> Vec<&str> {
        self.bindings.keys().map(|s| s.as_str()).collect()
    }

    /// Fire a chord; `None` when nothing is bound to it.
    pub async fn trigger(&self, chord: &str) -> Option<String> {
        let handler = self.bindings.get(chord)?;
        info!(chord, "hotkey fired");
        Some(handler().await)
    }
}

/// Three summaries back to back, concatenated.
async fn overview(dispatcher: Arc<Dispatcher>) -> String {
    let mut parts = Vec::with_capacity(OVERVIEW_UTTERANCES.len());
    for utterance in OVERVIEW_UTTERANCES {
        let result = dispatcher
            .dispatch(TaskContext::new(utterance, Source::Hotkey))
            .await;
        parts.push(result.summary);
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NervaConfig;
    use crate::skills::{default_registry, SkillDeps};

    fn dispatcher() -> Arc<Dispatcher> {
        let deps = SkillDeps::offline(NervaConfig::default());
        let registry = default_registry(&deps);
        Arc::new(Dispatcher::new(&deps, registry))
    }

    #[tokio::test]
    async fn default_star_chord_concatenates_three_summaries() {
        let manager = HotkeyManager::new(dispatcher());
        let output = manager.trigger("*").await.unwrap();
        assert_eq!(output.lines().count(), 3);
    }

    #[tokio::test]
    async fn custom_binding_dispatches() {
        let mut manager = HotkeyManager::new(dispatcher());
        manager.bind_utterance("ctrl+shift+d", "daily status report please");

        let output = manager.trigger("ctrl+shift+d").await;
        assert!(output.is_some());
        assert!(!output.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_chord_is_none() {
        let manager = HotkeyManager::new(dispatcher());
        assert!(manager.trigger("ctrl+nope").await.is_none());
    }
}
