//! Offline provider that replays a fixed script.
//!
//! Used by `--provider scripted` for running the server without network
//! access, and as the provider in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::Stream;

use super::{ChatMessage, ChatRole, CompletionProvider, FragmentStream, ProviderError};

/// What the provider replies with.
#[derive(Debug, Clone)]
pub enum Script {
    /// Yield these fragments in order.
    Fragments(Vec<String>),
    /// Yield `fragments`, then fail with `error`.
    FailAfter {
        fragments: Vec<String>,
        error: String,
    },
    /// Echo the latest user message back, word by word.
    Echo,
}

impl Script {
    fn fragments_for(&self, messages: &[ChatMessage]) -> (Vec<String>, Option<String>) {
        match self {
            Self::Fragments(fragments) => (fragments.clone(), None),
            Self::FailAfter { fragments, error } => (fragments.clone(), Some(error.clone())),
            Self::Echo => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == ChatRole::User)
                    .map_or("", |m| m.content.as_str());
                let mut fragments = vec!["You said:".to_string()];
                fragments.extend(last_user.split_whitespace().map(|word| format!(" {word}")));
                (fragments, None)
            }
        }
    }
}

#[derive(Debug, Default)]
struct ScriptStats {
    contexts: Mutex<Vec<Vec<ChatMessage>>>,
    abandoned: AtomicUsize,
}

/// Marks a stream as abandoned if it is dropped before it runs to the end.
struct CompletionTracker {
    stats: Arc<ScriptStats>,
    finished: bool,
}

impl Drop for CompletionTracker {
    fn drop(&mut self) {
        if !self.finished {
            self.stats.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Provider that replays a [`Script`].
#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    script: Script,
    delay: Duration,
    stats: Arc<ScriptStats>,
}

impl ScriptedProvider {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            delay: Duration::from_millis(40),
            stats: Arc::default(),
        }
    }

    /// Shorthand for a script of fixed fragments.
    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Script::Fragments(
            fragments.into_iter().map(Into::into).collect(),
        ))
    }

    /// Pause between fragments.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every context this provider has been asked to complete.
    pub fn contexts(&self) -> Vec<Vec<ChatMessage>> {
        self.stats
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of streams dropped before they finished.
    pub fn abandoned_streams(&self) -> usize {
        self.stats.abandoned.load(Ordering::SeqCst)
    }
}

impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn stream_completion(&self, messages: Vec<ChatMessage>) -> FragmentStream {
        let (fragments, error) = self.script.fragments_for(&messages);
        self.stats
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages);

        let tracker = CompletionTracker {
            stats: Arc::clone(&self.stats),
            finished: false,
        };
        Box::pin(replay(fragments, error, self.delay, tracker))
    }
}

fn replay(
    fragments: Vec<String>,
    error: Option<String>,
    delay: Duration,
    mut tracker: CompletionTracker,
) -> impl Stream<Item = Result<String, ProviderError>> + Send + 'static {
    async_stream::stream! {
        for fragment in fragments {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            yield Ok(fragment);
        }
        tracker.finished = true;
        if let Some(error) = error {
            yield Err(ProviderError::Scripted(error));
        }
    }
}
