//! Generation counters paired with cancellation tokens.

use tokio_util::sync::CancellationToken;

/// Monotonic generation counter. Advancing it cancels the token handed out
/// for the previous generation.
#[derive(Debug, Default)]
pub struct Epoch {
    generation: u64,
    token: CancellationToken,
}

impl Epoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Token for the generation that is current right now
    pub fn current(&self) -> EpochToken {
        EpochToken {
            generation: self.generation,
            token: self.token.clone(),
        }
    }

    /// Start a new generation and return its token
    pub fn advance(&mut self) -> EpochToken {
        self.token.cancel();
        self.generation += 1;
        self.token = CancellationToken::new();
        self.current()
    }

    pub fn is_current(&self, token: &EpochToken) -> bool {
        token.generation == self.generation
    }
}

/// Handed to an asynchronous operation at entry; stale once its epoch moves on
#[derive(Debug, Clone)]
pub struct EpochToken {
    generation: u64,
    token: CancellationToken,
}

impl EpochToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Resolves once a newer generation has started
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
