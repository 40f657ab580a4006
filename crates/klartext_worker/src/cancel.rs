//! Cancellation registry.
//!
//! Maps running jobs to their cancellation tokens so an external
//! `cancel(processing_id)` reaches the worker that owns the job. The
//! token is polled between steps only.

use std::collections::HashMap;
use std::sync::Mutex;

use klartext_protocol::CancellationToken;

#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for a job entering execution.
    pub fn register(&self, processing_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .expect("cancel registry lock poisoned")
            .insert(processing_id.to_string(), token.clone());
        token
    }

    /// Flip the token of a running job. Returns false if the job is not
    /// currently executing on this process.
    pub fn cancel(&self, processing_id: &str) -> bool {
        let tokens = self.tokens.lock().expect("cancel registry lock poisoned");
        match tokens.get(processing_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the token once the job reached a terminal state.
    pub fn remove(&self, processing_id: &str) {
        self.tokens
            .lock()
            .expect("cancel registry lock poisoned")
            .remove(processing_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reaches_registered_token() {
        let registry = CancelRegistry::new();
        let token = registry.register("p-1");
        assert!(!token.is_cancelled());

        assert!(registry.cancel("p-1"));
        assert!(token.is_cancelled());

        assert!(!registry.cancel("p-unknown"));

        registry.remove("p-1");
        assert!(!registry.cancel("p-1"));
    }
}
