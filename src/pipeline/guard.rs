//! Single-flight guard keyed by user id.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::ClassifyError;

/// Tracks which users have a classification run in progress.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    running: Arc<Mutex<HashSet<String>>>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `user_id` as running, or fail if a run is already active.
    pub fn try_acquire(&self, user_id: &str) -> Result<RunPermit, ClassifyError> {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !running.insert(user_id.to_string()) {
            return Err(ClassifyError::AlreadyRunning {
                user_id: user_id.to_string(),
            });
        }
        Ok(RunPermit {
            running: Arc::clone(&self.running),
            user_id: user_id.to_string(),
        })
    }

    pub fn is_running(&self, user_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(user_id)
    }
}

/// Held for the duration of a run; releases the user on drop.
#[derive(Debug)]
pub struct RunPermit {
    running: Arc<Mutex<HashSet<String>>>,
    user_id: String,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.user_id);
    }
}
