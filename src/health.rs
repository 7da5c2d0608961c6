//! Per-object failure latch.
//!
//! Once an object records a failure it stays unhealthy and every subsequent
//! operation short-circuits to the stored diagnostic. Threads use this to
//! refuse traffic after a fatal body error instead of wedging callers.

use std::sync::Mutex;

use anyhow::{anyhow, Result};

#[derive(Debug, Default)]
pub struct Health {
    failure: Mutex<Option<String>>,
}

impl Health {
    pub fn new() -> Health {
        Health::default()
    }

    pub fn is_healthy(&self) -> bool {
        self.failure.lock().unwrap().is_none()
    }

    /// Record a failure. The first failure wins; later ones are kept out of
    /// the diagnostic so the root cause stays visible.
    pub fn fail(&self, message: impl Into<String>) {
        let mut failure = self.failure.lock().unwrap();
        if failure.is_none() {
            *failure = Some(message.into());
        }
    }

    /// Error result carrying the stored diagnostic, `Ok` while healthy.
    pub fn check(&self) -> Result<()> {
        match self.failure.lock().unwrap().as_ref() {
            None => Ok(()),
            Some(message) => Err(anyhow!("{}", message)),
        }
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().unwrap().clone()
    }
}

/// Join sub-operation failures into one diagnostic, or `None` when every
/// sub-operation succeeded.
pub fn combine_errors(errors: &[String]) -> Option<String> {
    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}
