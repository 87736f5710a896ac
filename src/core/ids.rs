use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Issues the timestamp component of derived record ids. Two batches
/// landing in the same millisecond get distinct timestamps, so ids
/// stay globally unique within a run.
#[derive(Debug, Default)]
pub struct IdFactory {
    last: AtomicU64,
}

impl IdFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_timestamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }
}

pub fn idea_id(persona_id: &str, timestamp: u64, index: usize) -> String {
    format!("{}-idea-{}-{}", persona_id, timestamp, index)
}

pub fn requirement_id(idea_id: &str, index: usize) -> String {
    format!("{}-req-{}", idea_id, index)
}

pub fn image_id(idea_id: &str, timestamp: u64, index: usize) -> String {
    format!("{}-img-{}-{}", idea_id, timestamp, index)
}
