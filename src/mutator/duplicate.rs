use crate::core::{Collection, Record, Result, SyncError};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// Suppresses double-submitted creates (double taps, repeated form submits).
///
/// A create is a duplicate when the same key is still in flight, or when the
/// previous create carried the same key and was submitted inside the window.
#[derive(Debug)]
pub struct DuplicateGuard {
    window: Duration,
    in_flight: HashSet<String>,
    last: Option<(String, Instant)>,
}

impl DuplicateGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            in_flight: HashSet::new(),
            last: None,
        }
    }

    /// `collection/creator/display name`, case-insensitive on the name.
    pub fn key_for(collection: Collection, draft: &Record) -> String {
        let creator = draft.member_ids.first().map(String::as_str).unwrap_or_default();
        let name = draft.display_name().unwrap_or_default().trim().to_lowercase();
        format!("{}/{}/{}", collection, creator, name)
    }

    pub fn begin(&mut self, key: &str) -> Result<()> {
        if self.in_flight.contains(key) {
            return Err(SyncError::Duplicate(format!("create '{}' is already in flight", key)));
        }
        if let Some((last_key, at)) = &self.last {
            if last_key == key && at.elapsed() < self.window {
                return Err(SyncError::Duplicate(format!(
                    "create '{}' was submitted {}ms ago",
                    key,
                    at.elapsed().as_millis()
                )));
            }
        }
        self.in_flight.insert(key.to_string());
        self.last = Some((key.to_string(), Instant::now()));
        Ok(())
    }

    pub fn finish(&mut self, key: &str) {
        self.in_flight.remove(key);
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.last = None;
    }
}
