//! Pending authorization attempts, keyed by their opaque `state` parameter.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// How long a browser has to come back through the callback (10 minutes).
const DEFAULT_STATE_EXPIRY_SECONDS: i64 = 600;

/// Outstanding attempts kept per token manager; the oldest is evicted past this.
const DEFAULT_MAX_PENDING: usize = 64;

/// One outstanding authorization attempt.
#[derive(Clone, Debug)]
pub struct PendingAuthorization {
    /// Redirect URI sent to the provider; the token exchange must repeat it.
    pub redirect_uri: String,
    pub created_at: DateTime<Utc>,
}

/// Single-use, expiring state tokens for one token manager.
pub struct PendingStates {
    states: Mutex<HashMap<String, PendingAuthorization>>,
    expiry: Duration,
    max_pending: usize,
}

impl Default for PendingStates {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_EXPIRY_SECONDS, DEFAULT_MAX_PENDING)
    }
}

impl PendingStates {
    pub fn new(expiry_seconds: i64, max_pending: usize) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            expiry: Duration::seconds(expiry_seconds),
            max_pending: max_pending.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingAuthorization>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a new attempt and returns its state token (UUID v4).
    ///
    /// Expired entries are swept on the way in. When the table is still full,
    /// the oldest attempt is dropped.
    pub fn create(&self, redirect_uri: &str) -> String {
        let state = Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut states = self.lock();
        states.retain(|_, entry| now - entry.created_at <= self.expiry);

        while states.len() >= self.max_pending {
            let oldest = states
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    debug!(pending = states.len(), "Pending OAuth states full, evicting oldest");
                    states.remove(&key);
                }
                None => break,
            }
        }

        states.insert(
            state.clone(),
            PendingAuthorization {
                redirect_uri: redirect_uri.to_string(),
                created_at: now,
            },
        );

        state
    }

    /// Removes `state` and returns its attempt if it was known and unexpired.
    pub fn consume(&self, state: &str) -> Option<PendingAuthorization> {
        let entry = self.lock().remove(state)?;

        if Utc::now() - entry.created_at > self.expiry {
            return None;
        }

        Some(entry)
    }

    /// True if `state` is pending here (expired or not). Does not consume it.
    pub fn contains(&self, state: &str) -> bool {
        self.lock().contains_key(state)
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_consume() {
        let states = PendingStates::default();

        let state = states.create("http://localhost:1880/sthServer/login/callback");
        assert!(!state.is_empty());
        assert!(states.contains(&state));

        let entry = states.consume(&state).unwrap();
        assert_eq!(
            entry.redirect_uri,
            "http://localhost:1880/sthServer/login/callback"
        );
    }

    #[test]
    fn test_state_is_single_use() {
        let states = PendingStates::default();
        let state = states.create("http://cb");

        assert!(states.consume(&state).is_some());
        assert!(states.consume(&state).is_none());
        assert!(!states.contains(&state));
    }

    #[test]
    fn test_unknown_state_rejected() {
        let states = PendingStates::default();
        assert!(states.consume("not-a-state").is_none());
    }

    #[test]
    fn test_expired_state_rejected() {
        let states = PendingStates::new(0, DEFAULT_MAX_PENDING);
        let state = states.create("http://cb");

        std::thread::sleep(std::time::Duration::from_millis(20));

        assert!(states.consume(&state).is_none());
    }

    #[test]
    fn test_create_sweeps_expired() {
        let states = PendingStates::new(0, DEFAULT_MAX_PENDING);
        states.create("http://cb");
        states.create("http://cb");

        std::thread::sleep(std::time::Duration::from_millis(20));

        states.create("http://cb");
        assert_eq!(states.count(), 1);
    }

    #[test]
    fn test_pending_states_are_capped() {
        let states = PendingStates::new(DEFAULT_STATE_EXPIRY_SECONDS, 3);

        let first = states.create("http://cb");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let issued: Vec<String> = (0..3)
            .map(|_| {
                std::thread::sleep(std::time::Duration::from_millis(2));
                states.create("http://cb")
            })
            .collect();

        assert_eq!(states.count(), 3);
        assert!(!states.contains(&first));
        for state in &issued {
            assert!(states.contains(state));
        }
    }

    #[test]
    fn test_default_cap_holds_under_flood() {
        let states = PendingStates::default();
        for _ in 0..(DEFAULT_MAX_PENDING * 4) {
            states.create("http://cb");
        }
        assert_eq!(states.count(), DEFAULT_MAX_PENDING);
    }
}
