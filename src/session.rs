//! Session store: derives and memoizes per-user (load token, play id) pairs,
//! coalescing concurrent fetches for the same key into a single in-flight
//! request (`4.2`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use crate::client::{extract_load_token, extract_play_id, Dispatcher};

/// `(user, puzzle)` identifies a session; `series` is carried separately
/// since it only matters for the derivation request, not as a lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user: String,
    pub puzzle: String,
}

/// Derived per-user credentials. A session is valid iff `load_token` is
/// non-empty; `error` carries the reason when it isn't.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTokens {
    pub load_token: String,
    pub play_id: String,
    pub valid: bool,
    pub error: Option<String>,
}

impl SessionTokens {
    fn invalid(error: impl Into<String>) -> Self {
        Self {
            load_token: String::new(),
            play_id: String::new(),
            valid: false,
            error: Some(error.into()),
        }
    }
}

/// On-disk shape for `saveToFile`/`loadFromFile`: keyed by user identifier,
/// values carrying only the two opaque tokens (no validity/error state).
#[derive(Debug, Serialize, Deserialize)]
struct CachedEntry {
    #[serde(rename = "loadToken")]
    load_token: String,
    #[serde(rename = "playId")]
    play_id: String,
}

/// Process-wide memoized mapping from session key to derived tokens. Once a
/// key's fetch completes, its value is final for the store's lifetime — this
/// is a memoization table, not an evicting cache.
pub struct SessionStore {
    slots: Mutex<HashMap<SessionKey, Arc<OnceCell<SessionTokens>>>>,
    dispatcher: Dispatcher,
    target_url: String,
}

impl SessionStore {
    pub fn new(dispatcher: Dispatcher, target_url: String) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            dispatcher,
            target_url,
        }
    }

    /// Returns the session for `(user, puzzle)`, fetching it through the
    /// target if no fetch for this key has ever been started. Every
    /// concurrent caller for the same key observes the identical result.
    pub async fn get_or_create(&self, user: &str, puzzle: &str, series: &str) -> SessionTokens {
        let key = SessionKey {
            user: user.to_string(),
            puzzle: puzzle.to_string(),
        };

        let cell = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        cell.get_or_init(|| self.derive(user, puzzle, series)).await.clone()
    }

    async fn derive(&self, user: &str, puzzle: &str, series: &str) -> SessionTokens {
        let load_token = match self.fetch_load_token(user, series).await {
            Ok(token) => token,
            Err(e) => {
                crate::metrics::SESSION_FETCHES_TOTAL.with_label_values(&["invalid"]).inc();
                return SessionTokens::invalid(e);
            }
        };

        let play_id = match self.fetch_play_id(user, puzzle, series, &load_token).await {
            Ok(id) => id,
            Err(e) => {
                crate::metrics::SESSION_FETCHES_TOTAL.with_label_values(&["invalid"]).inc();
                return SessionTokens::invalid(e);
            }
        };

        crate::metrics::SESSION_FETCHES_TOTAL.with_label_values(&["valid"]).inc();
        SessionTokens {
            load_token,
            play_id,
            valid: true,
            error: None,
        }
    }

    async fn fetch_load_token(&self, user: &str, series: &str) -> Result<String, String> {
        let url = format!("{}/date-picker?set={}&uid={}", self.target_url, series, user);
        let response = self
            .dispatcher
            .fire(self.dispatcher.client().get(&url))
            .await
            .map_err(|e| e.to_string())?;
        extract_load_token(&response.body).map_err(|e| e.to_string())
    }

    async fn fetch_play_id(
        &self,
        user: &str,
        puzzle: &str,
        series: &str,
        load_token: &str,
    ) -> Result<String, String> {
        let src = format!("{}/date-picker?set={}&uid={}", self.target_url, series, user);
        let url = format!(
            "{}/crossword?id={}&set={}&picker=date-picker&src={}&uid={}&loadToken={}",
            self.target_url, puzzle, series, src, user, load_token
        );
        let response = self
            .dispatcher
            .fire(self.dispatcher.client().get(&url))
            .await
            .map_err(|e| e.to_string())?;
        extract_play_id(&response.body).map_err(|e| e.to_string())
    }

    /// Runs `get_or_create` for every key on a bounded worker pool, logging
    /// progress periodically. Individual failures are counted but never
    /// stop the bulk.
    pub async fn bulk_warm(self: &Arc<Self>, keys: Vec<(String, String, String)>, parallelism: usize) {
        use futures_lite_semaphore::BulkGate;

        let gate = BulkGate::new(parallelism.max(1));
        let total = keys.len();
        let mut handles = Vec::with_capacity(total);

        for (i, (user, puzzle, series)) in keys.into_iter().enumerate() {
            let store = self.clone();
            let permit = gate.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire().await;
                let tokens = store.get_or_create(&user, &puzzle, &series).await;
                if (i + 1) % 50 == 0 || i + 1 == total {
                    info!(progress = i + 1, total, "session pre-warm progress");
                }
                tokens.valid
            }));
        }

        let mut failed = 0usize;
        for handle in handles {
            match handle.await {
                Ok(true) => {}
                Ok(false) => failed += 1,
                Err(e) => {
                    warn!(error = %e, "pre-warm task panicked");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            warn!(failed, total, "pre-warm completed with failures");
        }
    }

    /// Serializes every *valid* session to a JSON object keyed by user id.
    pub async fn save_to_file(&self, path: &Path) -> std::io::Result<()> {
        let snapshot = self.slots.lock().await;
        let mut out: HashMap<String, CachedEntry> = HashMap::new();
        for (key, cell) in snapshot.iter() {
            if let Some(tokens) = cell.get() {
                if tokens.valid {
                    out.insert(
                        key.user.clone(),
                        CachedEntry {
                            load_token: tokens.load_token.clone(),
                            play_id: tokens.play_id.clone(),
                        },
                    );
                }
            }
        }
        let json = serde_json::to_string_pretty(&out)?;
        std::fs::write(path, json)
    }

    /// Populates the store from a session-cache file without network
    /// contact. Missing file is not an error; the store simply starts
    /// empty. Loaded sessions are keyed only by user id, so the puzzle used
    /// at load time is applied to every loaded key.
    pub async fn load_from_file(&self, path: &Path, puzzle: &str) -> bool {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return false,
        };

        let entries: HashMap<String, CachedEntry> = match serde_json::from_str(&content) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "failed to parse session cache file");
                return false;
            }
        };

        let mut slots = self.slots.lock().await;
        for (user, entry) in entries {
            let key = SessionKey {
                user,
                puzzle: puzzle.to_string(),
            };
            let cell = OnceCell::new();
            let _ = cell.set(SessionTokens {
                load_token: entry.load_token,
                play_id: entry.play_id,
                valid: true,
                error: None,
            });
            slots.insert(key, Arc::new(cell));
        }

        true
    }
}

/// Tiny semaphore-backed gate so `bulk_warm` doesn't need a new top-level
/// dependency just to bound fan-out.
mod futures_lite_semaphore {
    use std::sync::Arc;
    use tokio::sync::{Semaphore, SemaphorePermit};

    #[derive(Clone)]
    pub struct BulkGate {
        inner: Arc<Semaphore>,
    }

    impl BulkGate {
        pub fn new(permits: usize) -> Self {
            Self {
                inner: Arc::new(Semaphore::new(permits)),
            }
        }

        pub async fn acquire(&self) -> SemaphorePermit<'_> {
            self.inner.acquire().await.expect("semaphore not closed")
        }
    }
}
