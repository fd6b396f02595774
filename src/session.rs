//! Process-wide session storage
//!
//! Maps opaque session identifiers to ordered conversation histories.
//! Mutations for a given session are serialized by a per-session lock;
//! different sessions only share the lock-free map and never contend with
//! each other.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::SessionConfig;
use crate::types::Turn;

/// One conversation: ordered turns plus the last inferred subject.
/// Insertion order is conversational order.
#[derive(Debug)]
pub struct Session {
    turns: Vec<Turn>,
    current_topic: Option<String>,
    last_activity: Instant,
    next_seq: u64,
}

impl Session {
    fn new(now: Instant) -> Self {
        Self {
            turns: Vec::new(),
            current_topic: None,
            last_activity: now,
            next_seq: 0,
        }
    }

    /// Turns in conversational order.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Last inferred subject, used to resolve follow-ups.
    pub fn current_topic(&self) -> Option<&str> {
        self.current_topic.as_deref()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn push(&mut self, mut turn: Turn, retention_turns: usize) {
        turn.seq = self.next_seq;
        self.next_seq += 1;
        self.turns.push(turn);

        // Retention cap protects memory; the context window budget is
        // enforced separately at prompt-build time.
        if self.turns.len() > retention_turns {
            let excess = self.turns.len() - retention_turns;
            self.turns.drain(..excess);
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }
}

/// Shared handle to one session's state.
pub type SessionHandle = Arc<Mutex<Session>>;

/// Process-wide store of active sessions with TTL and cap-based eviction.
pub struct SessionStore {
    sessions: DashMap<String, SessionHandle>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    /// Return the existing session for `session_id`, creating an empty one
    /// on first use. Never fails. When the store is at capacity, the least
    /// recently active session is evicted to make room.
    pub fn get_or_create(&self, session_id: &str) -> SessionHandle {
        if let Some(existing) = self.sessions.get(session_id) {
            return existing.value().clone();
        }

        if self.sessions.len() >= self.config.max_sessions {
            self.evict_least_recent(session_id);
        }

        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(Instant::now()))))
            .clone()
    }

    /// Append one turn under the session's lock, pruning past the
    /// retention cap.
    pub async fn append(&self, session_id: &str, turn: Turn) {
        let handle = self.get_or_create(session_id);
        let mut session = handle.lock().await;
        session.push(turn, self.config.retention_turns);
        session.touch(Instant::now());
    }

    /// Append a user/tutor pair and apply the topic update under a single
    /// lock acquisition, so no reader ever observes a dangling unanswered
    /// user turn.
    pub async fn commit_exchange(
        &self,
        session_id: &str,
        user_turn: Turn,
        tutor_turn: Turn,
        topic: Option<String>,
    ) {
        let handle = self.get_or_create(session_id);
        let mut session = handle.lock().await;
        session.push(user_turn, self.config.retention_turns);
        session.push(tutor_turn, self.config.retention_turns);
        session.current_topic = topic;
        session.touch(Instant::now());
    }

    /// Reset a session's history and topic. Idempotent; clearing an unknown
    /// id is a no-op.
    pub async fn clear(&self, session_id: &str) {
        if let Some(handle) = self.sessions.get(session_id).map(|h| h.value().clone()) {
            let mut session = handle.lock().await;
            session.turns.clear();
            session.current_topic = None;
            session.touch(Instant::now());
            debug!(session_id, "session cleared");
        }
    }

    /// Sweep sessions idle past the TTL. Invoked opportunistically on each
    /// request rather than from a dedicated scheduler thread.
    pub fn evict_stale(&self, now: Instant) {
        let ttl = self.config.ttl;
        self.sessions.retain(|session_id, handle| {
            match handle.try_lock() {
                Ok(session) => {
                    let stale = now.duration_since(session.last_activity()) > ttl;
                    if stale {
                        debug!(session_id = %session_id, "evicting stale session");
                    }
                    !stale
                }
                // A held lock means the session is mid-request, hence live.
                Err(_) => true,
            }
        });
    }

    /// Number of sessions currently held.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn evict_least_recent(&self, incoming_id: &str) {
        let mut oldest: Option<(String, Instant)> = None;
        for entry in self.sessions.iter() {
            if entry.key() == incoming_id {
                continue;
            }
            if let Ok(session) = entry.value().try_lock() {
                let at = session.last_activity();
                if oldest.as_ref().map_or(true, |(_, t)| at < *t) {
                    oldest = Some((entry.key().clone(), at));
                }
            }
        }
        if let Some((session_id, _)) = oldest {
            self.sessions.remove(&session_id);
            debug!(session_id = %session_id, "evicted session at capacity");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::types::Role;
    use std::time::Duration;

    fn store() -> SessionStore {
        SessionStore::new(ServiceConfig::default().session)
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_session() {
        let store = store();
        let first = store.get_or_create("abc");
        let second = store.get_or_create("abc");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_turn_order_and_pair_count() {
        let store = store();
        for i in 0..3 {
            store
                .commit_exchange(
                    "abc",
                    Turn::user(format!("question {i}"), None),
                    Turn::tutor(format!("answer {i}"), None),
                    Some("energy".to_string()),
                )
                .await;
        }

        let handle = store.get_or_create("abc");
        let session = handle.lock().await;
        let turns = session.turns();
        assert_eq!(turns.len(), 6);
        for (i, pair) in turns.chunks(2).enumerate() {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[0].text, format!("question {i}"));
            assert_eq!(pair[1].role, Role::Tutor);
            assert_eq!(pair[1].text, format!("answer {i}"));
        }
        // Order markers strictly increase in insertion order.
        for window in turns.windows(2) {
            assert!(window[0].seq < window[1].seq);
        }
        assert_eq!(session.current_topic(), Some("energy"));
    }

    #[tokio::test]
    async fn test_retention_cap_prunes_oldest() {
        let config = SessionConfig {
            ttl: Duration::from_secs(1800),
            retention_turns: 4,
            max_sessions: 10,
        };
        let store = SessionStore::new(config);

        for i in 0..5 {
            store
                .commit_exchange(
                    "abc",
                    Turn::user(format!("q{i}"), None),
                    Turn::tutor(format!("a{i}"), None),
                    None,
                )
                .await;
        }

        let handle = store.get_or_create("abc");
        let session = handle.lock().await;
        let turns = session.turns();
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].text, "q3");
        assert_eq!(turns[3].text, "a4");
    }

    #[tokio::test]
    async fn test_clear_is_idempotent_and_total() {
        let store = store();
        store.append("abc", Turn::user("hello there", None)).await;

        store.clear("abc").await;
        {
            let handle = store.get_or_create("abc");
            let session = handle.lock().await;
            assert!(session.turns().is_empty());
            assert!(session.current_topic().is_none());
        }

        // Clearing again, and clearing an id that never existed, are both
        // no-op successes.
        store.clear("abc").await;
        store.clear("never-seen").await;
    }

    #[tokio::test]
    async fn test_evict_stale_reclaims_idle_sessions() {
        let config = SessionConfig {
            ttl: Duration::from_millis(10),
            retention_turns: 10,
            max_sessions: 10,
        };
        let store = SessionStore::new(config);
        store.append("old", Turn::user("hi", None)).await;
        assert_eq!(store.len(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        store.evict_stale(Instant::now());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_evict_stale_keeps_active_sessions() {
        let config = SessionConfig {
            ttl: Duration::from_secs(60),
            retention_turns: 10,
            max_sessions: 10,
        };
        let store = SessionStore::new(config);
        store.append("fresh", Turn::user("hi", None)).await;
        store.evict_stale(Instant::now());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let config = SessionConfig {
            ttl: Duration::from_secs(60),
            retention_turns: 10,
            max_sessions: 2,
        };
        let store = SessionStore::new(config);

        store.append("first", Turn::user("hi", None)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.append("second", Turn::user("hi", None)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        store.get_or_create("third");
        assert_eq!(store.len(), 2);
        assert!(store.sessions.get("first").is_none());
        assert!(store.sessions.get("second").is_some());
        assert!(store.sessions.get("third").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_pairs_contiguous() {
        let config = SessionConfig {
            ttl: Duration::from_secs(1800),
            retention_turns: 32,
            max_sessions: 10,
        };
        let store = Arc::new(SessionStore::new(config));
        let mut handles = Vec::new();

        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .commit_exchange(
                        "shared",
                        Turn::user(format!("q{i}"), None),
                        Turn::tutor(format!("a{i}"), None),
                        None,
                    )
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let handle = store.get_or_create("shared");
        let session = handle.lock().await;
        let turns = session.turns();
        assert_eq!(turns.len(), 16);
        // Whatever order the tasks won the lock in, pairs never interleave.
        for pair in turns.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Tutor);
            assert_eq!(pair[0].text[1..], pair[1].text[1..]);
        }
        for window in turns.windows(2) {
            assert!(window[0].seq < window[1].seq);
        }
    }
}
