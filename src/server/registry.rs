//! Registry of live sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

use super::session::Session;
use crate::chat::{Message, NAME_TAKEN};
use crate::{PeerchatError, Result};

struct Entry {
    /// Registration order, used for stable listings.
    seq: u64,
    session: Session,
}

/// Set of open sessions keyed by identifier.
///
/// Membership changes take the write lock; broadcasts hold the read lock for
/// the whole fan-out, so a session removed by [`unregister`] never receives
/// a frame enqueued after the removal returns.
///
/// [`unregister`]: SessionRegistry::unregister
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Entry>>,
    next_seq: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Add an open session.
    pub async fn register(&self, session: Session) -> Result<()> {
        if !session.is_open() {
            return Err(PeerchatError::Validation(format!(
                "session {} is not open",
                session.id()
            )));
        }

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.id()) {
            return Err(PeerchatError::Validation(format!(
                "session {} is already registered",
                session.id()
            )));
        }

        self.insert(&mut sessions, session);
        Ok(())
    }

    /// Name an open session and add it, queueing `greeting` as its first
    /// frame.
    ///
    /// Fails with `Validation` if another session already uses the name.
    /// Checking and inserting happen under one write lock, so two peers
    /// racing for the same name cannot both get it, and no broadcast can
    /// overtake the greeting.
    pub async fn register_named(
        &self,
        session: Session,
        name: &str,
        greeting: Message,
    ) -> Result<()> {
        if !session.is_open() {
            return Err(PeerchatError::Validation(format!(
                "session {} is not open",
                session.id()
            )));
        }

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(name) {
            return Err(PeerchatError::Validation(NAME_TAKEN.to_string()));
        }
        session.assign_name(name)?;
        session.send(greeting).await?;
        self.insert(&mut sessions, session);
        Ok(())
    }

    fn insert(&self, sessions: &mut HashMap<String, Entry>, session: Session) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        debug!("Registered session {} ({} total)", session.id(), sessions.len() + 1);
        sessions.insert(session.id().to_string(), Entry { seq, session });
    }

    /// Remove a session and close it.
    ///
    /// Returns `None` if the id was not registered.
    pub async fn unregister(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.remove(id)?;
        entry.session.close();
        debug!("Unregistered session {} ({} remaining)", id, sessions.len());
        Some(entry.session)
    }

    /// Remove `session` if it is still the one registered under its id, then
    /// close it.
    ///
    /// A receive loop that outlives its session uses this so it cannot evict
    /// a newer session that reused the id. Returns whether an entry was
    /// removed.
    pub async fn unregister_session(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.write().await;
        let current = sessions
            .get(session.id())
            .is_some_and(|entry| entry.session.is_same(session));
        if current {
            sessions.remove(session.id());
            debug!(
                "Unregistered session {} ({} remaining)",
                session.id(),
                sessions.len()
            );
        }
        drop(sessions);
        session.close();
        current
    }

    /// Enqueue a message on every registered session except `exclude`.
    ///
    /// A failed enqueue (usually a session closing concurrently) is skipped. Returns the number of
    /// sessions the message was queued for.
    pub async fn broadcast(&self, message: &Message, exclude: Option<&str>) -> usize {
        let sessions = self.sessions.read().await;
        let mut delivered = 0;

        for (id, entry) in sessions.iter() {
            if exclude == Some(id.as_str()) {
                continue;
            }
            match entry.session.send(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Broadcast to {} skipped: {}", id, e),
            }
        }

        delivered
    }

    /// Enqueue a message on a single session.
    pub async fn send_to(&self, id: &str, message: Message) -> Result<()> {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(entry) => entry.session.send(message).await,
            None => Err(PeerchatError::Send(format!("no session with id {id}"))),
        }
    }

    /// Get a session by id.
    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).map(|e| e.session.clone())
    }

    /// Check whether an id is registered.
    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Get the number of registered sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// List session ids in registration order.
    pub async fn list(&self) -> Vec<String> {
        self.sessions()
            .await
            .into_iter()
            .map(|s| s.id().to_string())
            .collect()
    }

    /// Snapshot of registered sessions in registration order.
    pub async fn sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut entries: Vec<&Entry> = sessions.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.session.clone()).collect()
    }

    /// Remove and close every session.
    pub async fn close_all(&self) -> Vec<Session> {
        let mut sessions = self.sessions.write().await;
        let mut entries: Vec<Entry> = sessions.drain().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| e.seq);

        for entry in &entries {
            entry.session.close();
        }
        if !entries.is_empty() {
            debug!("Closed {} session(s)", entries.len());
        }
        entries.into_iter().map(|e| e.session).collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
