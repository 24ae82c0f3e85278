//! In-process session store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::{ChatError, ChatSession};

pub type SharedSession = Arc<Mutex<ChatSession>>;

struct Entry {
    session: SharedSession,
    last_used: Instant,
}

/// Live sessions by id. Nothing outlives the process, and sessions left
/// alone longer than the idle limit are dropped by [`SessionStore::evict_idle`].
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, Entry>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: ChatSession) -> Uuid {
        let id = session.id();
        self.sessions.write().await.insert(
            id,
            Entry {
                session: Arc::new(Mutex::new(session)),
                last_used: Instant::now(),
            },
        );
        id
    }

    /// Look a session up and mark it used
    pub async fn get(&self, id: &Uuid) -> Option<SharedSession> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(id)?;
        entry.last_used = Instant::now();
        Some(entry.session.clone())
    }

    /// Lock a session without waiting.
    ///
    /// A session stays locked for as long as it is generating, so failing to
    /// lock it means it is busy.
    pub async fn lock(&self, id: &Uuid) -> Option<Result<OwnedMutexGuard<ChatSession>, ChatError>> {
        let session = self.get(id).await?;
        Some(session.try_lock_owned().map_err(|_| ChatError::Busy))
    }

    pub async fn remove(&self, id: &Uuid) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop sessions unused for longer than `max_idle`. Sessions that are
    /// generating are kept. Returns how many were dropped.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.last_used.elapsed() <= max_idle || entry.session.try_lock().is_err());
        before - sessions.len()
    }

    /// Sweep idle sessions in the background, once per `every`
    pub fn spawn_reaper(&self, max_idle: Duration, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let evicted = store.evict_idle(max_idle).await;
                if evicted > 0 {
                    tracing::info!("Dropped {} idle sessions", evicted);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::adapter::tests::{adapter_with, ScriptedProvider};
    use crate::core::{ConversationMemory, GenerationSettings, WordCounter};

    fn session() -> ChatSession {
        let provider = Arc::new(ScriptedProvider::new(&["ok"], false));
        let memory = ConversationMemory::new(Arc::new(WordCounter), 500);
        ChatSession::new(adapter_with(provider), memory, GenerationSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let store = SessionStore::new();
        let id = store.insert(session()).await;

        assert_eq!(store.len().await, 1);
        assert!(store.get(&id).await.is_some());
        assert!(store.get(&Uuid::new_v4()).await.is_none());

        assert!(store.remove(&id).await);
        assert!(!store.remove(&id).await);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_locked_session_is_busy() {
        let store = SessionStore::new();
        let id = store.insert(session()).await;

        let guard = store.lock(&id).await.unwrap().unwrap();
        assert!(matches!(store.lock(&id).await, Some(Err(ChatError::Busy))));
        drop(guard);

        assert!(matches!(store.lock(&id).await, Some(Ok(_))));
        assert!(store.lock(&Uuid::new_v4()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_are_evicted() {
        let store = SessionStore::new();
        let stale = store.insert(session()).await;
        let fresh = store.insert(session()).await;
        let busy = store.insert(session()).await;

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(store.get(&fresh).await.is_some());
        let _guard = store.lock(&busy).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        // stale was last touched 70s ago, the other two 20s ago
        assert_eq!(store.evict_idle(Duration::from_secs(60)).await, 1);
        assert!(store.get(&stale).await.is_none());
        assert!(store.get(&fresh).await.is_some());

        tokio::time::advance(Duration::from_secs(120)).await;
        // only the generating session survives
        assert_eq!(store.evict_idle(Duration::from_secs(60)).await, 1);
        assert!(store.get(&busy).await.is_some());
        assert_eq!(store.len().await, 1);
    }
}
