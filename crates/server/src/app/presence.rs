use super::Outbound;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

/// Live connection handle for one user. The socket id pins the handle so
/// a superseded connection cannot tear down its replacement.
#[derive(Clone)]
pub struct PresenceEntry {
    pub socket_id: String,
    pub sender: mpsc::Sender<Outbound>,
}

/// Source of truth for "is this user reachable right now". At most one
/// entry per user identity; every operation locks the whole
/// read-modify-write so a disconnect racing a reconnect of the same
/// identity cannot lose an update.
pub struct PresenceRegistry {
    entries: RwLock<HashMap<String, PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        PresenceRegistry {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Installs a handle for the user, returning the displaced entry if
    /// the identity was already connected. The caller owns notifying the
    /// displaced connection.
    pub async fn register(&self, user_id: &str, entry: PresenceEntry) -> Option<PresenceEntry> {
        let mut entries = self.entries.write().await;
        entries.insert(user_id.to_string(), entry)
    }

    pub async fn lookup(&self, user_id: &str) -> Option<PresenceEntry> {
        let entries = self.entries.read().await;
        entries.get(user_id).cloned()
    }

    /// Removes the user's entry only if it still belongs to the given
    /// socket. Returns whether this call owned and removed the entry.
    pub async fn remove(&self, user_id: &str, socket_id: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(user_id) {
            Some(entry) if entry.socket_id == socket_id => {
                entries.remove(user_id);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(socket_id: &str) -> PresenceEntry {
        let (sender, _receiver) = mpsc::channel(8);
        PresenceEntry {
            socket_id: socket_id.to_string(),
            sender,
        }
    }

    #[tokio::test]
    async fn register_replaces_previous_handle() {
        let registry = PresenceRegistry::new();
        assert!(registry.register("1", entry("a")).await.is_none());
        let displaced = registry.register("1", entry("b")).await;
        assert_eq!(displaced.map(|e| e.socket_id), Some("a".to_string()));
        let current = registry.lookup("1").await.expect("entry");
        assert_eq!(current.socket_id, "b");
    }

    #[tokio::test]
    async fn remove_is_guarded_by_socket_id() {
        let registry = PresenceRegistry::new();
        registry.register("1", entry("a")).await;
        registry.register("1", entry("b")).await;
        // The stale connection must not deregister its replacement.
        assert!(!registry.remove("1", "a").await);
        assert!(registry.lookup("1").await.is_some());
        assert!(registry.remove("1", "b").await);
        assert!(registry.lookup("1").await.is_none());
    }

    #[tokio::test]
    async fn remove_unknown_user_is_noop() {
        let registry = PresenceRegistry::new();
        assert!(!registry.remove("missing", "a").await);
    }
}
