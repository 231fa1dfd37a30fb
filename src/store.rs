use std::collections::HashMap;
use std::sync::Mutex;

/// Credential-store collaborator. The production implementation sits in
/// front of a pooled database client; any failure on its side reads as
/// "verification failed", never as a server error.
pub trait UserStore: Send + Sync {
    /// Stored password for `name`, if the user exists.
    fn verify(&self, name: &str) -> Option<String>;

    /// Create a new user. `false` on conflict or store failure.
    fn create(&self, name: &str, password: &str) -> bool;
}

/// In-memory store used by tests and the default bootstrap.
#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(name: &str, password: &str) -> Self {
        let store = Self::new();
        store.create(name, password);
        store
    }
}

impl UserStore for MemoryStore {
    fn verify(&self, name: &str) -> Option<String> {
        self.users.lock().unwrap().get(name).cloned()
    }

    fn create(&self, name: &str, password: &str) -> bool {
        let mut users = self.users.lock().unwrap();
        if users.contains_key(name) {
            return false;
        }
        users.insert(name.to_string(), password.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_verify() {
        let store = MemoryStore::new();
        assert!(store.create("ada", "engine"));
        assert!(!store.create("ada", "other"));
        assert_eq!(store.verify("ada").as_deref(), Some("engine"));
        assert_eq!(store.verify("ghost"), None);
    }
}
