use std::collections::HashMap;

use crate::config::NamespaceConfig;
use crate::protocol::{check_hash_auth, compute_native_auth, compute_sha2_auth};

/// Authentication matrix shared by every namespace.
///
/// A user name may carry several valid passwords, each pinning the session
/// to exactly one namespace via the `user:password` key.
#[derive(Debug, Clone, Default)]
pub struct UserManager {
    /// user name -> all passwords configured for it
    users: HashMap<String, Vec<String>>,
    /// `user:password` -> namespace name
    user_namespaces: HashMap<String, String>,
}

fn user_key(username: &str, password: &str) -> String {
    format!("{}:{}", username, password)
}

impl UserManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs<'a>(configs: impl Iterator<Item = &'a NamespaceConfig>) -> Self {
        let mut manager = Self::new();
        for config in configs {
            manager.add_namespace_users(config);
        }
        manager
    }

    fn add_namespace_users(&mut self, config: &NamespaceConfig) {
        for user in &config.users {
            self.user_namespaces
                .insert(user_key(&user.username, &user.password), config.name.clone());
            self.users
                .entry(user.username.clone())
                .or_default()
                .push(user.password.clone());
        }
    }

    /// Replace one namespace's user entries with the new config's
    pub fn rebuild_namespace_users(&mut self, config: &NamespaceConfig) {
        self.clear_namespace_users(&config.name);
        self.add_namespace_users(config);
    }

    /// Drop every entry owned by a namespace
    pub fn clear_namespace_users(&mut self, namespace: &str) {
        let stale: Vec<String> = self
            .user_namespaces
            .iter()
            .filter(|(_, ns)| ns.as_str() == namespace)
            .map(|(key, _)| key.clone())
            .collect();

        for key in stale {
            self.user_namespaces.remove(&key);
            if let Some((username, password)) = key.split_once(':') {
                if let Some(passwords) = self.users.get_mut(username) {
                    passwords.retain(|p| p != password);
                    if passwords.is_empty() {
                        self.users.remove(username);
                    }
                }
            }
        }
    }

    pub fn check_user(&self, user: &str) -> bool {
        self.users.contains_key(user)
    }

    /// Classic mysql_native_password verification. Returns the matching
    /// plaintext password so the namespace can be resolved.
    pub fn check_password(&self, user: &str, salt: &[u8], auth: &[u8]) -> Option<String> {
        for password in self.users.get(user)? {
            if compute_native_auth(password, salt) == auth {
                return Some(password.clone());
            }
        }
        None
    }

    /// Verification against stored `*HEX(SHA1(SHA1(pw)))` hash entries
    pub fn check_hash_password(&self, user: &str, salt: &[u8], auth: &[u8]) -> Option<String> {
        for password in self.users.get(user)? {
            if password.len() == 41 && password.starts_with('*') {
                if check_hash_auth(auth, salt, password[1..].as_bytes()) {
                    return Some(password.clone());
                }
            }
        }
        None
    }

    /// caching_sha2_password fast-path verification
    pub fn check_sha2_password(&self, user: &str, salt: &[u8], auth: &[u8]) -> Option<String> {
        for password in self.users.get(user)? {
            if compute_sha2_auth(password, salt) == auth {
                return Some(password.clone());
            }
        }
        None
    }

    /// Namespace owning the `(user, password)` pair
    pub fn get_namespace_by_user(&self, user: &str, password: &str) -> Option<String> {
        self.user_namespaces.get(&user_key(user, password)).cloned()
    }
}
