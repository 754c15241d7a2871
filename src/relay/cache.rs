use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::store::{Token, User};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenCacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 60,
            max_entries: 10_000,
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    token: Token,
    user: User,
    expires_at: u64,
}

/// Key lookups cached in front of the store. Balances in cached entries may lag.
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: HashMap<String, CacheEntry>,
}

impl TokenCache {
    pub fn get(&mut self, key: &str, now: u64) -> Option<(Token, User)> {
        let entry = self.entries.get(key)?;
        if now >= entry.expires_at {
            self.entries.remove(key);
            return None;
        }
        Some((entry.token.clone(), entry.user.clone()))
    }

    pub fn insert(&mut self, key: String, token: Token, user: User, config: &TokenCacheConfig, now: u64) {
        if !config.enabled || config.ttl_seconds == 0 {
            return;
        }
        if self.entries.len() >= config.max_entries {
            self.entries.retain(|_, entry| entry.expires_at > now);
            if self.entries.len() >= config.max_entries {
                self.entries.clear();
            }
        }
        let entry = CacheEntry {
            token,
            user,
            expires_at: now.saturating_add(config.ttl_seconds),
        };
        self.entries.insert(key, entry);
    }

    pub fn invalidate(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire_after_ttl() {
        let config = TokenCacheConfig {
            ttl_seconds: 10,
            ..TokenCacheConfig::default()
        };
        let mut cache = TokenCache::default();
        cache.insert("abc".to_string(), Token::new(1, "abc", 2), User::new(2, 5), &config, 100);

        let (token, user) = cache.get("abc", 105).expect("fresh entry");
        assert_eq!(token.id, 1);
        assert_eq!(user.quota, 5);
        assert!(cache.get("abc", 110).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let config = TokenCacheConfig {
            enabled: false,
            ..TokenCacheConfig::default()
        };
        let mut cache = TokenCache::default();
        cache.insert("abc".to_string(), Token::new(1, "abc", 2), User::new(2, 5), &config, 100);
        assert!(cache.get("abc", 100).is_none());
    }

    #[test]
    fn full_cache_evicts_expired_entries_first() {
        let config = TokenCacheConfig {
            enabled: true,
            ttl_seconds: 10,
            max_entries: 2,
        };
        let mut cache = TokenCache::default();
        cache.insert("a".to_string(), Token::new(1, "a", 1), User::new(1, 0), &config, 0);
        cache.insert("b".to_string(), Token::new(2, "b", 1), User::new(1, 0), &config, 5);
        cache.insert("c".to_string(), Token::new(3, "c", 1), User::new(1, 0), &config, 12);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a", 12).is_none());
        assert!(cache.get("b", 12).is_some());
    }
}
