//! Security Manager
//!
//! Token issuance and validation plus per-IP connection accounting,
//! independent of the transport. Tokens are random 256-bit hex strings with
//! a TTL; a secondary user index supports bulk revocation and the per-user
//! token cap.

use crate::config::SecurityConfig;
use crate::{RealtimeError, Result};
use dashmap::DashMap;
use rand::RngCore;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Instant;
use tracing::debug;

/// An issued authentication token
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub token: String,
    pub user_id: String,
    pub roles: Vec<String>,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl TokenInfo {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Token registry and connection accounting
#[derive(Debug)]
pub struct SecurityManager {
    config: SecurityConfig,
    tokens: DashMap<String, TokenInfo>,
    user_tokens: DashMap<String, HashSet<String>>,
    ip_connections: DashMap<IpAddr, usize>,
}

impl SecurityManager {
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            config,
            tokens: DashMap::new(),
            user_tokens: DashMap::new(),
            ip_connections: DashMap::new(),
        }
    }

    /// Issue a token for a user. When the user is at the token cap, the
    /// oldest active token is revoked to make room.
    pub fn issue_token(&self, user_id: impl Into<String>, roles: Vec<String>) -> TokenInfo {
        let user_id = user_id.into();

        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let now = Instant::now();
        let info = TokenInfo {
            token: token.clone(),
            user_id: user_id.clone(),
            roles,
            issued_at: now,
            expires_at: now + self.config.token_ttl,
        };

        let evict = {
            let mut set = self.user_tokens.entry(user_id.clone()).or_default();
            let evict = if set.len() >= self.config.max_tokens_per_user {
                set.iter()
                    .filter_map(|t| self.tokens.get(t).map(|i| (t.clone(), i.issued_at)))
                    .min_by_key(|(_, issued)| *issued)
                    .map(|(t, _)| t)
            } else {
                None
            };
            if let Some(old) = &evict {
                set.remove(old);
            }
            set.insert(token.clone());
            evict
        };
        if let Some(old) = evict {
            self.tokens.remove(&old);
            debug!(user_id = %user_id, "evicted oldest token at per-user cap");
        }

        self.tokens.insert(token, info.clone());
        info
    }

    /// Validate a token: it must exist and be unexpired. Expired tokens are
    /// removed as a side effect.
    pub fn validate_token(&self, token: &str) -> Result<TokenInfo> {
        let info = self
            .tokens
            .get(token)
            .map(|i| i.clone())
            .ok_or_else(|| RealtimeError::security("Unknown token"))?;

        if info.is_expired() {
            self.remove_token(token);
            return Err(RealtimeError::security("Token expired"));
        }
        Ok(info)
    }

    /// Revoke a single token; returns whether it was active
    pub fn revoke_token(&self, token: &str) -> bool {
        self.remove_token(token)
    }

    /// Revoke every active token for a user; returns how many were revoked
    pub fn revoke_user_tokens(&self, user_id: &str) -> usize {
        let Some((_, set)) = self.user_tokens.remove(user_id) else {
            return 0;
        };
        let mut revoked = 0;
        for token in set {
            if self.tokens.remove(&token).is_some() {
                revoked += 1;
            }
        }
        revoked
    }

    /// Drop every expired token; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let expired: Vec<String> = self
            .tokens
            .iter()
            .filter(|e| e.is_expired())
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for token in expired {
            self.remove_token(&token);
        }
        count
    }

    /// Active (possibly expired but unpurged) token count for a user
    pub fn active_token_count(&self, user_id: &str) -> usize {
        self.user_tokens
            .get(user_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Account for a new connection from `ip`; rejects past the per-IP cap
    pub fn register_connection(&self, ip: IpAddr) -> Result<()> {
        let mut count = self.ip_connections.entry(ip).or_insert(0);
        if *count >= self.config.max_connections_per_ip {
            return Err(RealtimeError::resource_exhausted(
                "connections_per_ip",
                format!("IP {} is at its connection limit", ip),
            ));
        }
        *count += 1;
        Ok(())
    }

    /// Release a connection slot for `ip`; idempotent once the count is zero
    pub fn release_connection(&self, ip: IpAddr) {
        if let Some(mut count) = self.ip_connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                drop(count);
                self.ip_connections.remove_if(&ip, |_, c| *c == 0);
            }
        }
    }

    /// Current connection count for `ip`
    pub fn connection_count(&self, ip: IpAddr) -> usize {
        self.ip_connections.get(&ip).map(|c| *c).unwrap_or(0)
    }

    fn remove_token(&self, token: &str) -> bool {
        let Some((_, info)) = self.tokens.remove(token) else {
            return false;
        };
        if let Some(mut set) = self.user_tokens.get_mut(&info.user_id) {
            set.remove(token);
            if set.is_empty() {
                drop(set);
                self.user_tokens.remove_if(&info.user_id, |_, s| s.is_empty());
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn manager(ttl_ms: u64) -> SecurityManager {
        SecurityManager::new(SecurityConfig {
            token_ttl: Duration::from_millis(ttl_ms),
            max_tokens_per_user: 3,
            max_connections_per_ip: 2,
        })
    }

    #[test]
    fn test_issue_and_validate() {
        let sm = manager(60_000);
        let info = sm.issue_token("user-1", vec!["admin".into()]);

        let validated = sm.validate_token(&info.token).unwrap();
        assert_eq!(validated.user_id, "user-1");
        assert!(validated.has_role("admin"));
        assert!(!validated.has_role("viewer"));
    }

    #[test]
    fn test_unknown_token_rejected() {
        let sm = manager(60_000);
        assert!(sm.validate_token("deadbeef").is_err());
    }

    #[tokio::test]
    async fn test_expired_token_rejected_and_removed() {
        let sm = manager(10);
        let info = sm.issue_token("user-1", vec![]);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sm.validate_token(&info.token).is_err());
        assert_eq!(sm.active_token_count("user-1"), 0);
    }

    #[test]
    fn test_per_user_cap_evicts_oldest() {
        let sm = manager(60_000);
        let first = sm.issue_token("user-1", vec![]);
        sm.issue_token("user-1", vec![]);
        sm.issue_token("user-1", vec![]);
        sm.issue_token("user-1", vec![]);

        assert_eq!(sm.active_token_count("user-1"), 3);
        assert!(sm.validate_token(&first.token).is_err());
    }

    #[test]
    fn test_revoke_user_tokens() {
        let sm = manager(60_000);
        let a = sm.issue_token("user-1", vec![]);
        let b = sm.issue_token("user-1", vec![]);
        let other = sm.issue_token("user-2", vec![]);

        assert_eq!(sm.revoke_user_tokens("user-1"), 2);
        assert!(sm.validate_token(&a.token).is_err());
        assert!(sm.validate_token(&b.token).is_err());
        assert!(sm.validate_token(&other.token).is_ok());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let sm = manager(10);
        sm.issue_token("user-1", vec![]);
        sm.issue_token("user-2", vec![]);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sm.purge_expired(), 2);
        assert_eq!(sm.active_token_count("user-1"), 0);
    }

    #[test]
    fn test_ip_connection_cap() {
        let sm = manager(60_000);
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

        sm.register_connection(ip).unwrap();
        sm.register_connection(ip).unwrap();
        assert!(sm.register_connection(ip).is_err());

        sm.release_connection(ip);
        sm.register_connection(ip).unwrap();
        assert_eq!(sm.connection_count(ip), 2);
    }

    #[test]
    fn test_release_is_bounded_at_zero() {
        let sm = manager(60_000);
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        sm.release_connection(ip);
        assert_eq!(sm.connection_count(ip), 0);
    }
}
