//! C5 Access Gate — collaborator-permission check plus a sliding-window
//! rate limiter, both closed-fail on ambiguity.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use codeclaw_common::PermissionLevel;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::error;

#[derive(Debug, Clone)]
pub struct AccessPolicy {
    pub min_permission: PermissionLevel,
    pub allow_external_contributors: bool,
    pub rate_limit_per_user: usize,
    pub rate_limit_window: Duration,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            min_permission: PermissionLevel::Triage,
            allow_external_contributors: false,
            rate_limit_per_user: 10,
            rate_limit_window: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PermissionResponse {
    permission: String,
}

/// Checks whether `username` may trigger the orchestrator against
/// `owner/repo`. A 404 (not a collaborator) and any transport error are
/// both handled explicitly; only `allow_external_contributors` can turn
/// a 404 into a pass.
pub async fn check_permission(
    client: &reqwest::Client,
    auth_headers: &[(String, String)],
    owner: &str,
    repo: &str,
    username: &str,
    policy: &AccessPolicy,
) -> (bool, Option<String>) {
    let url = format!("https://api.github.com/repos/{owner}/{repo}/collaborators/{username}/permission");
    let mut req = client.get(&url);
    for (k, v) in auth_headers {
        req = req.header(k, v);
    }

    let resp = match req.send().await {
        Ok(r) => r,
        Err(err) => {
            error!(owner, repo, username, error = %err, "permission check transport failure");
            return (false, Some("Permission check failed".to_string()));
        }
    };

    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        return if policy.allow_external_contributors {
            (true, None)
        } else {
            (false, Some("Not a collaborator".to_string()))
        };
    }

    if !resp.status().is_success() {
        error!(owner, repo, username, status = %resp.status(), "permission check failed");
        return (false, Some("Permission check failed".to_string()));
    }

    let body: PermissionResponse = match resp.json().await {
        Ok(b) => b,
        Err(err) => {
            error!(owner, repo, username, error = %err, "permission response could not be parsed");
            return (false, Some("Permission check failed".to_string()));
        }
    };

    let user_rank = PermissionLevel::from_api_value(&body.permission);
    if user_rank >= policy.min_permission {
        return (true, None);
    }
    (
        false,
        Some(format!(
            "Insufficient permissions: {} < {:?}",
            body.permission, policy.min_permission
        )),
    )
}

/// In-memory sliding-window limiter keyed by `(user, repo_prefix)`.
pub struct RateLimiter {
    buckets: DashMap<String, Mutex<Vec<i64>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { buckets: DashMap::new() }
    }

    /// Returns `(allowed, retry_after_ms)`.
    pub fn check(&self, user: &str, repo_prefix: &str, policy: &AccessPolicy) -> (bool, Option<i64>) {
        let key = format!("{user}:{repo_prefix}");
        let now = Utc::now().timestamp_millis();
        let window_ms = policy.rate_limit_window.as_millis() as i64;

        let bucket = self.buckets.entry(key).or_insert_with(|| Mutex::new(Vec::new()));
        let mut timestamps = bucket.lock().unwrap();
        timestamps.retain(|t| now - t < window_ms);

        if timestamps.len() >= policy.rate_limit_per_user {
            let oldest = timestamps[0];
            let retry_after_ms = window_ms - (now - oldest);
            return (false, Some(retry_after_ms));
        }

        timestamps.push(now);
        (true, None)
    }

    /// Drops buckets whose every timestamp has aged past `max_age`.
    pub fn cleanup(&self, max_age: Duration) {
        let now = Utc::now().timestamp_millis();
        let max_age_ms = max_age.as_millis() as i64;
        let mut stale_keys = Vec::new();

        for mut entry in self.buckets.iter_mut() {
            let mut timestamps = entry.value().lock().unwrap();
            timestamps.retain(|t| now - t < max_age_ms);
            if timestamps.is_empty() {
                stale_keys.push(entry.key().clone());
            }
        }
        for key in stale_keys {
            self.buckets.remove(&key);
        }
    }

    /// Spawns a background reaper that periodically drops idle buckets.
    pub fn spawn_reaper(self: std::sync::Arc<Self>, interval: Duration, max_age: Duration) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                self.cleanup(max_age);
            }
        });
    }
}

/// Pending policy overrides keyed by repo-prefix; defaults apply when
/// a repo has no override registered.
pub struct PolicyRegistry {
    overrides: HashMap<String, AccessPolicy>,
    default: AccessPolicy,
}

impl PolicyRegistry {
    pub fn new(default: AccessPolicy) -> Self {
        Self { overrides: HashMap::new(), default }
    }

    pub fn set(&mut self, repo_prefix: impl Into<String>, policy: AccessPolicy) {
        self.overrides.insert(repo_prefix.into(), policy);
    }

    pub fn get(&self, repo_prefix: &str) -> &AccessPolicy {
        self.overrides.get(repo_prefix).unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_up_to_limit_then_blocks() {
        let limiter = RateLimiter::new();
        let policy = AccessPolicy {
            rate_limit_per_user: 2,
            ..Default::default()
        };
        assert!(limiter.check("alice", "github:acme/widgets", &policy).0);
        assert!(limiter.check("alice", "github:acme/widgets", &policy).0);
        let (allowed, retry_after) = limiter.check("alice", "github:acme/widgets", &policy);
        assert!(!allowed);
        assert!(retry_after.unwrap() > 0);
    }

    #[test]
    fn rate_limiter_tracks_separate_buckets_per_user_and_repo() {
        let limiter = RateLimiter::new();
        let policy = AccessPolicy {
            rate_limit_per_user: 1,
            ..Default::default()
        };
        assert!(limiter.check("alice", "github:acme/widgets", &policy).0);
        assert!(limiter.check("bob", "github:acme/widgets", &policy).0);
        assert!(limiter.check("alice", "github:acme/other", &policy).0);
        assert!(!limiter.check("alice", "github:acme/widgets", &policy).0);
    }

    #[test]
    fn cleanup_drops_fully_stale_buckets() {
        let limiter = RateLimiter::new();
        let policy = AccessPolicy::default();
        limiter.check("alice", "github:acme/widgets", &policy);
        limiter.cleanup(Duration::from_millis(0));
        assert_eq!(limiter.buckets.len(), 0);
    }

    #[test]
    fn policy_registry_falls_back_to_default() {
        let mut registry = PolicyRegistry::new(AccessPolicy::default());
        registry.set(
            "github:acme/widgets",
            AccessPolicy {
                min_permission: PermissionLevel::Admin,
                ..Default::default()
            },
        );
        assert_eq!(registry.get("github:acme/widgets").min_permission, PermissionLevel::Admin);
        assert_eq!(registry.get("github:acme/other").min_permission, PermissionLevel::Triage);
    }
}
