//! C2 Token Manager — GitHub App JWT minting and per-repo installation
//! token caching with proactive refresh.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};

use crate::errors::TokenError;

type Result<T> = std::result::Result<T, TokenError>;

const JWT_TTL_SECS: i64 = 9 * 60;
const REFRESH_SKEW: ChronoDuration = ChronoDuration::minutes(5);

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Clone, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now + REFRESH_SKEW >= self.expires_at
    }
}

/// Mints app JWTs and caches one installation token per repo, refreshing
/// proactively rather than on 401.
pub struct TokenManager {
    app_id: String,
    encoding_key: EncodingKey,
    client: reqwest::Client,
    api_base: String,
    installation_ids: HashMap<String, u64>,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl TokenManager {
    pub fn new(
        app_id: impl Into<String>,
        private_key_pem: &[u8],
        installation_ids: HashMap<String, u64>,
    ) -> Result<Self> {
        let encoding_key =
            EncodingKey::from_rsa_pem(private_key_pem).map_err(TokenError::Jwt)?;
        Ok(Self {
            app_id: app_id.into(),
            encoding_key,
            client: reqwest::Client::new(),
            api_base: "https://api.github.com".to_string(),
            installation_ids,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn app_slug(&self) -> &str {
        &self.app_id
    }

    fn mint_app_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs() as i64;
        let claims = AppClaims {
            // Back-dated 60s, GitHub rejects tokens issued in the future
            // under minor clock drift.
            iat: now - 60,
            exp: now + JWT_TTL_SECS,
            iss: self.app_id.clone(),
        };
        let header = Header::new(Algorithm::RS256);
        encode(&header, &claims, &self.encoding_key).map_err(TokenError::Jwt)
    }

    /// Returns a valid installation access token for `owner/repo`,
    /// minting a fresh one if the cached copy is within 5 minutes of
    /// expiry or absent.
    pub async fn repo_scoped_token(&self, owner: &str, repo: &str) -> Result<String> {
        let repo_prefix = format!("{owner}/{repo}");
        let now = Utc::now();

        if let Some(cached) = self.cache.lock().unwrap().get(&repo_prefix) {
            if !cached.needs_refresh(now) {
                return Ok(cached.token.clone());
            }
        }

        let installation_id =
            self.installation_ids
                .get(&repo_prefix)
                .copied()
                .ok_or_else(|| TokenError::NoInstallation {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                })?;

        let app_jwt = self.mint_app_jwt()?;
        let url = format!("{}/app/installations/{installation_id}/access_tokens", self.api_base);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(app_jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "codeclaw")
            .json(&serde_json::json!({
                "permissions": {
                    "contents": "write",
                    "pull_requests": "write",
                    "issues": "write",
                    "metadata": "read",
                }
            }))
            .send()
            .await
            .map_err(|e| TokenError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TokenError::Http(format!("{status}: {body}")));
        }

        let parsed: InstallationTokenResponse =
            resp.json().await.map_err(|e| TokenError::Http(e.to_string()))?;

        self.cache.lock().unwrap().insert(
            repo_prefix,
            CachedToken {
                token: parsed.token.clone(),
                expires_at: parsed.expires_at,
            },
        );
        Ok(parsed.token)
    }

    /// Convenience wrapper building the `Authorization`/`Accept` header
    /// pair every REST call against `owner/repo` needs.
    pub async fn repo_auth_headers(&self, owner: &str, repo: &str) -> Result<Vec<(String, String)>> {
        let token = self.repo_scoped_token(owner, repo).await?;
        Ok(vec![
            ("Authorization".to_string(), format!("Bearer {token}")),
            ("Accept".to_string(), "application/vnd.github+json".to_string()),
            ("User-Agent".to_string(), "codeclaw".to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A throwaway RSA key generated solely for unit tests, not tied to
    // any real GitHub App registration.
    const TEST_KEY: &str = include_str!("../testdata/test_rsa_key.pem");

    #[test]
    fn mint_app_jwt_has_expected_claims() {
        let manager = TokenManager::new("12345", TEST_KEY.as_bytes(), HashMap::new()).unwrap();
        let jwt = manager.mint_app_jwt().unwrap();
        assert_eq!(jwt.split('.').count(), 3);
    }

    #[tokio::test]
    async fn repo_scoped_token_without_installation_errors() {
        let manager = TokenManager::new("12345", TEST_KEY.as_bytes(), HashMap::new()).unwrap();
        let err = manager.repo_scoped_token("acme", "widgets").await.unwrap_err();
        assert!(matches!(err, TokenError::NoInstallation { .. }));
    }

    #[test]
    fn cached_token_needs_refresh_inside_skew_window() {
        let cached = CachedToken {
            token: "t".into(),
            expires_at: Utc::now() + ChronoDuration::minutes(4),
        };
        assert!(cached.needs_refresh(Utc::now()));

        let fresh = CachedToken {
            token: "t".into(),
            expires_at: Utc::now() + ChronoDuration::minutes(30),
        };
        assert!(!fresh.needs_refresh(Utc::now()));
    }
}
