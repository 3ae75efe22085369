//! GitHub REST egress: the concrete [`OutboundChannel`] the router
//! wires into the IPC watcher, plus the permission lookups the access
//! gate needs. Grounded on the teacher's `factory/github.rs` reqwest
//! idiom (bearer auth, plain `.json()` deserialization), scoped tokens
//! come from [`TokenManager`].

use async_trait::async_trait;
use codeclaw_common::Tid;
use codeclaw_runtime::TokenError;
use codeclaw_runtime::ipc::OutboundChannel;
use codeclaw_runtime::token::TokenManager;
use std::sync::Arc;
use tracing::error;

const API_BASE: &str = "https://api.github.com";

pub struct GitHubChannel {
    tokens: Arc<TokenManager>,
    client: reqwest::Client,
}

impl GitHubChannel {
    pub fn new(tokens: Arc<TokenManager>) -> Self {
        Self { tokens, client: reqwest::Client::new() }
    }

    async fn post(&self, owner: &str, repo: &str, path: &str, body: serde_json::Value) -> Result<reqwest::Response, TokenError> {
        let token = self.tokens.repo_scoped_token(owner, repo).await?;
        self.client
            .post(format!("{API_BASE}/repos/{owner}/{repo}{path}"))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "codeclaw")
            .json(&body)
            .send()
            .await
            .map_err(|e| TokenError::Http(e.to_string()))
    }

}

#[async_trait]
impl OutboundChannel for GitHubChannel {
    async fn send_message(&self, chat: &Tid, text: &str) {
        self.send_comment(chat, text).await;
    }

    async fn send_comment(&self, chat: &Tid, text: &str) {
        let path = format!("/issues/{}/comments", chat.number);
        if let Err(err) = self.post(&chat.owner, &chat.repo, &path, serde_json::json!({"body": text})).await {
            error!(%chat, error = %err, "failed to post comment");
        }
    }

    async fn send_review(&self, chat: &Tid, body: &str, event: &str, comments: serde_json::Value) {
        let path = format!("/pulls/{}/reviews", chat.number);
        let payload = serde_json::json!({"body": body, "event": event, "comments": comments});
        if let Err(err) = self.post(&chat.owner, &chat.repo, &path, payload).await {
            error!(%chat, error = %err, "failed to post review");
        }
    }

    async fn create_pr(&self, chat: &Tid, title: &str, body: &str, head: &str, base: &str) {
        let payload = serde_json::json!({"title": title, "body": body, "head": head, "base": base});
        if let Err(err) = self.post(&chat.owner, &chat.repo, "/pulls", payload).await {
            error!(%chat, error = %err, "failed to create pull request");
        }
    }
}
