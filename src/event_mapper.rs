//! C4 Event Mapper — turns a raw GitHub webhook payload into a
//! [`MappedEvent`] the router can act on, or `None` if the event is
//! irrelevant (spec.md §4.4).

use codeclaw_common::{Tid, ThreadKind, escape_xml};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMetadata {
    pub issue_number: Option<u64>,
    pub pr_number: Option<u64>,
    pub comment_id: Option<i64>,
    pub review_id: Option<i64>,
    pub sha: Option<String>,
    pub path: Option<String>,
    pub line: Option<u64>,
    pub is_review_comment: bool,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            issue_number: None,
            pr_number: None,
            comment_id: None,
            review_id: None,
            sha: None,
            path: None,
            line: None,
            is_review_comment: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedEvent {
    pub event_type: &'static str,
    pub action: String,
    pub installation_id: i64,
    pub repo_full_name: String,
    pub thread: Tid,
    pub sender: String,
    /// XML-ish prompt payload, already escaped.
    pub content: String,
    pub metadata: EventMetadata,
}

fn mentions(app_slug: &str, body: &str) -> bool {
    let needle = format!("@{}", app_slug.to_lowercase());
    body.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '@' && c != '_' && c != '-')
        .any(|token| token == needle)
}

/// Maps one `(event_name, payload)` webhook delivery. Returns `None`
/// for bot senders, the app's own bot identity, missing
/// installation/repository/sender, or an event this system doesn't
/// react to.
pub fn map_webhook_to_event(event_name: &str, payload: &Value, app_slug: &str) -> Option<MappedEvent> {
    let installation = payload.get("installation")?;
    let repo = payload.get("repository")?;
    let sender = payload.get("sender")?;

    if sender.get("type").and_then(Value::as_str) == Some("Bot") {
        return None;
    }
    let sender_login = sender.get("login")?.as_str()?.to_string();
    if sender_login.eq_ignore_ascii_case(&format!("{app_slug}[bot]")) {
        return None;
    }

    let action = payload.get("action").and_then(Value::as_str).unwrap_or("").to_string();
    let installation_id = installation.get("id")?.as_i64()?;
    let repo_full_name = repo.get("full_name")?.as_str()?.to_string();
    let (owner, name) = repo_full_name.split_once('/')?;

    match event_name {
        "issues" => map_issue_event(&action, payload, owner, name, installation_id, &repo_full_name, &sender_login),
        "issue_comment" => {
            map_issue_comment_event(&action, payload, owner, name, installation_id, &repo_full_name, &sender_login, app_slug)
        }
        "pull_request" => {
            map_pull_request_event(&action, payload, owner, name, installation_id, &repo_full_name, &sender_login)
        }
        "pull_request_review" => {
            map_pr_review_event(&action, payload, owner, name, installation_id, &repo_full_name, &sender_login, app_slug)
        }
        "pull_request_review_comment" => map_pr_review_comment_event(
            &action,
            payload,
            owner,
            name,
            installation_id,
            &repo_full_name,
            &sender_login,
            app_slug,
        ),
        _ => None,
    }
}

fn map_issue_event(
    action: &str,
    payload: &Value,
    owner: &str,
    repo: &str,
    installation_id: i64,
    repo_full_name: &str,
    sender: &str,
) -> Option<MappedEvent> {
    if !matches!(action, "opened" | "assigned") {
        return None;
    }
    let issue = payload.get("issue")?;
    let number = issue.get("number")?.as_u64()?;
    let title = issue.get("title").and_then(Value::as_str).unwrap_or("");
    let body = issue.get("body").and_then(Value::as_str).unwrap_or("");

    let thread = Tid::new("github", owner, repo, ThreadKind::Issue, number);
    let content = format!(
        "<github_event type=\"issue_{action}\" repo=\"{}\" issue=\"#{number}\" sender=\"{}\">\n  <issue_title>{}</issue_title>\n  <issue_body>{}</issue_body>\n</github_event>",
        escape_xml(repo_full_name),
        escape_xml(sender),
        escape_xml(title),
        escape_xml(body),
    );

    Some(MappedEvent {
        event_type: "issues",
        action: action.to_string(),
        installation_id,
        repo_full_name: repo_full_name.to_string(),
        thread,
        sender: sender.to_string(),
        content,
        metadata: EventMetadata {
            issue_number: Some(number),
            ..Default::default()
        },
    })
}

fn map_issue_comment_event(
    action: &str,
    payload: &Value,
    owner: &str,
    repo: &str,
    installation_id: i64,
    repo_full_name: &str,
    sender: &str,
    app_slug: &str,
) -> Option<MappedEvent> {
    if action != "created" {
        return None;
    }
    let issue = payload.get("issue")?;
    let comment = payload.get("comment")?;
    let number = issue.get("number")?.as_u64()?;
    let is_pr = issue.get("pull_request").is_some_and(|v| !v.is_null());
    let comment_body = comment.get("body")?.as_str()?;
    let title = issue.get("title").and_then(Value::as_str).unwrap_or("");
    let comment_id = comment.get("id").and_then(Value::as_i64);

    let kind = if is_pr { ThreadKind::Pr } else { ThreadKind::Issue };
    let thread = Tid::new("github", owner, repo, kind, number);
    let has_mention = mentions(app_slug, comment_body);
    let event_type = if is_pr { "pr_comment" } else { "issue_comment" };

    let content = format!(
        "<github_event type=\"{event_type}\" repo=\"{}\" issue=\"#{number}\" sender=\"{}\" mentioned=\"{has_mention}\">\n  <issue_title>{}</issue_title>\n  <comment>{}</comment>\n</github_event>",
        escape_xml(repo_full_name),
        escape_xml(sender),
        escape_xml(title),
        escape_xml(comment_body),
    );

    Some(MappedEvent {
        event_type: "issue_comment",
        action: action.to_string(),
        installation_id,
        repo_full_name: repo_full_name.to_string(),
        thread,
        sender: sender.to_string(),
        content,
        metadata: EventMetadata {
            issue_number: if is_pr { None } else { Some(number) },
            pr_number: if is_pr { Some(number) } else { None },
            comment_id,
            ..Default::default()
        },
    })
}

fn map_pull_request_event(
    action: &str,
    payload: &Value,
    owner: &str,
    repo: &str,
    installation_id: i64,
    repo_full_name: &str,
    sender: &str,
) -> Option<MappedEvent> {
    if !matches!(action, "opened" | "synchronize") {
        return None;
    }
    let pr = payload.get("pull_request")?;
    let number = pr.get("number")?.as_u64()?;
    let title = pr.get("title").and_then(Value::as_str).unwrap_or("");
    let body = pr.get("body").and_then(Value::as_str).unwrap_or("");
    let additions = pr.get("additions").and_then(Value::as_i64).unwrap_or(0);
    let deletions = pr.get("deletions").and_then(Value::as_i64).unwrap_or(0);
    let changed_files = pr.get("changed_files").and_then(Value::as_i64).unwrap_or(0);
    let sha = pr.get("head")?.get("sha")?.as_str()?.to_string();

    let thread = Tid::new("github", owner, repo, ThreadKind::Pr, number);
    let content = format!(
        "<github_event type=\"pull_request_{action}\" repo=\"{}\" pr=\"#{number}\" sender=\"{}\">\n  <pr_title>{}</pr_title>\n  <pr_body>{}</pr_body>\n  <stats additions=\"{additions}\" deletions=\"{deletions}\" changed_files=\"{changed_files}\" />\n  <head_sha>{sha}</head_sha>\n</github_event>",
        escape_xml(repo_full_name),
        escape_xml(sender),
        escape_xml(title),
        escape_xml(body),
    );

    Some(MappedEvent {
        event_type: "pull_request",
        action: action.to_string(),
        installation_id,
        repo_full_name: repo_full_name.to_string(),
        thread,
        sender: sender.to_string(),
        content,
        metadata: EventMetadata {
            pr_number: Some(number),
            sha: Some(sha),
            ..Default::default()
        },
    })
}

fn map_pr_review_event(
    action: &str,
    payload: &Value,
    owner: &str,
    repo: &str,
    installation_id: i64,
    repo_full_name: &str,
    sender: &str,
    app_slug: &str,
) -> Option<MappedEvent> {
    if action != "submitted" {
        return None;
    }
    let pr = payload.get("pull_request")?;
    let review = payload.get("review")?;
    let body = review.get("body").and_then(Value::as_str).unwrap_or("");
    if !mentions(app_slug, body) {
        return None;
    }

    let number = pr.get("number")?.as_u64()?;
    let title = pr.get("title").and_then(Value::as_str).unwrap_or("");
    let state = review.get("state").and_then(Value::as_str).unwrap_or("");
    let review_id = review.get("id").and_then(Value::as_i64);

    let thread = Tid::new("github", owner, repo, ThreadKind::Pr, number);
    let content = format!(
        "<github_event type=\"pull_request_review\" repo=\"{}\" pr=\"#{number}\" sender=\"{}\" review_state=\"{}\">\n  <pr_title>{}</pr_title>\n  <review_body>{}</review_body>\n</github_event>",
        escape_xml(repo_full_name),
        escape_xml(sender),
        escape_xml(state),
        escape_xml(title),
        escape_xml(body),
    );

    Some(MappedEvent {
        event_type: "pull_request_review",
        action: action.to_string(),
        installation_id,
        repo_full_name: repo_full_name.to_string(),
        thread,
        sender: sender.to_string(),
        content,
        metadata: EventMetadata {
            pr_number: Some(number),
            review_id,
            ..Default::default()
        },
    })
}

fn map_pr_review_comment_event(
    action: &str,
    payload: &Value,
    owner: &str,
    repo: &str,
    installation_id: i64,
    repo_full_name: &str,
    sender: &str,
    app_slug: &str,
) -> Option<MappedEvent> {
    if action != "created" {
        return None;
    }
    let pr = payload.get("pull_request")?;
    let comment = payload.get("comment")?;
    let body = comment.get("body")?.as_str()?;
    let has_mention = mentions(app_slug, body);
    let in_reply_to = comment.get("in_reply_to_id").is_some_and(|v| !v.is_null());
    if !has_mention && !in_reply_to {
        return None;
    }

    let number = pr.get("number")?.as_u64()?;
    let title = pr.get("title").and_then(Value::as_str).unwrap_or("");
    let path = comment.get("path").and_then(Value::as_str).unwrap_or("").to_string();
    let line = comment.get("line").and_then(Value::as_u64);
    let comment_id = comment.get("id").and_then(Value::as_i64);

    let thread = Tid::new("github", owner, repo, ThreadKind::Pr, number);
    let content = format!(
        "<github_event type=\"pull_request_review_comment\" repo=\"{}\" pr=\"#{number}\" sender=\"{}\" path=\"{}\">\n  <pr_title>{}</pr_title>\n  <comment line=\"{}\">{}</comment>\n</github_event>",
        escape_xml(repo_full_name),
        escape_xml(sender),
        escape_xml(&path),
        escape_xml(title),
        line.unwrap_or(0),
        escape_xml(body),
    );

    Some(MappedEvent {
        event_type: "pull_request_review_comment",
        action: action.to_string(),
        installation_id,
        repo_full_name: repo_full_name.to_string(),
        thread,
        sender: sender.to_string(),
        content,
        metadata: EventMetadata {
            pr_number: Some(number),
            comment_id,
            is_review_comment: true,
            path: Some(path),
            line,
            ..Default::default()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_payload(action: &str) -> Value {
        json!({
            "action": action,
            "installation": {"id": 42},
            "repository": {"full_name": "acme/widgets"},
            "sender": {"login": "alice", "type": "User"},
        })
    }

    #[test]
    fn bot_sender_is_dropped() {
        let mut payload = base_payload("opened");
        payload["sender"]["type"] = json!("Bot");
        payload["issue"] = json!({"number": 1, "title": "t", "body": "b"});
        assert!(map_webhook_to_event("issues", &payload, "codeclaw").is_none());
    }

    #[test]
    fn app_bot_identity_is_dropped() {
        let mut payload = base_payload("opened");
        payload["sender"]["login"] = json!("codeclaw[bot]");
        payload["issue"] = json!({"number": 1, "title": "t", "body": "b"});
        assert!(map_webhook_to_event("issues", &payload, "codeclaw").is_none());
    }

    #[test]
    fn issue_opened_is_mapped() {
        let mut payload = base_payload("opened");
        payload["issue"] = json!({"number": 7, "title": "Bug", "body": "it <broke>"});
        let event = map_webhook_to_event("issues", &payload, "codeclaw").unwrap();
        assert_eq!(event.thread.to_string(), "github:acme/widgets#issue:7");
        assert!(event.content.contains("it &lt;broke&gt;"));
    }

    #[test]
    fn issue_closed_is_not_accepted() {
        let mut payload = base_payload("closed");
        payload["issue"] = json!({"number": 7, "title": "Bug", "body": ""});
        assert!(map_webhook_to_event("issues", &payload, "codeclaw").is_none());
    }

    #[test]
    fn issue_comment_on_pr_maps_to_pr_thread() {
        let mut payload = base_payload("created");
        payload["issue"] = json!({"number": 9, "title": "t", "pull_request": {}});
        payload["comment"] = json!({"id": 100, "body": "@codeclaw please look"});
        let event = map_webhook_to_event("issue_comment", &payload, "codeclaw").unwrap();
        assert_eq!(event.thread.to_string(), "github:acme/widgets#pr:9");
        assert!(event.content.contains("mentioned=\"true\""));
    }

    #[test]
    fn pr_review_without_mention_is_dropped() {
        let mut payload = base_payload("submitted");
        payload["pull_request"] = json!({"number": 3, "title": "t"});
        payload["review"] = json!({"id": 5, "state": "approved", "body": "looks fine"});
        assert!(map_webhook_to_event("pull_request_review", &payload, "codeclaw").is_none());
    }

    #[test]
    fn pr_review_with_mention_is_accepted() {
        let mut payload = base_payload("submitted");
        payload["pull_request"] = json!({"number": 3, "title": "t"});
        payload["review"] = json!({"id": 5, "state": "approved", "body": "@codeclaw take a look"});
        assert!(map_webhook_to_event("pull_request_review", &payload, "codeclaw").is_some());
    }

    #[test]
    fn pr_review_comment_accepted_via_reply_without_mention() {
        let mut payload = base_payload("created");
        payload["pull_request"] = json!({"number": 3, "title": "t"});
        payload["comment"] = json!({"id": 5, "body": "agreed", "path": "src/lib.rs", "line": 10, "in_reply_to_id": 1});
        let event = map_webhook_to_event("pull_request_review_comment", &payload, "codeclaw").unwrap();
        assert!(event.metadata.is_review_comment);
        assert_eq!(event.metadata.path.as_deref(), Some("src/lib.rs"));
    }

    #[test]
    fn pull_request_synchronize_is_accepted() {
        let mut payload = base_payload("synchronize");
        payload["pull_request"] = json!({
            "number": 3, "title": "t", "body": "b",
            "additions": 1, "deletions": 2, "changed_files": 1,
            "head": {"sha": "abc123"},
        });
        let event = map_webhook_to_event("pull_request", &payload, "codeclaw").unwrap();
        assert_eq!(event.metadata.sha.as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_installation_is_dropped() {
        let mut payload = base_payload("opened");
        payload.as_object_mut().unwrap().remove("installation");
        payload["issue"] = json!({"number": 1, "title": "t", "body": ""});
        assert!(map_webhook_to_event("issues", &payload, "codeclaw").is_none());
    }
}
