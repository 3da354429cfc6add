//! Context resolution — turns placeholder tokens into concrete values
//! before a task is handed to the executor.
//!
//! A string that is *entirely* one token is replaced; a token embedded in a
//! longer string is left untouched (no partial interpolation — ambiguity is
//! worse than a visible marker). Grammar:
//!
//! ```text
//! $NAME$              $NAME:PARAM$            $NAME[P1,P2,...]$
//! trailing ?          → Null instead of error on failure
//! trailing |default   → literal or JSON-decoded default on failure
//! ```
//!
//! Handlers are a closed enum, matched exhaustively — no string-keyed
//! dispatch. `STATE` misses are non-fatal (Null); everything else fails
//! with a typed resolution error unless a modifier intercepts it.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

use muster_core::error::{MusterError, Result};
use muster_core::traits::{CredentialStore, StateStore};

/// Known placeholder handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    Credentials,
    State,
    File,
    Fetch,
}

impl Handler {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "CREDENTIALS" => Some(Handler::Credentials),
            "STATE" => Some(Handler::State),
            "FILE" => Some(Handler::File),
            "FETCH" => Some(Handler::Fetch),
            _ => None,
        }
    }
}

/// What happens when a handler fails.
#[derive(Debug, Clone, PartialEq)]
enum Modifier {
    /// Propagate the resolution error.
    Required,
    /// Swallow the failure, resolve to Null.
    Optional,
    /// Swallow the failure, resolve to this value.
    Default(Value),
}

/// A fully parsed placeholder token.
#[derive(Debug, Clone, PartialEq)]
struct Token {
    name: String,
    params: Vec<String>,
    modifier: Modifier,
}

/// Parse a string that may be exactly one placeholder token.
/// Returns `None` for anything else, including embedded tokens.
fn parse_token(s: &str) -> Option<Token> {
    let inner = s.strip_prefix('$')?.strip_suffix('$')?;
    if inner.is_empty() || inner.contains('$') {
        return None;
    }

    let name_end = inner
        .find(|c: char| !(c.is_ascii_uppercase() || c == '_'))
        .unwrap_or(inner.len());
    if name_end == 0 {
        return None;
    }
    let name = &inner[..name_end];
    let mut rest = &inner[name_end..];

    let mut params = Vec::new();
    if let Some(after) = rest.strip_prefix('[') {
        let close = after.find(']')?;
        params = after[..close]
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        rest = &after[close + 1..];
    } else if let Some(after) = rest.strip_prefix(':') {
        // Single param runs until the modifier (if any).
        let end = after.find('|').unwrap_or_else(|| {
            if after.ends_with('?') {
                after.len() - 1
            } else {
                after.len()
            }
        });
        if end == 0 {
            return None;
        }
        params.push(after[..end].to_string());
        rest = &after[end..];
    }

    let modifier = if let Some(default) = rest.strip_prefix('|') {
        let value = serde_json::from_str(default).unwrap_or(Value::String(default.to_string()));
        Modifier::Default(value)
    } else if rest == "?" {
        Modifier::Optional
    } else if rest.is_empty() {
        Modifier::Required
    } else {
        return None;
    };

    Some(Token {
        name: name.to_string(),
        params,
        modifier,
    })
}

/// Stateless placeholder resolver, parameterized by the stores it reads.
pub struct ContextResolver {
    credentials: Arc<dyn CredentialStore>,
    state: Arc<dyn StateStore>,
    /// Root of the per-agent data tree; FILE reads are confined to
    /// `<data_dir>/<agent_id>/`.
    data_dir: PathBuf,
    http: reqwest::Client,
}

impl ContextResolver {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        state: Arc<dyn StateStore>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            credentials,
            state,
            data_dir,
            http: reqwest::Client::new(),
        }
    }

    /// Resolve every token in a context structure, preserving its shape.
    pub async fn resolve(&self, agent_id: &str, task_id: &str, context: &Value) -> Result<Value> {
        self.resolve_value(agent_id, task_id, context).await
    }

    fn resolve_value<'a>(
        &'a self,
        agent_id: &'a str,
        task_id: &'a str,
        value: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(async move {
            match value {
                Value::Object(map) => {
                    let mut out = Map::with_capacity(map.len());
                    for (key, inner) in map {
                        out.insert(
                            key.clone(),
                            self.resolve_value(agent_id, task_id, inner).await?,
                        );
                    }
                    Ok(Value::Object(out))
                }
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for inner in items {
                        out.push(self.resolve_value(agent_id, task_id, inner).await?);
                    }
                    Ok(Value::Array(out))
                }
                Value::String(s) => match parse_token(s) {
                    Some(token) => self.resolve_token(agent_id, task_id, s, &token).await,
                    None => Ok(value.clone()),
                },
                _ => Ok(value.clone()),
            }
        })
    }

    async fn resolve_token(
        &self,
        agent_id: &str,
        task_id: &str,
        raw: &str,
        token: &Token,
    ) -> Result<Value> {
        let result = self.dispatch(agent_id, task_id, raw, token).await;
        match result {
            Ok(v) => Ok(v),
            Err(e) => match &token.modifier {
                Modifier::Required => Err(e),
                Modifier::Optional => {
                    tracing::debug!("optional token {raw} unresolved: {e}");
                    Ok(Value::Null)
                }
                Modifier::Default(default) => {
                    tracing::debug!("token {raw} unresolved, using default: {e}");
                    Ok(default.clone())
                }
            },
        }
    }

    async fn dispatch(
        &self,
        agent_id: &str,
        task_id: &str,
        raw: &str,
        token: &Token,
    ) -> Result<Value> {
        let handler = Handler::from_name(&token.name).ok_or_else(|| MusterError::Resolution {
            token: raw.to_string(),
            reason: format!("unknown placeholder '{}'", token.name),
        })?;

        match handler {
            Handler::Credentials => {
                let name = token.params.first().ok_or_else(|| MusterError::Resolution {
                    token: raw.to_string(),
                    reason: "CREDENTIALS needs a credential-set name".into(),
                })?;
                match self.credentials.credentials(agent_id, name).await {
                    Some(map) => Ok(Value::Object(map)),
                    None => Err(MusterError::Resolution {
                        token: raw.to_string(),
                        reason: format!("no credentials named '{name}'"),
                    }),
                }
            }
            Handler::State => {
                let state = self.state.state(agent_id, task_id).await;
                match token.params.first() {
                    // Missing state keys are non-fatal: the task may simply
                    // not have run yet.
                    Some(key) => Ok(state.get(key).cloned().unwrap_or(Value::Null)),
                    None => Ok(Value::Object(state)),
                }
            }
            Handler::File => {
                let rel = token.params.first().ok_or_else(|| MusterError::Resolution {
                    token: raw.to_string(),
                    reason: "FILE needs a path".into(),
                })?;
                let path = self.agent_scoped_path(agent_id, rel).map_err(|reason| {
                    MusterError::Resolution {
                        token: raw.to_string(),
                        reason,
                    }
                })?;
                let content =
                    std::fs::read_to_string(&path).map_err(|e| MusterError::Resolution {
                        token: raw.to_string(),
                        reason: format!("read {}: {e}", path.display()),
                    })?;
                Ok(Value::String(content))
            }
            Handler::Fetch => {
                let url = token.params.first().ok_or_else(|| MusterError::Resolution {
                    token: raw.to_string(),
                    reason: "FETCH needs a URL".into(),
                })?;
                let resp = self.http.get(url).send().await.map_err(|e| {
                    MusterError::Resolution {
                        token: raw.to_string(),
                        reason: format!("fetch {url}: {e}"),
                    }
                })?;
                let body = resp.text().await.map_err(|e| MusterError::Resolution {
                    token: raw.to_string(),
                    reason: format!("read body from {url}: {e}"),
                })?;
                Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
            }
        }
    }

    /// Join a relative path under the agent's directory, rejecting anything
    /// that would escape it.
    fn agent_scoped_path(
        &self,
        agent_id: &str,
        rel: &str,
    ) -> std::result::Result<PathBuf, String> {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute() {
            return Err("absolute paths are not allowed".into());
        }
        for component in rel_path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(format!("path '{rel}' escapes the agent directory")),
            }
        }
        // The component check catches `..`; a symlink planted inside the
        // agent tree can still point elsewhere, so verify the resolved
        // path too.
        let root = self.data_dir.join(agent_id);
        let joined = root.join(rel_path);
        let resolved = joined
            .canonicalize()
            .map_err(|e| format!("resolve {}: {e}", joined.display()))?;
        let root = root
            .canonicalize()
            .map_err(|e| format!("resolve {}: {e}", root.display()))?;
        if !resolved.starts_with(&root) {
            return Err(format!("path '{rel}' escapes the agent directory"));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedCredentials(Option<Map<String, Value>>);

    #[async_trait]
    impl CredentialStore for FixedCredentials {
        async fn credentials(&self, _agent_id: &str, name: &str) -> Option<Map<String, Value>> {
            if name == "github" { self.0.clone() } else { None }
        }
    }

    struct FixedState(Map<String, Value>);

    #[async_trait]
    impl StateStore for FixedState {
        async fn state(&self, _agent_id: &str, _task_id: &str) -> Map<String, Value> {
            self.0.clone()
        }
    }

    fn resolver_with(
        creds: Option<Map<String, Value>>,
        state: Map<String, Value>,
        data_dir: PathBuf,
    ) -> ContextResolver {
        ContextResolver::new(
            Arc::new(FixedCredentials(creds)),
            Arc::new(FixedState(state)),
            data_dir,
        )
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn token_grammar() {
        let t = parse_token("$STATE:x$").unwrap();
        assert_eq!(t.name, "STATE");
        assert_eq!(t.params, vec!["x"]);
        assert_eq!(t.modifier, Modifier::Required);

        let t = parse_token("$CREDENTIALS:foo?$").unwrap();
        assert_eq!(t.modifier, Modifier::Optional);

        let t = parse_token("$CREDENTIALS:foo|{}$").unwrap();
        assert_eq!(t.modifier, Modifier::Default(json!({})));

        let t = parse_token("$FETCH[https://example.com,raw]$").unwrap();
        assert_eq!(t.params, vec!["https://example.com", "raw"]);

        // Literal default that is not valid JSON stays a string.
        let t = parse_token("$STATE:x|fallback$").unwrap();
        assert_eq!(t.modifier, Modifier::Default(json!("fallback")));

        assert!(parse_token("plain text").is_none());
        assert!(parse_token("price is $5.00$").is_none());
        assert!(parse_token("prefix $STATE:x$").is_none());
        assert!(parse_token("$$").is_none());
    }

    #[tokio::test]
    async fn state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver_with(None, obj(json!({"x": 5})), dir.path().to_path_buf());
        let out = r.resolve("a1", "t1", &json!({"a": "$STATE:x$"})).await.unwrap();
        assert_eq!(out, json!({"a": 5}));
    }

    #[tokio::test]
    async fn state_miss_is_null_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver_with(None, Map::new(), dir.path().to_path_buf());
        let out = r
            .resolve("a1", "t1", &json!({"a": "$STATE:missing$"}))
            .await
            .unwrap();
        assert_eq!(out, json!({"a": null}));
    }

    #[tokio::test]
    async fn credentials_modifier_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver_with(None, Map::new(), dir.path().to_path_buf());

        // No modifier: missing credential set is a hard error.
        let err = r.resolve("a1", "t1", &json!("$CREDENTIALS:foo$")).await;
        assert!(matches!(err, Err(MusterError::Resolution { .. })));

        // Optional: Null.
        let out = r.resolve("a1", "t1", &json!("$CREDENTIALS:foo?$")).await.unwrap();
        assert_eq!(out, Value::Null);

        // Default: the decoded default.
        let out = r.resolve("a1", "t1", &json!("$CREDENTIALS:foo|{}$")).await.unwrap();
        assert_eq!(out, json!({}));
    }

    #[tokio::test]
    async fn credentials_hit_resolves_to_map() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver_with(
            Some(obj(json!({"token": "abc"}))),
            Map::new(),
            dir.path().to_path_buf(),
        );
        let out = r.resolve("a1", "t1", &json!("$CREDENTIALS:github$")).await.unwrap();
        assert_eq!(out, json!({"token": "abc"}));
    }

    #[tokio::test]
    async fn embedded_tokens_are_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver_with(None, obj(json!({"x": 5})), dir.path().to_path_buf());
        let input = json!({"msg": "state is $STATE:x$ today"});
        let out = r.resolve("a1", "t1", &input).await.unwrap();
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn nested_structures_keep_shape() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver_with(None, obj(json!({"x": 5})), dir.path().to_path_buf());
        let out = r
            .resolve(
                "a1",
                "t1",
                &json!({"list": ["$STATE:x$", {"deep": "$STATE:x$"}], "n": 7}),
            )
            .await
            .unwrap();
        assert_eq!(out, json!({"list": [5, {"deep": 5}], "n": 7}));
    }

    #[tokio::test]
    async fn file_reads_are_agent_scoped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a1")).unwrap();
        std::fs::write(dir.path().join("a1/notes.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "nope").unwrap();

        let r = resolver_with(None, Map::new(), dir.path().to_path_buf());
        let out = r.resolve("a1", "t1", &json!("$FILE:notes.txt$")).await.unwrap();
        assert_eq!(out, json!("hello"));

        // Traversal outside the agent directory is rejected.
        let err = r.resolve("a1", "t1", &json!("$FILE:../secret.txt$")).await;
        assert!(matches!(err, Err(MusterError::Resolution { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_symlink_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a1")).unwrap();
        std::fs::write(dir.path().join("secret.txt"), "nope").unwrap();
        // A link inside the agent tree pointing above it.
        std::os::unix::fs::symlink(
            dir.path().join("secret.txt"),
            dir.path().join("a1/sneaky.txt"),
        )
        .unwrap();

        let r = resolver_with(None, Map::new(), dir.path().to_path_buf());
        let err = r.resolve("a1", "t1", &json!("$FILE:sneaky.txt$")).await;
        assert!(matches!(err, Err(MusterError::Resolution { .. })));
    }

    #[tokio::test]
    async fn unknown_handler_is_resolution_error() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver_with(None, Map::new(), dir.path().to_path_buf());
        let err = r.resolve("a1", "t1", &json!("$BOGUS:x$")).await;
        assert!(matches!(err, Err(MusterError::Resolution { .. })));
        // ...unless optional.
        let out = r.resolve("a1", "t1", &json!("$BOGUS:x?$")).await.unwrap();
        assert_eq!(out, Value::Null);
    }
}
