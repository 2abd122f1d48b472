use crate::cancel::CancelToken;
use crate::config::RunnerPolicy;
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LlmError {
    #[error("rate limited")]
    RateLimited,
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("authentication failed")]
    AuthFailed,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

impl LlmError {
    /// Whether another attempt at the same session can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited | LlmError::Timeout(_) | LlmError::Transport(_)
        )
    }
}

pub trait LlmClient: Send + Sync {
    fn send(&self, query: &str, model: &str, timeout: Duration) -> Result<String, LlmError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Answered { text: String, attempts: u32 },
    Failed { error: LlmError, attempts: u32 },
    Cancelled,
}

/// One LLM session with bounded retries on transient errors.
pub fn send_with_retry(
    client: &dyn LlmClient,
    query: &str,
    model: &str,
    policy: &RunnerPolicy,
    cancel: &CancelToken,
) -> SessionOutcome {
    let timeout = Duration::from_secs(policy.session_timeout_secs.max(1));
    let max_attempts = policy.max_session_attempts.max(1);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return SessionOutcome::Cancelled;
        }
        attempt += 1;
        match client.send(query, model, timeout) {
            Ok(text) => {
                return SessionOutcome::Answered {
                    text,
                    attempts: attempt,
                }
            }
            Err(error) if error.is_transient() && attempt < max_attempts => {
                debug!(attempt, %error, "transient llm failure, retrying");
                thread::sleep(Duration::from_millis(
                    policy.retry_backoff_ms * u64::from(attempt),
                ));
            }
            Err(error) => {
                warn!(attempts = attempt, %error, "llm session failed");
                return SessionOutcome::Failed {
                    error,
                    attempts: attempt,
                };
            }
        }
    }
}

/// OpenAI-compatible chat-completions client.
pub struct HttpLlmClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl HttpLlmClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    pub fn from_policy(policy: &RunnerPolicy) -> Result<Self> {
        let api_key = std::env::var(&policy.llm_api_key_env)
            .map_err(|_| anyhow!("missing API key: set {}", policy.llm_api_key_env))?;
        Self::new(policy.llm_endpoint.clone(), api_key)
    }
}

impl LlmClient for HttpLlmClient {
    fn send(&self, query: &str, model: &str, timeout: Duration) -> Result<String, LlmError> {
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": query}],
        });
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(timeout)
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_http_failure(status.as_u16(), &text));
        }
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::Transport(format!("malformed response body: {}", e)))?;
        value
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::Transport("response has no message content".to_string()))
    }
}

fn classify_http_failure(status: u16, body: &str) -> LlmError {
    match status {
        429 => LlmError::RateLimited,
        401 | 403 => LlmError::AuthFailed,
        400 | 404 if body.to_ascii_lowercase().contains("model") => {
            LlmError::InvalidModel(body.chars().take(200).collect())
        }
        408 | 504 => LlmError::Timeout(Duration::from_secs(0)),
        _ => LlmError::Transport(format!("http {}: {}", status, body.chars().take(200).collect::<String>())),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers every query by scoring the candidate named in the profile
    /// highest. The first `fail_calls` calls fail with `fail_with`; the next
    /// `garbage_calls` answer with text no parser accepts.
    pub(crate) struct OracleLlm {
        pub calls: AtomicUsize,
        pub fail_calls: usize,
        pub fail_with: LlmError,
        pub garbage_calls: usize,
        pub delay: Duration,
        pub queries: Mutex<Vec<String>>,
    }

    impl OracleLlm {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_calls: 0,
                fail_with: LlmError::AuthFailed,
                garbage_calls: 0,
                delay: Duration::from_millis(0),
                queries: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing_first(n: usize, error: LlmError) -> Self {
            Self {
                fail_calls: n,
                fail_with: error,
                ..Self::new()
            }
        }

        pub(crate) fn garbage_first(n: usize) -> Self {
            Self {
                garbage_calls: n,
                ..Self::new()
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn oracle_answer(query: &str) -> String {
        let profile = query
            .split("Profile:")
            .nth(1)
            .and_then(|rest| rest.split("Candidates:").next())
            .unwrap_or("");
        let candidates = query.split("Candidates:").nth(1).unwrap_or("");
        let mut lines = Vec::new();
        for line in candidates.lines() {
            let Some((num, name)) = line.split_once(": ") else {
                continue;
            };
            let name = name.trim();
            let hit = profile.contains(&format!("{}:", name));
            lines.push(format!("{}: {}", num.trim(), if hit { "0.95" } else { "0.05" }));
        }
        lines.join("\n")
    }

    impl LlmClient for OracleLlm {
        fn send(&self, query: &str, _model: &str, _timeout: Duration) -> Result<String, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            if let Ok(mut q) = self.queries.lock() {
                q.push(query.to_string());
            }
            if n < self.fail_calls {
                return Err(self.fail_with.clone());
            }
            if n - self.fail_calls < self.garbage_calls {
                return Ok("I would rather not rank these candidates.".to_string());
            }
            Ok(oracle_answer(query))
        }
    }

    fn fast_policy(attempts: u32) -> RunnerPolicy {
        RunnerPolicy {
            max_session_attempts: attempts,
            retry_backoff_ms: 0,
            ..RunnerPolicy::default()
        }
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let llm = OracleLlm::failing_first(2, LlmError::RateLimited);
        let out = send_with_retry(&llm, "q", "m", &fast_policy(3), &CancelToken::new());
        assert!(matches!(out, SessionOutcome::Answered { attempts: 3, .. }), "{:?}", out);
    }

    #[test]
    fn retries_are_bounded() {
        let llm = OracleLlm::failing_first(10, LlmError::Timeout(Duration::from_secs(1)));
        let out = send_with_retry(&llm, "q", "m", &fast_policy(3), &CancelToken::new());
        assert!(matches!(out, SessionOutcome::Failed { attempts: 3, .. }), "{:?}", out);
        assert_eq!(llm.call_count(), 3);
    }

    #[test]
    fn auth_failures_are_not_retried() {
        let llm = OracleLlm::failing_first(10, LlmError::AuthFailed);
        let out = send_with_retry(&llm, "q", "m", &fast_policy(3), &CancelToken::new());
        assert_eq!(
            out,
            SessionOutcome::Failed {
                error: LlmError::AuthFailed,
                attempts: 1
            }
        );
    }

    #[test]
    fn cancelled_sessions_do_not_call_the_client() {
        let llm = OracleLlm::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(
            send_with_retry(&llm, "q", "m", &fast_policy(3), &cancel),
            SessionOutcome::Cancelled
        );
        assert_eq!(llm.call_count(), 0);
    }

    #[test]
    fn http_failures_map_to_error_kinds() {
        assert_eq!(classify_http_failure(429, ""), LlmError::RateLimited);
        assert_eq!(classify_http_failure(401, ""), LlmError::AuthFailed);
        assert!(matches!(
            classify_http_failure(404, "unknown model foo"),
            LlmError::InvalidModel(_)
        ));
        assert!(classify_http_failure(500, "boom").is_transient());
    }
}
