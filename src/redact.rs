//! Credential scrubbing for CLI output returned over HTTP

use std::sync::LazyLock;

use regex::Regex;

/// Replacement text for anything that looks like a secret
pub const REDACTED: &str = "[redacted]";

/// `Bearer <token>` in any case and with any whitespace; the scheme word is kept
static BEARER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(bearer)\s+\S+").expect("invalid bearer pattern"));

/// `sk-...` style API keys
static API_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bsk-[A-Za-z0-9_-]{8,}").expect("invalid api key pattern"));

/// Removes known secrets and credential-shaped tokens from text
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    /// Build a redactor for the given literal secrets. Empty values are skipped.
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.trim().is_empty())
            .collect();
        // Longest first so a secret containing another is replaced whole
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        Self { secrets }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }

        if BEARER_TOKEN.is_match(&out) {
            out = BEARER_TOKEN
                .replace_all(&out, format!("${{1}} {}", REDACTED).as_str())
                .into_owned();
        }
        if API_KEY.is_match(&out) {
            out = API_KEY.replace_all(&out, REDACTED).into_owned();
        }
        out
    }
}
