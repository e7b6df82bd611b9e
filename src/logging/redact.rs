//! Scrubbing of secrets from log lines, and of cloud identifiers from exported bundles.

use super::LogLine;
use crate::tunnel::{TunnelEntry, TunnelKey};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;

/// Maximum line length before truncation
const MAX_LINE_LENGTH: usize = 2048;

const REDACTED: &str = "[REDACTED]";

static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // SSH private key blocks
        Regex::new(r"(?s)-----BEGIN[^-]*PRIVATE KEY-----.*?-----END[^-]*PRIVATE KEY-----").unwrap(),
        Regex::new(r"(?s)-----BEGIN[^-]*KEY-----.*?-----END[^-]*KEY-----").unwrap(),
        // Google OAuth access and refresh tokens
        Regex::new(r"ya29\.[A-Za-z0-9_-]+").unwrap(),
        Regex::new(r"1//[A-Za-z0-9_-]{20,}").unwrap(),
        // JWTs (base64.base64.base64)
        Regex::new(r"eyJ[A-Za-z0-9_-]+\.eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+").unwrap(),
        // Authorization headers
        Regex::new(r"(?i)authorization\s*:\s*(bearer|basic)\s+[^\s]+").unwrap(),
        Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/-]{20,}=*").unwrap(),
        // key=value secrets
        Regex::new(r#"(?i)(password|passwd|pwd|secret|token|api[_-]?key|private[_-]?key|passphrase|auth[_-]?token|access[_-]?token|refresh[_-]?token)\s*[:=]\s*["']?[^\s"']+["']?"#).unwrap(),
        // Long base64 blobs
        Regex::new(r"[A-Za-z0-9+/]{64,}={0,2}").unwrap(),
    ]
});

/// Object keys whose values are dropped wholesale
const SENSITIVE_KEYS: &[&str] = &["password", "secret", "token", "key", "passphrase", "auth", "credential"];

/// Instance names, project ids and zones are all made of these
static IDENTIFIER_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9-]+").unwrap());

/// Redact secrets from `input` and truncate it to a bounded length
pub fn sanitize(input: &str) -> String {
    let mut result = SENSITIVE_PATTERNS
        .iter()
        .fold(input.to_string(), |text, pattern| pattern.replace_all(&text, REDACTED).into_owned());

    if result.len() > MAX_LINE_LENGTH {
        let mut cut = MAX_LINE_LENGTH;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        result.truncate(cut);
        result.push_str("... [truncated]");
    }
    result
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_KEYS.iter().any(|s| key.contains(s))
}

/// [`sanitize`] every string in a JSON tree and blank values under sensitive keys
pub(crate) fn sanitize_json(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize(s)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_json).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive_key(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        sanitize_json(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Replaces known targets, projects and zones with stable `[kind-N]` placeholders.
///
/// Only whole identifier tokens inside string values are replaced, in a single
/// pass, so object keys, unrelated words and inserted placeholders are never
/// rewritten.
#[derive(Debug, Default)]
pub struct TargetRedactor {
    placeholders: HashMap<String, String>,
    counts: HashMap<&'static str, usize>,
}

impl TargetRedactor {
    /// Collect identifiers from live tunnels and from everything the log mentions
    pub fn collect(tunnels: &[TunnelEntry], logs: &[LogLine]) -> Self {
        let mut redactor = Self::default();

        for entry in tunnels {
            redactor.insert("target", entry.key.target());
        }
        for line in logs {
            if let Some(key) = line.tunnel.as_deref().and_then(|k| k.parse::<TunnelKey>().ok()) {
                redactor.insert("target", key.target());
            }
            if let Some(target) = detail(line, "target") {
                redactor.insert("target", target);
            }
        }

        for entry in tunnels {
            redactor.insert("project", &entry.project);
        }
        for project in logs.iter().filter_map(|line| detail(line, "project")) {
            redactor.insert("project", project);
        }

        for entry in tunnels {
            redactor.insert("zone", &entry.zone);
        }
        for zone in logs.iter().filter_map(|line| detail(line, "zone")) {
            redactor.insert("zone", zone);
        }

        redactor
    }

    fn insert(&mut self, kind: &'static str, value: &str) {
        if value.is_empty() || self.placeholders.contains_key(value) {
            return;
        }
        let count = self.counts.entry(kind).or_insert(0);
        *count += 1;
        self.placeholders
            .insert(value.to_string(), format!("[{}-{}]", kind, count));
    }

    pub fn len(&self) -> usize {
        self.placeholders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placeholders.is_empty()
    }

    pub fn redact_str(&self, text: &str) -> String {
        if self.is_empty() {
            return text.to_string();
        }
        IDENTIFIER_TOKEN
            .replace_all(text, |caps: &Captures| {
                self.placeholders
                    .get(&caps[0])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    pub fn redact_json(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact_str(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_json(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_json(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn detail<'a>(line: &'a LogLine, field: &str) -> Option<&'a str> {
    line.details.as_ref()?.get(field)?.as_str()
}
