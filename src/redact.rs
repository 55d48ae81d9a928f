// Redaction of sensitive values before anything reaches storage
//
// Two layers: structural redaction replaces known high-risk fields by name, and an
// ordered list of pattern rules scrubs anything that was serialized to text.

use crate::config::RedactionConfig;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

pub const REDACTED: &str = "[REDACTED]";
pub const REDACTED_API_KEY: &str = "[REDACTED_API_KEY]";
pub const REDACTED_UUID: &str = "[REDACTED_UUID]";
pub const REDACTED_EMAIL: &str = "[REDACTED_EMAIL]";

/// Headers whose values are dropped outright
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "anthropic-api-key",
    "cookie",
    "set-cookie",
];

/// Top-level fields replaced wholesale wherever they appear
const SENSITIVE_FIELDS: &[&str] = &["user_id"];

/// (parent object, child field) pairs replaced wholesale
const SENSITIVE_NESTED_FIELDS: &[(&str, &str)] = &[
    ("account", "uuid"),
    ("account", "email"),
    ("account", "email_address"),
    ("account", "full_name"),
    ("organization", "uuid"),
    ("organization", "name"),
];

// Builtin rules, in application order: (name, pattern, replacement).
// Credential-bearing fields first, then identifier fields, URL query parameters,
// bearer tokens, vendor key shapes, and finally the generic UUID / email shapes.
const BUILTIN_RULES: &[(&str, &str, &str)] = &[
    (
        "json credential field",
        r#"(?i)("(?:x-api-key|authorization|api_key|apikey|access_token|refresh_token|session_token|token|password|secret)"\s*:\s*)"(?:[^"\\]|\\.)*""#,
        r#"${1}"[REDACTED]""#,
    ),
    (
        "json identifier field",
        r#"(?i)("(?:user_id|userid|account_uuid|accountuuid|account_id|organization_uuid|organizationuuid|org_id|session_id|sessionid|device_id|deviceid|email|email_address|emailaddress|full_name|fullname)"\s*:\s*)"(?:[^"\\]|\\.)*""#,
        r#"${1}"[REDACTED]""#,
    ),
    (
        "url query parameter",
        r#"(?i)([?&](?:api_key|apikey|key|token|access_token|user_id|account_id|account_uuid|org_id|organization_uuid|session_id|device_id|email)=)[^&\s"'#]+"#,
        "${1}[REDACTED]",
    ),
    (
        "bearer token",
        r"(?i)(bearer\s+)[A-Za-z0-9\-._~+/]+=*",
        "${1}[REDACTED]",
    ),
    ("anthropic api key", r"sk-ant-[a-zA-Z0-9\-_]{20,}", REDACTED_API_KEY),
    ("openai project key", r"sk-proj-[a-zA-Z0-9\-_]{20,}", REDACTED_API_KEY),
    ("openai api key", r"sk-[a-zA-Z0-9]{20,}", REDACTED_API_KEY),
    ("aws access key", r"AKIA[0-9A-Z]{16}", REDACTED_API_KEY),
    ("github token", r"gh[pousr]_[a-zA-Z0-9]{36}", REDACTED_API_KEY),
    ("slack token", r"xox[baprs]-[a-zA-Z0-9\-]{10,}", REDACTED_API_KEY),
    ("google api key", r"AIza[0-9A-Za-z\-_]{35}", REDACTED_API_KEY),
    (
        "uuid",
        r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
        REDACTED_UUID,
    ),
    (
        "email address",
        r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(?:\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}",
        REDACTED_EMAIL,
    ),
];

/// A single compiled pattern → replacement rule
#[derive(Clone, Debug)]
pub struct RedactionRule {
    pub name: String,
    regex: Regex,
    replacement: String,
}

impl RedactionRule {
    fn apply(&self, text: &str) -> String {
        self.regex
            .replace_all(text, self.replacement.as_str())
            .into_owned()
    }
}

/// Ordered, immutable rule set; cheap to share behind an `Arc`
#[derive(Clone, Debug)]
pub struct Redactor {
    rules: Vec<RedactionRule>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(&RedactionConfig::default())
    }
}

impl Redactor {
    /// Build the builtin rules followed by user-supplied ones.
    /// A pattern that fails to compile is skipped with a warning.
    pub fn new(config: &RedactionConfig) -> Self {
        let mut rules = Vec::new();

        for (name, pattern, replacement) in BUILTIN_RULES {
            push_rule(&mut rules, name, pattern, replacement);
        }

        for (idx, pattern) in config.patterns.iter().enumerate() {
            if pattern.trim().is_empty() {
                continue;
            }
            push_rule(&mut rules, &format!("custom pattern {}", idx + 1), pattern, REDACTED);
        }

        for keyword in &config.keywords {
            if keyword.trim().is_empty() {
                continue;
            }
            let pattern = format!(r"(?i){}", regex::escape(keyword));
            push_rule(&mut rules, &format!("keyword '{}'", keyword), &pattern, REDACTED);
        }

        Self { rules }
    }

    pub fn rules(&self) -> &[RedactionRule] {
        &self.rules
    }

    /// Apply every rule in order. Idempotent: placeholders never match a rule
    /// in a way that changes them.
    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();
        for rule in &self.rules {
            if rule.regex.is_match(&result) {
                result = rule.apply(&result);
            }
        }
        result
    }

    /// Structural redaction of known fields, then pattern redaction of every string
    pub fn redact_value(&self, value: &Value) -> Value {
        let mut value = value.clone();
        self.redact_value_in_place(&mut value);
        value
    }

    pub fn redact_value_in_place(&self, value: &mut Value) {
        match value {
            Value::String(s) => {
                *s = self.redact(s);
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.redact_value_in_place(item);
                }
            }
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if SENSITIVE_FIELDS.contains(&key.as_str()) && !child.is_null() {
                        *child = Value::String(REDACTED.to_string());
                        continue;
                    }
                    if let Some(inner) = child.as_object_mut() {
                        for (parent, field) in SENSITIVE_NESTED_FIELDS {
                            if key == parent {
                                if let Some(v) = inner.get_mut(*field) {
                                    if !v.is_null() {
                                        *v = Value::String(REDACTED.to_string());
                                    }
                                }
                            }
                        }
                    }
                    self.redact_value_in_place(child);
                }
            }
            _ => {} // numbers, bools, null carry nothing to scrub
        }
    }

    /// Credential headers are replaced outright; other values get text redaction
    pub fn redact_headers(&self, headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                let lower = name.to_ascii_lowercase();
                let value = if SENSITIVE_HEADERS.contains(&lower.as_str()) {
                    REDACTED.to_string()
                } else {
                    self.redact(value)
                };
                (name.clone(), value)
            })
            .collect()
    }
}

fn push_rule(rules: &mut Vec<RedactionRule>, name: &str, pattern: &str, replacement: &str) {
    match Regex::new(pattern) {
        Ok(regex) => rules.push(RedactionRule {
            name: name.to_string(),
            regex,
            replacement: replacement.to_string(),
        }),
        Err(e) => {
            tracing::warn!("skipping redaction rule '{}': invalid pattern: {}", name, e);
        }
    }
}
