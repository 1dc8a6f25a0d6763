//! PII detection and reversible tokenization.
//!
//! Sensitive values in the context are replaced with stable tokens before
//! user code sees them; the host keeps the reverse map and restores the
//! original values in the result. The same input value always maps to the
//! same token within one execution.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PiiKind {
    Email,
    Card,
    Ssn,
    Phone,
    ApiKey,
}

impl PiiKind {
    fn label(self) -> &'static str {
        match self {
            PiiKind::Email => "EMAIL",
            PiiKind::Card => "CARD",
            PiiKind::Ssn => "SSN",
            PiiKind::Phone => "PHONE",
            PiiKind::ApiKey => "KEY",
        }
    }
}

pub struct PiiScrubber {
    patterns: Vec<(PiiKind, Regex)>,
}

impl Default for PiiScrubber {
    fn default() -> Self {
        Self::new()
    }
}

impl PiiScrubber {
    pub fn new() -> Self {
        // Order matters: longer or more specific patterns first so a card
        // number is not half-eaten by the phone matcher.
        let patterns = vec![
            (
                PiiKind::Email,
                Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap(),
            ),
            (
                PiiKind::Card,
                Regex::new(r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b").unwrap(),
            ),
            (PiiKind::Ssn, Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap()),
            (
                PiiKind::Phone,
                Regex::new(r"\+?\d{1,2}[-. ]?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}\b").unwrap(),
            ),
            (
                PiiKind::ApiKey,
                Regex::new(r"\b(?:sk|pk|rk|api)[-_][A-Za-z0-9_-]{12,}\b").unwrap(),
            ),
        ];
        Self { patterns }
    }

    /// Scrub a context value. Returns the scrubbed copy and the
    /// token-to-original reverse map.
    pub fn scrub(&self, value: &Value) -> (Value, HashMap<String, String>) {
        let mut state = ScrubState::default();
        let scrubbed = self.scrub_value(value, &mut state);
        (scrubbed, state.reverse)
    }

    fn scrub_value(&self, value: &Value, state: &mut ScrubState) -> Value {
        match value {
            Value::String(text) => Value::String(self.scrub_text(text, state)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.scrub_value(item, state))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| (key.clone(), self.scrub_value(item, state)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn scrub_text(&self, text: &str, state: &mut ScrubState) -> String {
        let mut current = text.to_string();
        for (kind, pattern) in &self.patterns {
            if !pattern.is_match(&current) {
                continue;
            }
            current = pattern
                .replace_all(&current, |caps: &regex::Captures<'_>| {
                    state.token_for(*kind, &caps[0])
                })
                .into_owned();
        }
        current
    }

    /// Put original values back into a result.
    pub fn restore(value: &Value, reverse: &HashMap<String, String>) -> Value {
        if reverse.is_empty() {
            return value.clone();
        }
        match value {
            Value::String(text) => {
                let mut restored = text.clone();
                for (token, original) in reverse {
                    if restored.contains(token.as_str()) {
                        restored = restored.replace(token.as_str(), original);
                    }
                }
                Value::String(restored)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| Self::restore(item, reverse))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| (key.clone(), Self::restore(item, reverse)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[derive(Default)]
struct ScrubState {
    counters: HashMap<PiiKind, usize>,
    /// original -> token, so repeated values share a token.
    forward: HashMap<String, String>,
    /// token -> original, returned to the host.
    reverse: HashMap<String, String>,
}

impl ScrubState {
    fn token_for(&mut self, kind: PiiKind, original: &str) -> String {
        if let Some(token) = self.forward.get(original) {
            return token.clone();
        }
        let counter = self.counters.entry(kind).or_insert(0);
        *counter += 1;
        let token = format!("[{}_{}]", kind.label(), counter);
        self.forward.insert(original.to_string(), token.clone());
        self.reverse.insert(token.clone(), original.to_string());
        token
    }
}
