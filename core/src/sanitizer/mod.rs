//! Threat detection and encoding for untrusted strings and JSON payloads.
//!
//! Every string goes through the same steps: strip null bytes, normalize
//! Unicode (NFKC, so full-width lookalikes reach the detectors as ASCII),
//! trim, detect threats, encode (or allow-list tags), truncate. Detection
//! never blocks on its own; callers decide what to do with the findings.

pub mod threats;
pub mod upload;

pub use threats::{detect_threats, excerpt, ThreatKind};
pub use upload::{sanitize_filename, UploadDescriptor, UploadPolicy, UploadValidation};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

use crate::config::SanitizerSettings;

static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\s*(/?)\s*([a-zA-Z][a-zA-Z0-9]*)\b[^>]*>").expect("valid regex"));

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizeOptions {
    pub allow_html: bool,
    pub allowed_tags: Vec<String>,
    pub max_length: Option<usize>,
    pub strip_null_bytes: bool,
    pub normalize_unicode: bool,
    pub trim_whitespace: bool,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self {
            allow_html: false,
            allowed_tags: Vec::new(),
            max_length: None,
            strip_null_bytes: true,
            normalize_unicode: true,
            trim_whitespace: true,
        }
    }
}

impl SanitizeOptions {
    pub fn rich_text(tags: &[&str]) -> Self {
        Self {
            allow_html: true,
            allowed_tags: tags.iter().map(|t| t.to_ascii_lowercase()).collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SanitizeResult {
    pub sanitized: String,
    pub was_modified: bool,
    pub detected_threats: Vec<ThreatKind>,
}

/// Result of sanitizing a structured payload; threats keyed by dotted path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectSanitization {
    pub sanitized: Value,
    pub was_modified: bool,
    pub threats: BTreeMap<String, Vec<ThreatKind>>,
    /// Original text of every flagged field, keyed like `threats`.
    pub flagged_inputs: BTreeMap<String, String>,
}

impl ObjectSanitization {
    pub fn has_threats(&self) -> bool {
        !self.threats.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct InputSanitizer {
    default_max_length: usize,
}

impl Default for InputSanitizer {
    fn default() -> Self {
        Self::new(&SanitizerSettings::default())
    }
}

impl InputSanitizer {
    pub fn new(settings: &SanitizerSettings) -> Self {
        Self {
            default_max_length: settings.max_length,
        }
    }

    pub fn sanitize(&self, input: &str, field_name: &str, options: &SanitizeOptions) -> SanitizeResult {
        let mut value = if options.strip_null_bytes {
            input.replace('\0', "")
        } else {
            input.to_string()
        };

        if options.normalize_unicode {
            value = value.nfkc().collect();
        }

        if options.trim_whitespace {
            value = value.trim().to_string();
        }

        let detected_threats = detect_threats(&value);
        if !detected_threats.is_empty() {
            debug!(field = %field_name, threats = ?detected_threats, "Threats detected in input");
        }

        value = if options.allow_html {
            sanitize_html_allowlist(&value, &options.allowed_tags)
        } else {
            encode_html(&value)
        };

        let max_length = options.max_length.unwrap_or(self.default_max_length);
        value = truncate_chars(&value, max_length);

        SanitizeResult {
            was_modified: value != input,
            sanitized: value,
            detected_threats,
        }
    }

    /// Sanitize every string leaf of `payload`, keeping its shape.
    pub fn sanitize_value(&self, payload: &Value, options: &SanitizeOptions) -> ObjectSanitization {
        let mut findings = Findings::default();
        let sanitized = self.walk(payload, "", options, &mut findings);

        ObjectSanitization {
            sanitized,
            was_modified: findings.was_modified,
            threats: findings.threats,
            flagged_inputs: findings.flagged_inputs,
        }
    }

    fn walk(
        &self,
        value: &Value,
        path: &str,
        options: &SanitizeOptions,
        findings: &mut Findings,
    ) -> Value {
        match value {
            Value::String(s) => {
                let field = if path.is_empty() { "$" } else { path };
                let result = self.sanitize(s, field, options);
                if !result.detected_threats.is_empty() {
                    findings.threats.insert(field.to_string(), result.detected_threats);
                    findings.flagged_inputs.insert(field.to_string(), s.clone());
                }
                findings.was_modified |= result.was_modified;
                Value::String(result.sanitized)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        self.walk(item, &join_path(path, &i.to_string()), options, findings)
                    })
                    .collect(),
            ),
            Value::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (key, item) in fields {
                    let child = self.walk(item, &join_path(path, key), options, findings);
                    out.insert(key.clone(), child);
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }
}

#[derive(Default)]
struct Findings {
    was_modified: bool,
    threats: BTreeMap<String, Vec<ThreatKind>>,
    flagged_inputs: BTreeMap<String, String>,
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

// HTML/XML encoding to prevent XSS
pub fn encode_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Keep only allow-listed tags, stripped of every attribute; encode the rest.
pub fn sanitize_html_allowlist(input: &str, allowed_tags: &[String]) -> String {
    let input = threats::strip_script_blocks(input);
    let mut out = String::with_capacity(input.len());
    let mut last = 0;

    for caps in TAG.captures_iter(&input) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&encode_html(&input[last..whole.start()]));

        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        let name = caps
            .get(2)
            .map(|m| m.as_str().to_ascii_lowercase())
            .unwrap_or_default();

        if allowed_tags.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
            out.push('<');
            if closing {
                out.push('/');
            }
            out.push_str(&name);
            out.push('>');
        } else {
            out.push_str(&encode_html(whole.as_str()));
        }
        last = whole.end();
    }
    out.push_str(&encode_html(&input[last..]));
    out
}

/// Cap at `max_chars` without leaving half an entity at the end.
fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut cut: String = input.chars().take(max_chars).collect();
    if let Some(amp) = cut.rfind('&') {
        if !cut[amp..].contains(';') {
            cut.truncate(amp);
        }
    }
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sanitizer() -> InputSanitizer {
        InputSanitizer::default()
    }

    #[test]
    fn test_script_tag_is_flagged_and_neutralised() {
        let result = sanitizer().sanitize(
            "<script>alert(1)</script>",
            "notes",
            &SanitizeOptions::default(),
        );

        assert!(result.detected_threats.contains(&ThreatKind::Xss));
        assert!(result.was_modified);
        assert!(!result.sanitized.contains("<script"));
        assert_eq!(result.sanitized, "&lt;script&gt;alert(1)&lt;/script&gt;");
    }

    #[test]
    fn test_benign_input_is_untouched() {
        let result = sanitizer().sanitize("O+ donor in Dhaka", "notes", &SanitizeOptions::default());

        assert_eq!(result.sanitized, "O+ donor in Dhaka");
        assert!(!result.was_modified);
        assert!(result.detected_threats.is_empty());
    }

    #[test]
    fn test_null_bytes_unicode_and_whitespace() {
        let result = sanitizer().sanitize("  ab\0c\u{FF1C}  ", "name", &SanitizeOptions::default());
        // Full-width '<' folds to ASCII before encoding
        assert_eq!(result.sanitized, "abc&lt;");
        assert!(result.was_modified);

        let raw = SanitizeOptions {
            strip_null_bytes: false,
            normalize_unicode: false,
            trim_whitespace: false,
            ..SanitizeOptions::default()
        };
        let untouched = sanitizer().sanitize(" a\0 ", "name", &raw);
        assert_eq!(untouched.sanitized, " a\0 ");
    }

    #[test]
    fn test_max_length_truncates_after_encoding() {
        let options = SanitizeOptions {
            max_length: Some(7),
            ..SanitizeOptions::default()
        };
        assert_eq!(sanitizer().sanitize("abcdefghij", "f", &options).sanitized, "abcdefg");
        // A cut inside an entity drops the partial entity
        assert_eq!(sanitizer().sanitize("abcde<z", "f", &options).sanitized, "abcde");
    }

    #[test]
    fn test_allowlisted_tags_survive_without_attributes() {
        let options = SanitizeOptions::rich_text(&["b", "i", "p"]);
        let result = sanitizer().sanitize(
            "<p onclick=\"steal()\">Hi <b>there</b><script>x()</script><img src=x></p>",
            "bio",
            &options,
        );

        assert_eq!(result.sanitized, "<p>Hi <b>there</b>&lt;img src=x&gt;</p>");
        assert!(result.detected_threats.contains(&ThreatKind::Xss));
    }

    #[test]
    fn test_object_sanitization_keys_threats_by_path() {
        let payload = json!({
            "a": "' OR 1=1 --",
            "donor": { "city": "Dhaka", "notes": ["fine", "<script>x</script>"] },
            "units": 2,
            "urgent": true
        });
        let result = sanitizer().sanitize_value(&payload, &SanitizeOptions::default());

        assert_eq!(result.threats.get("a"), Some(&vec![ThreatKind::SqlInjection]));
        assert_eq!(result.threats.get("donor.notes.1"), Some(&vec![ThreatKind::Xss]));
        assert!(!result.threats.contains_key("donor.city"));
        assert_eq!(result.sanitized["units"], 2);
        assert_eq!(result.sanitized["urgent"], true);
        assert_eq!(result.sanitized["donor"]["city"], "Dhaka");
        assert!(result.was_modified);
        assert!(result.has_threats());
    }

    #[test]
    fn test_flagged_input_kept_for_dotted_keys() {
        let payload = json!({ "contact.note": "<script>alert(1)</script>" });
        let result = sanitizer().sanitize_value(&payload, &SanitizeOptions::default());

        assert!(result.threats.contains_key("contact.note"));
        assert_eq!(
            result.flagged_inputs.get("contact.note").map(String::as_str),
            Some("<script>alert(1)</script>")
        );
        assert_eq!(result.flagged_inputs.len(), result.threats.len());
    }

    #[test]
    fn test_clean_object_is_unmodified() {
        let payload = json!({ "blood_group": "O+", "city": "Dhaka", "units": 1 });
        let result = sanitizer().sanitize_value(&payload, &SanitizeOptions::default());

        assert_eq!(result.sanitized, payload);
        assert!(!result.was_modified);
        assert!(!result.has_threats());
    }
}
