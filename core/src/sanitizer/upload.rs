// File upload validation - OWASP A04/A08
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const MAX_FILENAME_CHARS: usize = 255;

static REPEATED_DOTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.{2,}").expect("valid regex"));

/// Extensions that are never accepted, whatever MIME type is declared.
const BLOCKED_EXTENSIONS: &[&str] = &[
    "exe", "bat", "cmd", "com", "scr", "msi", "dll", "vbs", "vbe", "js", "jse", "wsf", "ps1",
    "sh", "bash", "php", "phtml", "php5", "jsp", "asp", "aspx", "cgi", "pl", "py", "rb", "jar",
    "html", "htm", "svg", "hta",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadDescriptor {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPolicy {
    pub max_size_bytes: u64,
    /// Allowed MIME types and the extensions each may carry.
    pub allowed_types: HashMap<String, Vec<String>>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        let allowed_types = [
            ("image/jpeg", &["jpg", "jpeg"][..]),
            ("image/png", &["png"][..]),
            ("image/webp", &["webp"][..]),
            ("application/pdf", &["pdf"][..]),
        ]
        .into_iter()
        .map(|(mime, exts)| {
            (
                mime.to_string(),
                exts.iter().map(|e| e.to_string()).collect(),
            )
        })
        .collect();

        Self {
            max_size_bytes: 5 * 1024 * 1024,
            allowed_types,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub sanitized_filename: String,
}

impl UploadPolicy {
    pub fn validate(&self, upload: &UploadDescriptor) -> UploadValidation {
        let mut errors = Vec::new();
        let mime = upload.mime_type.trim().to_ascii_lowercase();

        let allowed_extensions = self.allowed_types.get(&mime);
        if allowed_extensions.is_none() {
            errors.push(format!("File type {} is not allowed", mime));
        }

        if upload.size_bytes == 0 {
            errors.push("File is empty".to_string());
        } else if upload.size_bytes > self.max_size_bytes {
            errors.push(format!(
                "File exceeds the maximum size of {} bytes",
                self.max_size_bytes
            ));
        }

        let lowered = upload.filename.to_ascii_lowercase();
        let mut segments = lowered.split('.');
        segments.next();
        let extensions: Vec<&str> = segments.collect();

        if extensions
            .iter()
            .any(|ext| BLOCKED_EXTENSIONS.contains(&ext.trim()))
        {
            errors.push("Executable or script files are not allowed".to_string());
        }

        match (extensions.last(), allowed_extensions) {
            (None, _) => errors.push("File has no extension".to_string()),
            (Some(ext), Some(allowed)) if !allowed.iter().any(|a| a == ext) => {
                errors.push(format!("Extension .{} does not match type {}", ext, mime));
            }
            _ => {}
        }

        UploadValidation {
            valid: errors.is_empty(),
            errors,
            sanitized_filename: sanitize_filename(&upload.filename),
        }
    }
}

// Sanitize filename to prevent path traversal
pub fn sanitize_filename(filename: &str) -> String {
    // Drop path components and reserved characters first
    let base = filename.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned = sanitize_filename::sanitize(base);

    let filtered: String = cleaned
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-')
        .collect();
    let collapsed = REPEATED_DOTS.replace_all(&filtered, ".");
    let trimmed = collapsed.trim_start_matches('.');

    let limited: String = trimmed.chars().take(MAX_FILENAME_CHARS).collect();
    if limited.is_empty() {
        "upload".to_string()
    } else {
        limited
    }
}
