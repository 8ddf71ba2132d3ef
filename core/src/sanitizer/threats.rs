// Injection detection - OWASP A03: Injection Prevention
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    Xss,
    SqlInjection,
    PathTraversal,
    CommandInjection,
    LdapInjection,
}

impl ThreatKind {
    pub const ALL: [ThreatKind; 5] = [
        ThreatKind::Xss,
        ThreatKind::SqlInjection,
        ThreatKind::PathTraversal,
        ThreatKind::CommandInjection,
        ThreatKind::LdapInjection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatKind::Xss => "xss",
            ThreatKind::SqlInjection => "sql_injection",
            ThreatKind::PathTraversal => "path_traversal",
            ThreatKind::CommandInjection => "command_injection",
            ThreatKind::LdapInjection => "ldap_injection",
        }
    }

    fn patterns(&self) -> &'static RegexSet {
        match self {
            ThreatKind::Xss => &XSS_PATTERNS,
            ThreatKind::SqlInjection => &SQL_INJECTION_PATTERNS,
            ThreatKind::PathTraversal => &PATH_TRAVERSAL_PATTERNS,
            ThreatKind::CommandInjection => &COMMAND_INJECTION_PATTERNS,
            ThreatKind::LdapInjection => &LDAP_INJECTION_PATTERNS,
        }
    }

    pub fn matches(&self, input: &str) -> bool {
        self.patterns().is_match(input)
    }
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn pattern_set(patterns: &[&str]) -> RegexSet {
    RegexSet::new(patterns).expect("threat patterns are valid regexes")
}

static XSS_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    pattern_set(&[
        r"(?i)<\s*/?\s*script\b",
        r"(?i)\b(?:java|vb)script\s*:",
        r"(?i)<[^>]*\bon[a-z]+\s*=",
        r"(?i)\bon(?:load|error|click|dblclick|mouseover|mouseout|mouseenter|focus|blur|submit|change|input|keydown|keyup|keypress|toggle|animationstart)\s*=",
        r"(?i)<\s*(?:iframe|frame|frameset|object|embed|applet|meta|base|link|style|svg|math|form)\b",
        r"(?i)\bexpression\s*\(",
        r"(?i)data\s*:\s*text/html",
        r"(?i)\bsrcdoc\s*=",
    ])
});

static SQL_INJECTION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    pattern_set(&[
        r"(?i)\bunion\s+(?:all\s+)?select\b",
        r"(?i)\bselect\s+(?:\*|count\s*\(|[\w.]+\s*(?:,\s*[\w.]+\s*)+)\s*from\b",
        r"(?i)\bselect\s+[\w.*]+\s+from\s+[\w.]+\s+where\b",
        r"(?i)\binsert\s+into\b",
        r"(?i)\bupdate\s+\w+\s+set\b",
        r"(?i)\bdelete\s+from\b",
        r"(?i)\b(?:drop|truncate|alter)\s+(?:table|database|schema)\b",
        r"(?i)\bexec(?:ute)?\s*\(|\bexec\s+(?:master|xp_|sp_)",
        r"(?i)\b(?:xp_cmdshell|sp_executesql|information_schema|pg_sleep|waitfor\s+delay|benchmark\s*\()",
        r"(?i)'\s*(?:or|and)\s+(?:'|\d|true|false)",
        r"(?i)\b(?:or|and)\s+\d+\s*=\s*\d+",
        r"'\s*(?:--|#|/\*)",
        r"--\s*$",
        r"/\*[\s\S]*\*/",
        r"(?i);\s*(?:drop|delete|insert|update|select|shutdown)\b",
    ])
});

static PATH_TRAVERSAL_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    pattern_set(&[
        r"\.\.[/\\]",
        r"[/\\]\.\.(?:$|[/\\])",
        r"(?i)%2e%2e",
        r"(?i)\.\.%2f|\.\.%5c",
        r"(?i)%2e\.|\.%2e",
        r"(?i)%252e|%252f|%255c",
        r"(?i)%c0%ae|%c0%af|%c1%9c",
        r"(?i)(?:^|[/\\])(?:etc/passwd|etc/shadow|windows/system32|boot\.ini)",
    ])
});

static COMMAND_INJECTION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    pattern_set(&[
        r"(?i)(?:;|&&|\|\||\||`|\$\()\s*(?:ls|cat|rm|mv|cp|wget|curl|nc|ncat|netcat|bash|sh|zsh|python|perl|ruby|php|chmod|chown|whoami|id|uname|ping|nslookup|powershell|cmd)\b",
        r"\$\([^)]*\)",
        r"`[^`]+`",
        r"\$\{[^}]*\}",
        r"(?i)/bin/(?:ba)?sh\b|\bcmd\.exe\b|\bpowershell\.exe\b",
        r">\s*/dev/(?:tcp|udp)/",
    ])
});

static LDAP_INJECTION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    pattern_set(&[
        r"\*\s*\)\s*\(",
        r"\)\s*\(\s*[|&!]",
        r"\(\s*[|&!]\s*\(",
        r"\*\s*\)\s*\)",
        r"(?i)\(\s*(?:objectclass|cn|uid|mail|userpassword)\s*=\s*\*",
        r"\\00|\x00",
    ])
});

static SCRIPT_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<\s*script\b[^>]*>.*?<\s*/\s*script\s*>").expect("valid regex"));

/// Every threat family that matches `input`, in declaration order.
pub fn detect_threats(input: &str) -> Vec<ThreatKind> {
    ThreatKind::ALL
        .iter()
        .copied()
        .filter(|kind| kind.matches(input))
        .collect()
}

/// Drop whole `<script>...</script>` blocks, including their bodies.
pub fn strip_script_blocks(input: &str) -> String {
    SCRIPT_BLOCK.replace_all(input, "").into_owned()
}

/// Payload preview safe for logs: control characters removed, capped.
pub fn excerpt(input: &str, max_chars: usize) -> String {
    let cleaned: String = input.chars().filter(|c| !c.is_control()).collect();
    if cleaned.chars().count() > max_chars {
        let mut cut: String = cleaned.chars().take(max_chars).collect();
        cut.push_str("...");
        cut
    } else {
        cleaned
    }
}
