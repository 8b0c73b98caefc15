//! Upload eligibility.
//!
//! The size ceiling is the API transport's object-creation limit.  The
//! transport sees the base64 form, so a file that is nominally small enough
//! can still be refused after encoding; rejecting here names the file up
//! front instead.  Oversize files are never chunked or turned into pointers.

use std::fmt;

use crate::config::UploadConfig;

use super::UploadCandidate;

/// Characters git hosts and common filesystems refuse in a file name.
const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// A single reason a file cannot be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Larger than the transport's object-creation limit.
    Oversize { name: String, size: u64, limit: u64 },
    /// Larger than the configured client-side maximum.
    ExceedsMaximum { name: String, size: u64, max: u64 },
    /// Contains `<>:"|?*` or a control character.
    InvalidCharacters { name: String },
    /// Empty, `.`, `..`, or more than one path segment.
    InvalidName { name: String },
}

impl Violation {
    pub fn name(&self) -> &str {
        match self {
            Self::Oversize { name, .. }
            | Self::ExceedsMaximum { name, .. }
            | Self::InvalidCharacters { name }
            | Self::InvalidName { name } => name,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oversize { name, size, limit } => write!(
                f,
                "File \"{name}\" is too large ({size} bytes, {}). The upload limit is {}.",
                human_size(*size),
                human_size(*limit)
            ),
            Self::ExceedsMaximum { name, size, max } => write!(
                f,
                "File \"{name}\" is too large ({size} bytes, {}). Maximum size is {}.",
                human_size(*size),
                human_size(*max)
            ),
            Self::InvalidCharacters { name } => {
                write!(f, "File \"{}\" contains invalid characters.", name.escape_default())
            }
            Self::InvalidName { name } => write!(f, "\"{name}\" is not a valid file name."),
        }
    }
}

/// Outcome of classifying one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Eligible,
    Rejected(Vec<Violation>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileClassifier {
    size_limit: u64,
    max_file_size: Option<u64>,
}

impl FileClassifier {
    pub fn new(size_limit: u64, max_file_size: Option<u64>) -> Self {
        Self {
            size_limit,
            max_file_size,
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.size_limit, config.max_file_size)
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    /// The most bytes any single file may carry: the transport limit, or the
    /// client-side maximum when that is stricter.
    pub fn byte_cap(&self) -> u64 {
        self.max_file_size
            .map_or(self.size_limit, |max| max.min(self.size_limit))
    }

    /// Strictly greater than the transport limit.
    pub fn exceeds_limit(&self, size: u64) -> bool {
        size > self.size_limit
    }

    /// Every violation for a file called `name` of `size` bytes.
    pub fn violations(&self, name: &str, size: u64) -> Vec<Violation> {
        let mut out = Vec::new();

        if self.exceeds_limit(size) {
            out.push(Violation::Oversize {
                name: name.to_string(),
                size,
                limit: self.size_limit,
            });
        } else if let Some(max) = self.max_file_size.filter(|max| size > *max) {
            out.push(Violation::ExceedsMaximum {
                name: name.to_string(),
                size,
                max,
            });
        }

        if !is_single_segment(name) {
            out.push(Violation::InvalidName {
                name: name.to_string(),
            });
        } else if name.chars().any(|c| FORBIDDEN_CHARS.contains(&c) || c < '\u{20}') {
            out.push(Violation::InvalidCharacters {
                name: name.to_string(),
            });
        }

        out
    }

    /// One human-readable message per violation; empty means eligible.
    pub fn validate(&self, candidate: &UploadCandidate) -> Vec<String> {
        self.violations(&candidate.name, candidate.size)
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    pub fn classify(&self, candidate: &UploadCandidate) -> Classification {
        let violations = self.violations(&candidate.name, candidate.size);
        if violations.is_empty() {
            Classification::Eligible
        } else {
            Classification::Rejected(violations)
        }
    }
}

/// A name must land directly in the destination directory: no separators
/// and no relative segments.
fn is_single_segment(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}

/// `1536` → `"1.50 KB"`, `3 * 1024^3` → `"3.00 GB"`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, size: u64) -> UploadCandidate {
        UploadCandidate {
            name: name.to_string(),
            size,
            content: super::super::Content::Bytes(bytes::Bytes::new()),
        }
    }

    #[test]
    fn limit_is_strict() {
        let c = FileClassifier::new(1000, None);
        assert!(!c.exceeds_limit(999));
        assert!(!c.exceeds_limit(1000));
        assert!(c.exceeds_limit(1001));
    }

    #[test]
    fn oversize_file_is_rejected() {
        let c = FileClassifier::new(1000, None);
        let messages = c.validate(&candidate("big.bin", 1001));
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("big.bin"));
        assert!(messages[0].contains("1001 bytes"));
        assert_eq!(c.classify(&candidate("ok.bin", 1000)), Classification::Eligible);
    }

    #[test]
    fn stricter_client_maximum() {
        let c = FileClassifier::new(1000, Some(10));
        let v = c.violations("a.txt", 11);
        assert_eq!(
            v,
            vec![Violation::ExceedsMaximum {
                name: "a.txt".into(),
                size: 11,
                max: 10
            }]
        );
        assert_eq!(c.byte_cap(), 10);
        assert_eq!(FileClassifier::new(1000, Some(5000)).byte_cap(), 1000);
        assert_eq!(FileClassifier::new(1000, None).byte_cap(), 1000);
        // Above both: only the transport limit is reported.
        let v = c.violations("a.txt", 5000);
        assert!(matches!(v.as_slice(), [Violation::Oversize { .. }]));
    }

    #[test]
    fn invalid_characters() {
        let c = FileClassifier::new(1000, None);
        for name in ["a<b", "a>b", "c:d", "q\"", "p|q", "what?", "star*", "tab\there", "nul\0"] {
            assert_eq!(
                c.violations(name, 1),
                vec![Violation::InvalidCharacters { name: name.into() }],
                "{name:?}"
            );
        }
        assert!(c.violations("résumé (final) #2.pdf", 1).is_empty());
    }

    #[test]
    fn reserved_names() {
        let c = FileClassifier::new(1000, None);
        for name in ["", ".", "..", "/", "//"] {
            assert!(matches!(c.violations(name, 1).as_slice(), [Violation::InvalidName { .. }]));
        }
    }

    #[test]
    fn names_with_separators_or_relative_segments() {
        let c = FileClassifier::new(1000, None);
        for name in ["../escape.txt", "sub/inner.txt", "a/../b", "./a.txt", "trailing/", "/lead.txt"] {
            assert_eq!(
                c.violations(name, 1),
                vec![Violation::InvalidName { name: name.into() }],
                "{name:?}"
            );
        }
        assert!(c.violations("..hidden", 1).is_empty());
        assert!(c.violations("v1..v2.diff", 1).is_empty());
    }

    #[test]
    fn multiple_violations_reported_together() {
        let c = FileClassifier::new(10, None);
        let v = c.violations("bad?.bin", 11);
        assert_eq!(v.len(), 2);
        assert!(v.iter().all(|v| v.name() == "bad?.bin"));
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(1023), "1023 B");
        assert_eq!(human_size(1536), "1.50 KB");
        assert_eq!(human_size(100 * 1024 * 1024), "100.00 MB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
