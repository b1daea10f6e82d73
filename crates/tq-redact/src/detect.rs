//! PII detection using pattern matching and a key denylist.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kind of personal data detected in a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiType {
    /// E-mail address
    Email,
    /// US social security number (ddd-dd-dddd)
    Ssn,
    /// Payment card number (Luhn-valid, 13-19 digits)
    CardNumber,
    /// Phone number with separators or country code
    Phone,
    /// JSON Web Token
    Jwt,
    /// Bearer credential or API key
    ApiKey,
}

impl std::fmt::Display for PiiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PiiType::Email => "email",
            PiiType::Ssn => "ssn",
            PiiType::CardNumber => "card_number",
            PiiType::Phone => "phone",
            PiiType::Jwt => "jwt",
            PiiType::ApiKey => "api_key",
        };
        write!(f, "{}", name)
    }
}

/// Detection pattern definition.
struct DetectionPattern {
    pii_type: PiiType,
    pattern: Lazy<Regex>,
}

// Pre-compiled detection patterns, most specific first.
static PATTERNS: [DetectionPattern; 5] = [
    DetectionPattern {
        pii_type: PiiType::Jwt,
        pattern: Lazy::new(|| {
            Regex::new(r"eyJ[A-Za-z0-9_-]+\.eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+").unwrap()
        }),
    },
    DetectionPattern {
        pii_type: PiiType::Email,
        pattern: Lazy::new(|| {
            Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap()
        }),
    },
    DetectionPattern {
        pii_type: PiiType::Ssn,
        pattern: Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap()),
    },
    DetectionPattern {
        pii_type: PiiType::Phone,
        pattern: Lazy::new(|| {
            Regex::new(r"(?:\+\d{1,3}[ .-]?)?\(?\b\d{3}\)?[ .-]\d{3}[ .-]\d{4}\b").unwrap()
        }),
    },
    DetectionPattern {
        pii_type: PiiType::ApiKey,
        pattern: Lazy::new(|| {
            Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/-]{16,}|AKIA[0-9A-Z]{16}|sk-(?:ant-)?[A-Za-z0-9_-]{20,}")
                .unwrap()
        }),
    },
];

// Candidate card numbers; confirmed with a Luhn check.
static CARD_CANDIDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d[ -]?){12,18}\d\b").unwrap());

/// Normalised property names that are never allowed.
const DENIED_KEYS: &[&str] = &[
    "email",
    "emailaddress",
    "phone",
    "phonenumber",
    "mobile",
    "mobilenumber",
    "ssn",
    "socialsecuritynumber",
    "password",
    "passwd",
    "secret",
    "token",
    "accesstoken",
    "refreshtoken",
    "apikey",
    "address",
    "streetaddress",
    "fullname",
    "firstname",
    "lastname",
    "dateofbirth",
    "dob",
    "creditcard",
    "cardnumber",
    "cvv",
    "iban",
    "passport",
    "ipaddress",
];

/// Fragments that make any key containing them a denied key.
const DENIED_FRAGMENTS: &[&str] = &["password", "email", "creditcard", "cardnumber", "secret"];

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' ' | '.'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Returns true if a property name is on the PII denylist.
pub fn is_denied_key(key: &str) -> bool {
    let normalized = normalize_key(key);
    DENIED_KEYS.contains(&normalized.as_str())
        || DENIED_FRAGMENTS.iter().any(|frag| normalized.contains(frag))
}

/// Pattern-based PII detector for string values.
#[derive(Clone, Default)]
pub struct PiiDetector {
    /// Custom patterns to detect.
    custom_patterns: Vec<(Regex, PiiType)>,
}

impl PiiDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a custom detection pattern.
    pub fn add_pattern(&mut self, pattern: Regex, pii_type: PiiType) {
        self.custom_patterns.push((pattern, pii_type));
    }

    /// Detect if a value contains personal data.
    pub fn detect(&self, value: &str) -> Option<PiiType> {
        for pattern in &PATTERNS {
            if pattern.pattern.is_match(value) {
                return Some(pattern.pii_type);
            }
        }

        if CARD_CANDIDATE
            .find_iter(value)
            .any(|m| luhn_valid(m.as_str()))
        {
            return Some(PiiType::CardNumber);
        }

        for (pattern, pii_type) in &self.custom_patterns {
            if pattern.is_match(value) {
                return Some(*pii_type);
            }
        }

        None
    }
}

/// Luhn checksum over the digits of `candidate`, ignoring separators.
pub fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
