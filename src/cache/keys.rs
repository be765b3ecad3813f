//! Cache key definitions.
//!
//! Content identifiers arrive in several spellings (with or without hyphens);
//! `normalize_content_id` maps them onto one canonical key form.

use std::fmt;

const CONTENT_ID_LEN: usize = 32;
const SEPARATOR: char = '-';

/// Selects which TTL an entry receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyClass {
    /// Full page content.
    Content,
    /// Page metadata (title, parent, properties).
    PageInfo,
}

impl KeyClass {
    fn prefix(self) -> &'static str {
        match self {
            KeyClass::Content => "page",
            KeyClass::PageInfo => "page-info",
        }
    }
}

/// A normalized cache key together with its TTL class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    class: KeyClass,
    id: String,
}

impl CacheKey {
    pub fn new(class: KeyClass, raw_id: &str) -> Self {
        Self {
            class,
            id: normalize_content_id(raw_id),
        }
    }

    pub fn content(raw_id: &str) -> Self {
        Self::new(KeyClass::Content, raw_id)
    }

    pub fn page_info(raw_id: &str) -> Self {
        Self::new(KeyClass::PageInfo, raw_id)
    }

    /// Parse the `prefix:id` form produced by `Display`. The id part is
    /// normalized; anything without a known prefix yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        [KeyClass::PageInfo, KeyClass::Content]
            .into_iter()
            .find_map(|class| {
                raw.strip_prefix(class.prefix())
                    .and_then(|rest| rest.strip_prefix(':'))
                    .filter(|id| !id.is_empty())
                    .map(|id| Self::new(class, id))
            })
    }

    pub fn class(&self) -> KeyClass {
        self.class
    }

    /// The normalized content identifier.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class.prefix(), self.id)
    }
}

/// Canonicalize a content identifier.
///
/// Hyphens are stripped; when the remainder is exactly 32 hex digits it is
/// returned, otherwise the input comes back unchanged. Never fails, and
/// `normalize_content_id(normalize_content_id(x)) == normalize_content_id(x)`.
pub fn normalize_content_id(raw: &str) -> String {
    let stripped: String = raw.chars().filter(|c| *c != SEPARATOR).collect();
    if is_hex_id(&stripped) {
        stripped
    } else {
        raw.to_string()
    }
}

fn is_hex_id(candidate: &str) -> bool {
    candidate.len() == CONTENT_ID_LEN && candidate.chars().all(|c| c.is_ascii_hexdigit())
}
