//! The three selector forms scripts may use against a [`Document`](super::Document).

use super::Element;

/// A parsed selector.
///
/// Only `#id`, `.class` and bare tag names are understood. Anything else parses
/// to [`Selector::Unsupported`], which matches nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// `#id`: at most one match, first in document order.
    Id(String),
    /// `.class`: every element whose class attribute contains the text.
    Class(String),
    /// `tag`: every element with that tag name, ignoring ASCII case.
    Tag(String),
    /// Syntax outside the supported subset.
    Unsupported,
}

impl Selector {
    /// Parses a selector string by prefix.
    ///
    /// Everything after `#` is taken as the id verbatim, since ids may hold
    /// characters such as `.` or `:` that would otherwise read as syntax.
    #[must_use]
    pub fn parse(selector: &str) -> Self {
        let selector = selector.trim();
        if let Some(id) = selector.strip_prefix('#') {
            if !id.is_empty() {
                return Self::Id(id.to_string());
            }
        } else if let Some(class) = selector.strip_prefix('.') {
            if is_name(class) {
                return Self::Class(class.to_string());
            }
        } else if is_name(selector) {
            return Self::Tag(selector.to_string());
        }
        Self::Unsupported
    }

    /// Returns `true` if the selector stops at the first match.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        matches!(self, Self::Id(_))
    }

    /// Tests a single element against the selector.
    ///
    /// Class matching is substring containment over the raw class string, not
    /// token matching: `.btn` matches `class="btn-primary"` and `.butt`
    /// matches `class="button"`.
    #[must_use]
    pub fn matches(&self, element: &Element) -> bool {
        match self {
            Self::Id(id) => element.id == *id,
            Self::Class(class) => element.class_name.contains(class.as_str()),
            Self::Tag(tag) => element.tag_name.eq_ignore_ascii_case(tag),
            Self::Unsupported => false,
        }
    }
}

/// Identifier-ish: non-empty, letters, digits, `-` and `_` only.
fn is_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}
