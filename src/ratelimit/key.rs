//! Limit key composition.

/// Separator placed between key parts.
const PART_SEPARATOR: char = '_';

/// A key that identifies what a rate limit applies to.
///
/// The key is composed of ordered parts, e.g. caller address, resource and
/// method. The limiter itself treats keys as opaque strings; this type just
/// builds them consistently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LimitKey {
    /// Key parts, in the order they were added
    pub parts: Vec<String>,
}

impl LimitKey {
    /// Create an empty limit key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a part to the key.
    pub fn with_part(mut self, part: impl Into<String>) -> Self {
        self.parts.push(part.into());
        self
    }

    /// Convert the key to the string used for counter lookups.
    pub fn to_string_key(&self) -> String {
        self.parts.join(&PART_SEPARATOR.to_string())
    }
}

impl<S: Into<String>> FromIterator<S> for LimitKey {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            parts: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl std::fmt::Display for LimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
