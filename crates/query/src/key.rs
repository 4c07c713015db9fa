//! Cache keys.

use std::fmt;

/// Identifies one logical dataset in the cache.
///
/// An ordered tuple of string segments; equal keys are the same dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

impl From<&str> for QueryKey {
    fn from(s: &str) -> Self {
        Self(vec![s.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_compare_by_segments() {
        let a = QueryKey::new(["presence", "7"]);
        let b = QueryKey::new(vec!["presence".to_string(), "7".to_string()]);
        assert_eq!(a, b);
        assert!(QueryKey::new(["presence", "1"]) < a);
        assert_eq!(a.to_string(), "[presence, 7]");
    }
}
