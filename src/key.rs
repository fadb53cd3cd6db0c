//! Normalization of caller-supplied identifiers into storage keys.

use crate::Error;

/// Separator appended to keys by [`KeySanitizer::separated`] unless configured otherwise.
pub const DEFAULT_SEPARATOR: char = '#';

/// Turns arbitrary identifiers into keys that are safe to hand to a backend.
///
/// The plain sanitizer only replaces `/`, `\` and spaces with underscores. The separated
/// variant additionally drops control characters (NUL included) and terminates every key with a
/// reserved separator, so that caller keys can never collide with keys the cache itself uses
/// (like the tag index) which never carry that suffix.
///
/// Sanitization is not injective: `"a b"` and `"a_b"` map to the same key.
///
/// #### Example
/// ```
/// # use tagcache::key::KeySanitizer;
/// let plain = KeySanitizer::plain();
/// assert_eq!(plain.sanitize("foo\\bar snafu/stfu"), "foo_bar_snafu_stfu");
///
/// let separated = KeySanitizer::separated('#').unwrap();
/// assert_eq!(separated.sanitize("user 42\0"), "user_42#");
/// assert_eq!(separated.unsanitize("user_42#"), "user_42");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeySanitizer {
    separator: Option<char>,
}

impl KeySanitizer {
    /// Sanitizer that only substitutes path separators and spaces.
    pub const fn plain() -> Self {
        Self { separator: None }
    }

    /// Sanitizer that strips control characters and appends `separator` to every key.
    ///
    /// Fails if `separator` could be produced by sanitization itself (the `_` replacement, the
    /// replaced characters, whitespace or control characters).
    pub fn separated(separator: char) -> Result<Self, Error> {
        if is_replaced(separator)
            || separator == '_'
            || separator.is_whitespace()
            || separator.is_control()
        {
            return Err(Error::Config(format!(
                "{separator:?} cannot be used as key separator"
            )));
        }
        Ok(Self {
            separator: Some(separator),
        })
    }

    pub(crate) const fn default_separated() -> Self {
        Self {
            separator: Some(DEFAULT_SEPARATOR),
        }
    }

    /// The reserved separator, if any.
    pub fn separator(&self) -> Option<char> {
        self.separator
    }

    /// Sanitize an identifier.
    pub fn sanitize(&self, id: &str) -> String {
        let Some(separator) = self.separator else {
            return id.chars().map(replace).collect();
        };
        let mut key: String = id
            .chars()
            .filter(|c| !c.is_control())
            .map(|c| if c == separator { '_' } else { replace(c) })
            .collect();
        key.push(separator);
        key
    }

    /// Strip the separator suffix from a key produced by [`sanitize`](Self::sanitize).
    pub fn unsanitize<'a>(&self, key: &'a str) -> &'a str {
        match self.separator {
            Some(separator) => key.strip_suffix(separator).unwrap_or(key),
            None => key,
        }
    }
}

fn is_replaced(c: char) -> bool {
    matches!(c, '/' | '\\' | ' ')
}

fn replace(c: char) -> char {
    if is_replaced(c) {
        '_'
    } else {
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_replaces_troublesome_characters() {
        let s = KeySanitizer::plain();
        assert_eq!(s.sanitize("foo"), "foo");
        assert_eq!(s.sanitize("foo+-!@"), "foo+-!@");
        assert_eq!(s.sanitize("foo/bar"), "foo_bar");
        assert_eq!(s.sanitize("foo\\bar"), "foo_bar");
        assert_eq!(s.sanitize("foo bar"), "foo_bar");
        assert_eq!(s.sanitize("foo\\bar snafu/stfu"), "foo_bar_snafu_stfu");
    }

    #[test]
    fn separated_strips_controls_and_appends_suffix() {
        let s = KeySanitizer::separated('#').unwrap();
        assert_eq!(s.sanitize("a\0b\nc"), "abc#");
        assert_eq!(s.sanitize("a#b"), "a_b#");
        assert_eq!(s.sanitize("__tag_index__"), "__tag_index__#");
        assert_eq!(s.unsanitize("a_b#"), "a_b");
        assert_eq!(s.unsanitize("no-suffix"), "no-suffix");
    }

    #[test]
    fn rejects_separators_sanitization_can_produce() {
        for c in ['_', '/', '\\', ' ', '\t', '\0'] {
            assert!(matches!(KeySanitizer::separated(c), Err(Error::Config(_))));
        }
        assert!(KeySanitizer::separated('|').is_ok());
    }
}
