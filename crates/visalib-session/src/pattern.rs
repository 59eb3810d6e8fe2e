//! Resource search expressions.
//!
//! `find` takes a VISA-style expression and matches it against resource
//! names, case-insensitively and over the whole name:
//!
//! | Token      | Meaning                                          |
//! |------------|--------------------------------------------------|
//! | `?`        | any one character                                |
//! | `*`        | zero or more of the preceding character or group |
//! | `+`        | one or more of the preceding character or group  |
//! | `[list]`   | any one character in `list` (ranges allowed)     |
//! | `[^list]`  | any one character not in `list`                  |
//! | `a\|b`     | either expression                                |
//! | `(expr)`   | grouping                                         |
//! | `\c`       | the literal character `c`                        |
//!
//! Everything else matches itself, so `GPIB?*INSTR` finds every GPIB
//! instrument and `?*` finds everything. Attribute filters (`{...}`) are
//! rejected with [`Error::InvalidPattern`].

use regex::Regex;
use visalib_core::error::{Error, Result};

/// A compiled search expression.
#[derive(Debug, Clone)]
pub struct ResourcePattern {
    source: String,
    regex: Regex,
}

impl ResourcePattern {
    /// Compile `pattern`.
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::InvalidPattern("empty expression".into()));
        }
        let translated = translate(pattern)?;
        let regex = Regex::new(&translated)
            .map_err(|e| Error::InvalidPattern(format!("{pattern}: {e}")))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Whether `name` matches the whole expression.
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    /// The expression as given.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn translate(pattern: &str) -> Result<String> {
    let mut out = String::with_capacity(pattern.len() * 2 + 8);
    out.push_str("(?i)^(?:");

    let mut chars = pattern.chars().peekable();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        if in_class {
            match c {
                ']' => {
                    in_class = false;
                    out.push(']');
                }
                '-' => out.push('-'),
                '\\' => push_escaped(&mut out, escaped_char(pattern, chars.next())?),
                other => push_escaped(&mut out, other),
            }
            continue;
        }

        match c {
            '?' => out.push('.'),
            '*' | '+' | '|' | '(' | ')' => out.push(c),
            '[' => {
                in_class = true;
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('^');
                }
            }
            '\\' => push_escaped(&mut out, escaped_char(pattern, chars.next())?),
            '{' | '}' => {
                return Err(Error::InvalidPattern(format!(
                    "{pattern}: attribute expressions are not supported"
                )));
            }
            other => push_escaped(&mut out, other),
        }
    }

    if in_class {
        return Err(Error::InvalidPattern(format!("{pattern}: unterminated '['")));
    }

    out.push_str(")$");
    Ok(out)
}

fn escaped_char(pattern: &str, next: Option<char>) -> Result<char> {
    next.ok_or_else(|| Error::InvalidPattern(format!("{pattern}: trailing '\\'")))
}

fn push_escaped(out: &mut String, c: char) {
    let mut buf = [0u8; 4];
    out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, name: &str) -> bool {
        ResourcePattern::compile(pattern).unwrap().matches(name)
    }

    #[test]
    fn question_star_matches_everything() {
        assert!(matches("?*", "GPIB0::2::INSTR"));
        assert!(matches("?*", "TCPIP0::10.0.0.5::5025::SOCKET"));
    }

    #[test]
    fn interface_filter() {
        assert!(matches("GPIB?*INSTR", "GPIB0::2::INSTR"));
        assert!(matches("GPIB?*INSTR", "GPIB1::14::3::INSTR"));
        assert!(!matches("GPIB?*INSTR", "GPIB0::INTFC"));
        assert!(!matches("GPIB?*INSTR", "ASRL1::INSTR"));
    }

    #[test]
    fn match_is_case_insensitive() {
        assert!(matches("gpib?*instr", "GPIB0::2::INSTR"));
    }

    #[test]
    fn match_covers_the_whole_name() {
        assert!(!matches("GPIB0", "GPIB0::2::INSTR"));
        assert!(!matches("2::INSTR", "GPIB0::2::INSTR"));
    }

    #[test]
    fn dots_are_literal() {
        assert!(matches("TCPIP0::10.0.0.5::?*", "TCPIP0::10.0.0.5::inst0::INSTR"));
        assert!(!matches("TCPIP0::10.0.0.5::?*", "TCPIP0::10a0b0c5::inst0::INSTR"));
    }

    #[test]
    fn character_classes() {
        assert!(matches("GPIB[0-1]::?*", "GPIB1::5::INSTR"));
        assert!(!matches("GPIB[0-1]::?*", "GPIB2::5::INSTR"));
        assert!(matches("GPIB[^0]::?*", "GPIB3::5::INSTR"));
        assert!(!matches("GPIB[^0]::?*", "GPIB0::5::INSTR"));
    }

    #[test]
    fn alternation_and_groups() {
        let p = ResourcePattern::compile("(GPIB|ASRL)?*INSTR").unwrap();
        assert!(p.matches("GPIB0::2::INSTR"));
        assert!(p.matches("ASRL1::INSTR"));
        assert!(!p.matches("TCPIP0::host::inst0::INSTR"));
    }

    #[test]
    fn plus_repeats_preceding() {
        assert!(matches("GPIB0::1+::INSTR", "GPIB0::11::INSTR"));
        assert!(!matches("GPIB0::1+::INSTR", "GPIB0::::INSTR"));
    }

    #[test]
    fn escaped_metacharacter_is_literal() {
        assert!(matches("ASRL\\?", "ASRL?"));
        assert!(!matches("ASRL\\?", "ASRL1"));
    }

    #[test]
    fn no_match_is_not_an_error() {
        let p = ResourcePattern::compile("NOMATCH::*").unwrap();
        assert!(!p.matches("GPIB0::2::INSTR"));
        assert_eq!(p.as_str(), "NOMATCH::*");
    }

    #[test]
    fn invalid_expressions() {
        for bad in ["", "*GPIB", "GPIB[0", "ASRL\\", "?*{VI_ATTR_TMO_VALUE>5}", "(GPIB"] {
            let err = ResourcePattern::compile(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidPattern(_)), "{bad}: {err:?}");
        }
    }
}
