//! External changelog cookies.
//!
//! A cookie records, per domain, the last CSN a consumer has read from
//! every replica:
//!
//! ```text
//! dc=example,dc=com:0000018b1c3a2f0000010000 0000018b1c3a2f1000020003;o=other:;
//! ```
//!
//! Each domain contributes `<base dn>:<csn> <csn>...;` with domains sorted
//! by base DN and CSNs by replica id, so equal cookies format identically.
//! In the base DN, `\` and `;` are written as `\\` and `\;`. The base DN
//! ends at the last `:` of its segment since CSNs never contain one.

use dsrepl_core::{CsnParseError, ServerState};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Per-domain read positions in the external changelog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EclCookie {
    domains: BTreeMap<String, ServerState>,
}

/// Errors parsing a cookie.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CookieError {
    /// A segment has no `:` separator.
    #[error("malformed cookie segment {0:?}")]
    Malformed(String),

    /// A segment has an empty base DN.
    #[error("cookie segment {0:?} has no base DN")]
    EmptyBaseDn(String),

    /// A domain appears twice.
    #[error("domain {0:?} appears more than once")]
    DuplicateDomain(String),

    /// A CSN does not parse.
    #[error("bad CSN in cookie for {base_dn:?}: {source}")]
    InvalidCsn {
        /// Domain whose state failed to parse.
        base_dn: String,
        /// Underlying parse failure.
        #[source]
        source: CsnParseError,
    },
}

impl EclCookie {
    /// An empty cookie: read every domain from its oldest record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State recorded for `base_dn`.
    #[must_use]
    pub fn domain(&self, base_dn: &str) -> Option<&ServerState> {
        self.domains.get(base_dn)
    }

    /// Replaces the state of `base_dn`.
    pub fn set_domain(&mut self, base_dn: impl Into<String>, state: ServerState) {
        self.domains.insert(base_dn.into(), state);
    }

    /// Mutable state of `base_dn`, created empty if absent.
    pub fn domain_mut(&mut self, base_dn: &str) -> &mut ServerState {
        self.domains.entry(base_dn.to_string()).or_default()
    }

    /// `(base DN, state)` pairs sorted by base DN.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServerState)> {
        self.domains.iter().map(|(dn, state)| (dn.as_str(), state))
    }

    /// Domains named by the cookie, sorted.
    pub fn base_dns(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    /// True if the cookie names no domain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl FromIterator<(String, ServerState)> for EclCookie {
    fn from_iter<I: IntoIterator<Item = (String, ServerState)>>(iter: I) -> Self {
        Self {
            domains: iter.into_iter().collect(),
        }
    }
}

/// Parses the textual cookie form. An empty or blank string is an empty
/// cookie.
///
/// # Errors
///
/// Returns a [`CookieError`] describing the first bad segment.
pub fn parse_cookie(text: &str) -> Result<EclCookie, CookieError> {
    let mut domains = BTreeMap::new();
    for segment in split_segments(text) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (base_dn, csns) = segment
            .rsplit_once(':')
            .ok_or_else(|| CookieError::Malformed(segment.to_string()))?;
        let base_dn = unescape_base_dn(base_dn.trim())
            .ok_or_else(|| CookieError::Malformed(segment.to_string()))?;
        if base_dn.is_empty() {
            return Err(CookieError::EmptyBaseDn(segment.to_string()));
        }
        let state = ServerState::from_str(csns).map_err(|source| CookieError::InvalidCsn {
            base_dn: base_dn.to_string(),
            source,
        })?;
        if domains.contains_key(&base_dn) {
            return Err(CookieError::DuplicateDomain(base_dn));
        }
        domains.insert(base_dn, state);
    }
    Ok(EclCookie { domains })
}

/// Splits `text` at every `;` that is not escaped.
fn split_segments(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            ';' => {
                segments.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&text[start..]);
    segments
}

fn escape_base_dn(base_dn: &str) -> String {
    let mut out = String::with_capacity(base_dn.len());
    for c in base_dn.chars() {
        if matches!(c, '\\' | ';') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `None` if the text ends in a lone `\`.
fn unescape_base_dn(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next()?);
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Formats a cookie; [`parse_cookie`] reads it back unchanged.
#[must_use]
pub fn format_cookie(cookie: &EclCookie) -> String {
    cookie.to_string()
}

impl fmt::Display for EclCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (base_dn, state) in &self.domains {
            write!(f, "{}:{state};", escape_base_dn(base_dn))?;
        }
        Ok(())
    }
}

impl FromStr for EclCookie {
    type Err = CookieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_cookie(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsrepl_core::Csn;
    use proptest::prelude::*;

    #[test]
    fn empty_cookie() {
        assert!(parse_cookie("").unwrap().is_empty());
        assert!(parse_cookie("  ").unwrap().is_empty());
        assert_eq!(format_cookie(&EclCookie::new()), "");
    }

    #[test]
    fn format_is_sorted_and_stable() {
        let mut cookie = EclCookie::new();
        cookie.domain_mut("o=zeta").update(Csn::new(2, 0, 1));
        cookie.domain_mut("dc=example,dc=com").update(Csn::new(7, 1, 2));
        cookie.domain_mut("dc=example,dc=com").update(Csn::new(5, 0, 1));
        cookie.set_domain("o=empty", ServerState::new());

        let text = format_cookie(&cookie);
        assert_eq!(
            text,
            format!(
                "dc=example,dc=com:{} {};o=empty:;o=zeta:{};",
                Csn::new(5, 0, 1),
                Csn::new(7, 1, 2),
                Csn::new(2, 0, 1)
            )
        );
        assert_eq!(parse_cookie(&text).unwrap(), cookie);
    }

    #[test]
    fn base_dn_may_contain_colons() {
        let text = format!("cn=a:b,o=x:{};", Csn::new(1, 0, 1));
        let cookie = parse_cookie(&text).unwrap();
        assert!(cookie.domain("cn=a:b,o=x").is_some());
    }

    #[test]
    fn separators_in_base_dn_are_escaped() {
        let mut cookie = EclCookie::new();
        cookie.domain_mut("o=a;b").update(Csn::new(5, 0, 1));
        cookie.domain_mut("cn=x\\,y,o=c").update(Csn::new(6, 0, 1));
        cookie.set_domain("o=d\\", ServerState::new());

        let text = format_cookie(&cookie);
        assert_eq!(
            text,
            format!(
                "cn=x\\\\,y,o=c:{};o=a\\;b:{};o=d\\\\:;",
                Csn::new(6, 0, 1),
                Csn::new(5, 0, 1)
            )
        );
        assert_eq!(parse_cookie(&text).unwrap(), cookie);
        assert!(matches!(
            parse_cookie("o=a\\"),
            Err(CookieError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            parse_cookie("dc=example"),
            Err(CookieError::Malformed(_))
        ));
        assert!(matches!(
            parse_cookie(":0000"),
            Err(CookieError::EmptyBaseDn(_))
        ));
        assert!(matches!(
            parse_cookie("o=x:nothex;"),
            Err(CookieError::InvalidCsn { .. })
        ));
        assert!(matches!(
            parse_cookie("o=x:;o=x:;"),
            Err(CookieError::DuplicateDomain(_))
        ));
    }

    proptest! {
        #[test]
        fn parse_of_format_is_identity(
            domains in proptest::collection::btree_map(
                "(dc|o|ou)=[a-z;:\\\\]{1,8}",
                proptest::collection::vec((0u64..u64::MAX, 0u16..8, 1u16..6), 0..4),
                0..4,
            )
        ) {
            let cookie: EclCookie = domains
                .into_iter()
                .map(|(dn, csns)| {
                    let state = csns.into_iter().map(|(t, s, r)| Csn::new(t, s, r)).collect();
                    (dn, state)
                })
                .collect();
            let text = format_cookie(&cookie);
            prop_assert_eq!(parse_cookie(&text).unwrap(), cookie);
        }
    }
}
