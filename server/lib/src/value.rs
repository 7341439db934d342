//! Values and their syntaxes. A [`Value`] carries two parallel forms - the
//! presentation form as the client supplied it, and the normalised form the
//! matching rules operate on. Both are reference counted so that duplicating
//! an attribute container shares the underlying bytes.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The syntaxes the core understands. Each carries an implied equality
/// matching rule - `OctetString` has none, and falls back to byte-exact
/// comparison of the (identity) normalised form.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyntaxType {
    #[default]
    Utf8String = 0,
    Utf8StringInsensitive = 1,
    DistinguishedName = 2,
    Integer = 3,
    GeneralizedTime = 4,
    OctetString = 5,
}

/// A single attribute value. Equality, ordering and hashing are all over the
/// normalised form, which is what the equality matching rules demand.
#[derive(Debug, Clone)]
pub struct Value {
    pres: Arc<str>,
    norm: Arc<str>,
}

impl Value {
    /// Normalise a raw presentation value under the given syntax. Returns
    /// `None` when the raw form does not conform to the syntax.
    pub fn normalise(syntax: SyntaxType, raw: &str) -> Option<Self> {
        let norm = match syntax {
            SyntaxType::Utf8String => raw.to_string(),
            SyntaxType::Utf8StringInsensitive => case_ignore_normalise(raw),
            SyntaxType::DistinguishedName => dn_normalise(raw),
            SyntaxType::Integer => integer_normalise(raw)?,
            SyntaxType::GeneralizedTime => gentime_normalise(raw)?,
            SyntaxType::OctetString => raw.to_string(),
        };
        Some(Value {
            pres: Arc::from(raw),
            norm: Arc::from(norm.as_str()),
        })
    }

    pub fn pres(&self) -> &str {
        &self.pres
    }

    pub fn norm(&self) -> &str {
        &self.norm
    }
}

impl PartialEq for Value {
    fn eq(&self, rhs: &Value) -> bool {
        self.norm == rhs.norm
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.norm.hash(state)
    }
}

/// Case-ignore string matching: fold case and squash runs of whitespace, the
/// way directory string equality is defined.
fn case_ignore_normalise(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_ws = false;
    for c in raw.trim().chars() {
        if c.is_whitespace() {
            if !last_ws {
                out.push(' ');
            }
            last_ws = true;
        } else {
            last_ws = false;
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// Normalise a distinguished name to its canonical lookup form - case folded,
/// with whitespace around RDN separators and the attribute/value `=` removed.
/// Escaped separators within values are preserved.
pub fn dn_normalise(raw: &str) -> String {
    let mut rdns: Vec<String> = Vec::new();
    for rdn in split_unescaped(raw, ',') {
        let rdn = rdn.trim();
        if rdn.is_empty() {
            continue;
        }
        match rdn.split_once('=') {
            Some((a, v)) => {
                rdns.push(format!(
                    "{}={}",
                    case_ignore_normalise(a),
                    case_ignore_normalise(v)
                ));
            }
            None => rdns.push(case_ignore_normalise(rdn)),
        }
    }
    rdns.join(",")
}

fn split_unescaped(raw: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in raw.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&raw[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&raw[start..]);
    parts
}

fn integer_normalise(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);
    trimmed.parse::<i64>().ok().map(|i| i.to_string())
}

/// Generalized time in the form the stamper emits: fourteen digits and a
/// trailing `Z`. Anything else is rejected.
fn gentime_normalise(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_suffix(['Z', 'z'])?;
    if digits.len() != 14 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!("{}Z", digits))
}
