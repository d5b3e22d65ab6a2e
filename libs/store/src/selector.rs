//! Label selectors.
//!
//! Textual syntax, comma separated, all terms must hold:
//!
//! ```text
//! env=prod            key equals value (also `==`)
//! tier!=cache         key absent or not equal
//! region in (eu,us)   key present with one of the values
//! zone notin (a,b)    key absent or none of the values
//! gpu                 key present
//! !spot               key absent
//! ```
//!
//! Evaluation is pure: a selector only ever looks at the label map it is
//! given.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error parsing a selector.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid selector term '{term}': {message}")]
pub struct SelectorError {
    pub term: String,
    pub message: String,
}

impl SelectorError {
    fn new(term: &str, message: impl Into<String>) -> Self {
        Self {
            term: term.to_string(),
            message: message.into(),
        }
    }
}

/// A single selector term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, values) => labels.get(k).is_some_and(|v| values.contains(v)),
            Requirement::NotIn(k, values) => !labels.get(k).is_some_and(|v| values.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Requirement::Equals(k, v) => write!(f, "{k}={v}"),
            Requirement::NotEquals(k, v) => write!(f, "{k}!={v}"),
            Requirement::In(k, values) => write!(f, "{k} in ({})", join(values)),
            Requirement::NotIn(k, values) => write!(f, "{k} notin ({})", join(values)),
            Requirement::Exists(k) => write!(f, "{k}"),
            Requirement::DoesNotExist(k) => write!(f, "!{k}"),
        }
    }
}

/// A conjunction of requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Selector matching everything.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector requiring `key=value`.
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            requirements: vec![Requirement::Equals(key.into(), value.into())],
        }
    }

    /// Selector requiring `key` to be present.
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            requirements: vec![Requirement::Exists(key.into())],
        }
    }

    /// Add a requirement.
    pub fn and(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Parse the textual form.
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let mut requirements = Vec::new();
        for term in split_terms(input)? {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            requirements.push(parse_term(term)?);
        }
        Ok(Self { requirements })
    }

    /// Whether `labels` satisfies every requirement.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let terms: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&terms.join(","))
    }
}

impl std::str::FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for LabelSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LabelSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Split on commas that are not inside parentheses.
fn split_terms(input: &str) -> Result<Vec<&str>, SelectorError> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| SelectorError::new(input, "unbalanced ')'"))?;
            }
            ',' if depth == 0 => {
                terms.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::new(input, "unbalanced '('"));
    }
    terms.push(&input[start..]);
    Ok(terms)
}

fn parse_term(term: &str) -> Result<Requirement, SelectorError> {
    if let Some(key) = term.strip_prefix('!') {
        let key = key.trim();
        validate_key(term, key)?;
        return Ok(Requirement::DoesNotExist(key.to_string()));
    }

    if let Some((key, value)) = term.split_once("!=") {
        let (key, value) = (key.trim(), value.trim());
        validate_key(term, key)?;
        validate_value(term, value)?;
        return Ok(Requirement::NotEquals(key.to_string(), value.to_string()));
    }

    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        let (key, value) = (key.trim(), value.trim());
        validate_key(term, key)?;
        validate_value(term, value)?;
        return Ok(Requirement::Equals(key.to_string(), value.to_string()));
    }

    let mut parts = term.splitn(2, char::is_whitespace);
    let key = parts.next().unwrap_or_default().trim();
    let rest = parts.next().map(str::trim).unwrap_or_default();

    if rest.is_empty() {
        validate_key(term, key)?;
        return Ok(Requirement::Exists(key.to_string()));
    }

    validate_key(term, key)?;
    let (op, set) = rest
        .split_once(char::is_whitespace)
        .map(|(op, set)| (op, set.trim()))
        .or_else(|| rest.find('(').map(|i| (rest[..i].trim(), &rest[i..])))
        .ok_or_else(|| SelectorError::new(term, "expected 'in (...)' or 'notin (...)'"))?;
    let values = parse_set(term, set)?;

    match op {
        "in" => Ok(Requirement::In(key.to_string(), values)),
        "notin" => Ok(Requirement::NotIn(key.to_string(), values)),
        other => Err(SelectorError::new(term, format!("unknown operator '{other}'"))),
    }
}

fn parse_set(term: &str, set: &str) -> Result<BTreeSet<String>, SelectorError> {
    let inner = set
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| SelectorError::new(term, "value set must be parenthesized"))?;
    let mut values = BTreeSet::new();
    for value in inner.split(',') {
        let value = value.trim();
        validate_value(term, value)?;
        values.insert(value.to_string());
    }
    if values.is_empty() {
        return Err(SelectorError::new(term, "value set must not be empty"));
    }
    Ok(values)
}

fn validate_key(term: &str, key: &str) -> Result<(), SelectorError> {
    if key.is_empty() {
        return Err(SelectorError::new(term, "empty key"));
    }
    let (prefix, name) = match key.rsplit_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        let ok = !prefix.is_empty()
            && prefix.len() <= 253
            && prefix
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.');
        if !ok {
            return Err(SelectorError::new(term, format!("invalid key prefix '{prefix}'")));
        }
    }
    if name.is_empty() || name.len() > 63 || !name.bytes().all(is_label_char) {
        return Err(SelectorError::new(term, format!("invalid key name '{name}'")));
    }
    Ok(())
}

fn validate_value(term: &str, value: &str) -> Result<(), SelectorError> {
    if value.len() > 63 || !value.bytes().all(is_label_char) {
        return Err(SelectorError::new(term, format!("invalid value '{value}'")));
    }
    Ok(())
}

fn is_label_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.'
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case("", true)]
    #[case("env=prod", true)]
    #[case("env==prod", true)]
    #[case("env=dev", false)]
    #[case("env!=dev", true)]
    #[case("region in (eu, us)", true)]
    #[case("region notin (eu)", false)]
    #[case("gpu", false)]
    #[case("!gpu", true)]
    #[case("env=prod,region in (us),!spot", true)]
    #[case("topology.kplane.dev/zone=a", true)]
    fn test_matches(#[case] selector: &str, #[case] expected: bool) {
        let target = labels(&[
            ("env", "prod"),
            ("region", "eu"),
            ("topology.kplane.dev/zone", "a"),
        ]);
        let selector = LabelSelector::parse(selector).unwrap();
        assert_eq!(selector.matches(&target), expected);
    }

    #[rstest]
    #[case("env in prod")]
    #[case("env in ()")]
    #[case("region in (eu")]
    #[case("a)")]
    #[case("=prod")]
    #[case("env=pr od")]
    #[case("env near (x)")]
    #[case("Bad/Prefix=x")]
    fn test_rejects_malformed(#[case] selector: &str) {
        assert!(LabelSelector::parse(selector).is_err(), "{selector}");
    }

    #[test]
    fn test_display_roundtrip() {
        let selector = LabelSelector::parse("env=prod, region in (us,eu), !spot").unwrap();
        let text = selector.to_string();
        assert_eq!(text, "env=prod,region in (eu,us),!spot");
        assert_eq!(LabelSelector::parse(&text).unwrap(), selector);
    }

    proptest! {
        #[test]
        fn prop_equals_selector_matches_its_own_label(
            key in "[a-z][a-z0-9]{0,10}",
            value in "[a-z0-9]{0,10}",
        ) {
            let selector = LabelSelector::parse(&format!("{key}={value}")).unwrap();
            prop_assert!(selector.matches(&labels(&[(&key, &value)])));
            prop_assert!(!selector.matches(&BTreeMap::new()));
        }
    }
}
