//! Query constraint matching.
//!
//! # Rule Grammar
//! ```text
//! rule        = alternative ("|" alternative)*
//! alternative = name ["?"] [("=" | "!=") value]
//! value       = literal | "(" regex ")"
//! ```
//!
//! # Semantics
//! - `name` requires presence; `name?` accepts absence
//! - `name=value` requires presence and equality (or a full regex match)
//! - `name!=value` rejects only a present, matching value
//! - Rules are ANDed, alternatives within a rule are ORed; every matching
//!   alternative contributes its value to the output query map
//! - A malformed percent-escape in an examined value fails the whole match

use std::collections::BTreeMap;

use percent_encoding::percent_decode_str;
use regex::Regex;

use crate::routing::route::{Match, QueryParams};
use crate::routing::router::RoutingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Present,
    Equals,
    NotEquals,
}

/// Value side of an alternative.
#[derive(Debug, Clone)]
enum Value {
    Literal(String),
    Pattern(Regex),
}

impl Value {
    fn matches(&self, observed: &str) -> bool {
        match self {
            Value::Literal(expected) => observed == expected,
            Value::Pattern(re) => re.is_match(observed),
        }
    }
}

#[derive(Debug, Clone)]
struct Alternative {
    name: String,
    optional: bool,
    operator: Operator,
    value: Value,
}

impl Alternative {
    fn compile(rule: &str, text: &str) -> Result<Self, RoutingError> {
        let invalid = |reason: String| RoutingError::InvalidQueryRule {
            rule: rule.to_string(),
            reason,
        };

        let (name, operator, value) = if let Some((name, value)) = text.split_once("!=") {
            (name, Operator::NotEquals, value)
        } else if let Some((name, value)) = text.split_once('=') {
            (name, Operator::Equals, value)
        } else {
            (text, Operator::Present, "")
        };

        let name = name.trim();
        let (name, optional) = match name.strip_suffix('?') {
            Some(stripped) => (stripped, true),
            None => (name, false),
        };
        if name.is_empty() {
            return Err(invalid("missing parameter name".to_string()));
        }

        let value = if value.starts_with('(') {
            let re = Regex::new(&format!("^{value}$")).map_err(|e| invalid(e.to_string()))?;
            Value::Pattern(re)
        } else {
            Value::Literal(value.to_string())
        };

        Ok(Self {
            name: name.to_string(),
            optional,
            operator,
            value,
        })
    }

    /// `Ok(Some(value))` when matched with a value to report, `Ok(None)` when
    /// matched without one, `Err(())` when this alternative does not match.
    fn evaluate(&self, observed: Option<&str>) -> Result<Option<String>, ()> {
        match (self.operator, observed) {
            (Operator::Present, Some(v)) => Ok(Some(v.to_string())),
            (Operator::Present, None) | (Operator::Equals, None) => {
                if self.optional {
                    Ok(None)
                } else {
                    Err(())
                }
            }
            (Operator::Equals, Some(v)) => {
                if self.value.matches(v) {
                    Ok(Some(v.to_string()))
                } else {
                    Err(())
                }
            }
            (Operator::NotEquals, Some(v)) => {
                if self.value.matches(v) {
                    Err(())
                } else {
                    Ok(Some(v.to_string()))
                }
            }
            (Operator::NotEquals, None) => Ok(None),
        }
    }
}

/// A route's query rules, parsed and with regex values compiled.
#[derive(Debug, Clone, Default)]
pub struct QueryRules {
    rules: Vec<Vec<Alternative>>,
}

impl QueryRules {
    /// Parse a rule list, failing on a missing name or an invalid regex.
    pub fn compile(rules: &[String]) -> Result<Self, RoutingError> {
        let rules = rules
            .iter()
            .map(|rule| {
                split_alternatives(rule)
                    .into_iter()
                    .map(|text| Alternative::compile(rule, text))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply the rules to the request query.
    ///
    /// Returns the path match extended with the selected query values, or
    /// `None` when any rule fails.
    pub fn apply(&self, params: &QueryParams, base: Match) -> Option<Match> {
        let mut selected = BTreeMap::new();

        for alternatives in &self.rules {
            let mut satisfied = false;

            for alternative in alternatives {
                let observed = match params.get(&alternative.name) {
                    Some(raw) => Some(decode_component(raw)?),
                    None => None,
                };

                if let Ok(value) = alternative.evaluate(observed.as_deref()) {
                    satisfied = true;
                    if let Some(value) = value {
                        selected.insert(alternative.name.clone(), value);
                    }
                }
            }

            if !satisfied {
                return None;
            }
        }

        Some(Match {
            query: selected,
            ..base
        })
    }
}

/// Split a rule on `|`, ignoring bars inside regex groups.
fn split_alternatives(rule: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut escaped = false;

    for (i, c) in rule.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '|' if depth == 0 => {
                parts.push(&rule[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&rule[start..]);
    parts
}

/// Strictly decode a query component: `+` is a space, every `%` must start a
/// valid escape, and the result must be UTF-8.
pub(crate) fn decode_component(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return None;
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

/// Apply an uncompiled rule list to the request query.
///
/// An invalid rule list never matches. Route tables compile their rules once
/// with [`QueryRules::compile`].
pub fn match_query(rules: &[String], params: &QueryParams, base: Match) -> Option<Match> {
    QueryRules::compile(rules).ok()?.apply(params, base)
}
