//! Label selectors for listing and watching resources.
//!
//! Syntax is a comma-separated list of requirements, all of which must hold:
//! `k=v`, `k!=v`, `k in (a,b)`, `k notin (a,b)`. The pseudo-label `state`
//! matches `status.state` unless the resource carries a real label of that
//! name.

use std::fmt;
use std::str::FromStr;

use crate::error::StateError;
use crate::types::{Resource, ResourceState};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
}

impl Requirement {
    fn key(&self) -> &str {
        match self {
            Requirement::Equals(k, _)
            | Requirement::NotEquals(k, _)
            | Requirement::In(k, _)
            | Requirement::NotIn(k, _) => k,
        }
    }

    fn matches(&self, value: Option<&str>) -> bool {
        match self {
            Requirement::Equals(_, v) => value == Some(v.as_str()),
            Requirement::NotEquals(_, v) => value != Some(v.as_str()),
            Requirement::In(_, set) => value.is_some_and(|x| set.iter().any(|s| s == x)),
            Requirement::NotIn(_, set) => !value.is_some_and(|x| set.iter().any(|s| s == x)),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{k}={v}"),
            Requirement::NotEquals(k, v) => write!(f, "{k}!={v}"),
            Requirement::In(k, set) => write!(f, "{k} in ({})", set.join(",")),
            Requirement::NotIn(k, set) => write!(f, "{k} notin ({})", set.join(",")),
        }
    }
}

/// A conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(input: &str) -> Result<Self, StateError> {
        input.parse()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .push(Requirement::Equals(key.into(), value.into()));
        self
    }

    pub fn ne(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .push(Requirement::NotEquals(key.into(), value.into()));
        self
    }

    /// `state in (..)` over the resource status.
    pub fn states(mut self, states: &[ResourceState]) -> Self {
        self.requirements.push(Requirement::In(
            "state".to_string(),
            states.iter().map(|s| s.as_str().to_string()).collect(),
        ));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        self.requirements.iter().all(|req| {
            let key = req.key();
            let value = match resource.label(key) {
                Some(v) => Some(v),
                None if key == "state" => Some(resource.status.state.as_str()),
                None => None,
            };
            req.matches(value)
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for LabelSelector {
    type Err = StateError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut requirements = Vec::new();
        for clause in split_clauses(input)? {
            requirements.push(parse_requirement(&clause)?);
        }
        Ok(Self { requirements })
    }
}

/// Split on commas that are not inside a parenthesised set.
fn split_clauses(input: &str) -> Result<Vec<String>, StateError> {
    let mut clauses = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for ch in input.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(StateError::InvalidSelector(input.to_string()));
                }
                current.push(ch);
            }
            ',' if depth == 0 => clauses.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if depth != 0 {
        return Err(StateError::InvalidSelector(input.to_string()));
    }
    clauses.push(current);
    Ok(clauses
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect())
}

fn parse_requirement(clause: &str) -> Result<Requirement, StateError> {
    let invalid = || StateError::InvalidSelector(clause.to_string());

    if let Some((key, value)) = clause.split_once("!=") {
        return Ok(Requirement::NotEquals(
            non_empty(key).ok_or_else(invalid)?,
            value.trim().to_string(),
        ));
    }
    if let Some((key, value)) = clause.split_once("==").or_else(|| clause.split_once('=')) {
        return Ok(Requirement::Equals(
            non_empty(key).ok_or_else(invalid)?,
            value.trim().to_string(),
        ));
    }

    let open = clause.find('(').ok_or_else(invalid)?;
    if !clause.ends_with(')') {
        return Err(invalid());
    }
    let head: Vec<&str> = clause[..open].split_whitespace().collect();
    let values: Vec<String> = clause[open + 1..clause.len() - 1]
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    match head.as_slice() {
        [key, "in"] => Ok(Requirement::In(key.to_string(), values)),
        [key, "notin"] => Ok(Requirement::NotIn(key.to_string(), values)),
        _ => Err(invalid()),
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}
