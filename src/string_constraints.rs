// Copyright 2020 Joyent, Inc.

//! Method constraint rules keyed by method name strings.
//!
//! A `StringMethodConstraints` is an ordered list of `StringMethodDesc`
//! rules. Lookup returns the constraints of the first rule that matches, so
//! the list must run from more specific to less specific. That ordering is
//! checked once, when the list is built, and never re-ranked at lookup time.
//!
//! A rule name is one of:
//!
//! * absent: the default rule, matching every method. It must come last.
//!
//! * an exact method name, optionally with a list of parameter type names.
//!
//! * `prefix*`: any method whose name starts with `prefix`.
//!
//! * `*suffix`: any method whose name ends with `suffix`.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::convert::TryFrom;
use std::fmt;
use std::iter::Rev;
use std::slice;

use serde_derive::{Deserialize, Serialize};

use crate::constraint::{InvocationConstraints, MethodConstraints};
use crate::error::{Error, Result};
use crate::loader::Serializable;
use crate::method::Method;

const WILDCARD: char = '*';

fn is_identifier_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_identifier_part(c: char) -> bool {
    is_identifier_start(c) || c.is_numeric()
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if is_identifier_start(c) => chars.all(is_identifier_part),
        _ => false,
    }
}

fn is_wildcard(name: &str) -> bool {
    name.starts_with(WILDCARD) || name.ends_with(WILDCARD)
}

fn strip_wildcard(name: &str) -> &str {
    name.trim_start_matches(WILDCARD).trim_end_matches(WILDCARD)
}

fn check_name(name: &str) -> Result<()> {
    let valid = if let Some(suffix) = name.strip_prefix(WILDCARD) {
        !suffix.is_empty() && suffix.chars().all(is_identifier_part)
    } else if let Some(prefix) = name.strip_suffix(WILDCARD) {
        is_identifier(prefix)
    } else {
        is_identifier(name)
    };

    if valid {
        Ok(())
    } else {
        Err(Error::IllegalArgument(format!(
            "invalid method name pattern: {:?}",
            name
        )))
    }
}

/// True when every method matched by `earlier` is also matched by
/// `later`'s covering rule, i.e. `earlier` matches a superset of `later`.
fn covers(earlier: &str, later: &str) -> bool {
    if let Some(suffix) = earlier.strip_prefix(WILDCARD) {
        if later.ends_with(WILDCARD) {
            return false;
        }
        later.trim_start_matches(WILDCARD).ends_with(suffix)
    } else if let Some(prefix) = earlier.strip_suffix(WILDCARD) {
        if later.starts_with(WILDCARD) {
            return false;
        }
        later.trim_end_matches(WILDCARD).starts_with(prefix)
    } else {
        earlier == later
    }
}

/// A single rule: a method name pattern, an optional parameter type list and
/// the constraints that apply to matching methods.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawMethodDesc")]
pub struct StringMethodDesc {
    name: Option<String>,
    types: Option<Vec<String>>,
    constraints: InvocationConstraints,
}

#[derive(Deserialize)]
struct RawMethodDesc {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    types: Option<Vec<String>>,
    #[serde(default)]
    constraints: InvocationConstraints,
}

impl TryFrom<RawMethodDesc> for StringMethodDesc {
    type Error = Error;

    fn try_from(raw: RawMethodDesc) -> Result<Self> {
        StringMethodDesc::new(raw.name.as_deref(), raw.types, raw.constraints)
    }
}

impl StringMethodDesc {
    pub fn new(
        name: Option<&str>,
        types: Option<Vec<String>>,
        constraints: InvocationConstraints,
    ) -> Result<StringMethodDesc> {
        match name {
            None => {
                if types.is_some() {
                    return Err(Error::IllegalArgument(String::from(
                        "default descriptor cannot have parameter types",
                    )));
                }
            }
            Some(n) => {
                check_name(n)?;
                if types.is_some() && is_wildcard(n) {
                    return Err(Error::IllegalArgument(format!(
                        "wildcard name {:?} cannot have parameter types",
                        n
                    )));
                }
            }
        }

        if let Some(ts) = &types {
            if ts.iter().any(|t| t.is_empty()) {
                return Err(Error::IllegalArgument(String::from(
                    "parameter type names cannot be empty",
                )));
            }
        }

        Ok(StringMethodDesc {
            name: name.map(String::from),
            types,
            constraints,
        })
    }

    /// The default rule, matching every method.
    pub fn default_rule(constraints: InvocationConstraints) -> StringMethodDesc {
        StringMethodDesc {
            name: None,
            types: None,
            constraints,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parameter_types(&self) -> Option<&[String]> {
        self.types.as_deref()
    }

    pub fn constraints(&self) -> &InvocationConstraints {
        &self.constraints
    }

    pub fn matches(&self, method: &Method) -> bool {
        let name = match &self.name {
            None => return true,
            Some(n) => n,
        };

        if let Some(types) = &self.types {
            return name == method.name()
                && types.as_slice() == method.parameter_types();
        }

        if let Some(suffix) = name.strip_prefix(WILDCARD) {
            method.name().ends_with(suffix)
        } else if let Some(prefix) = name.strip_suffix(WILDCARD) {
            method.name().starts_with(prefix)
        } else {
            name == method.name()
        }
    }

    fn key(&self) -> MethodKey {
        MethodKey {
            name: self.name.clone(),
            parameters: self.types.clone(),
        }
    }
}

impl fmt::Display for StringMethodDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.name {
            None => write!(f, "default")?,
            Some(n) => write!(f, "{}", n)?,
        }
        if let Some(types) = &self.types {
            write!(f, "({})", types.join(", "))?;
        }
        Ok(())
    }
}

/// Orders method rules so that a rule always sorts before any rule that
/// matches a superset of its methods.
///
/// The default rule sorts last and exact names sort before wildcards. Of two
/// wildcards, the one whose literal text contains the other's sorts first;
/// otherwise they compare lexicographically. Equal names then compare by
/// parameter list: an absent list sorts last, shorter lists first, then by
/// a content hash and finally by content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodKey {
    name: Option<String>,
    parameters: Option<Vec<String>>,
}

impl MethodKey {
    pub fn new(name: Option<&str>, parameters: Option<&[&str]>) -> MethodKey {
        MethodKey {
            name: name.map(String::from),
            parameters: parameters
                .map(|ps| ps.iter().map(|p| String::from(*p)).collect()),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parameters(&self) -> Option<&[String]> {
        self.parameters.as_deref()
    }
}

fn compare_names(a: Option<&str>, b: Option<&str>) -> Ordering {
    let (a, b) = match (a, b) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => return Ordering::Greater,
        (Some(_), None) => return Ordering::Less,
        (Some(a), Some(b)) => (a, b),
    };

    match (is_wildcard(a), is_wildcard(b)) {
        (false, false) => a.cmp(b),
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        (true, true) => {
            let (sa, sb) = (strip_wildcard(a), strip_wildcard(b));
            if sa != sb {
                if sa.contains(sb) {
                    return Ordering::Less;
                }
                if sb.contains(sa) {
                    return Ordering::Greater;
                }
            }
            a.cmp(b)
        }
    }
}

fn string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(i32::from(c)))
}

fn content_hash(types: &[String]) -> i32 {
    types
        .iter()
        .fold(1i32, |h, t| h.wrapping_mul(31).wrapping_add(string_hash(t)))
}

fn compare_parameters(a: Option<&[String]>, b: Option<&[String]>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a
            .len()
            .cmp(&b.len())
            .then_with(|| content_hash(a).cmp(&content_hash(b)))
            .then_with(|| a.cmp(b)),
    }
}

impl Ord for MethodKey {
    fn cmp(&self, other: &MethodKey) -> Ordering {
        compare_names(self.name(), other.name())
            .then_with(|| compare_parameters(self.parameters(), other.parameters()))
    }
}

impl PartialOrd for MethodKey {
    fn partial_cmp(&self, other: &MethodKey) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An immutable, validated, ordered list of method rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<StringMethodDesc>", into = "Vec<StringMethodDesc>")]
pub struct StringMethodConstraints {
    descs: Vec<StringMethodDesc>,
}

impl TryFrom<Vec<StringMethodDesc>> for StringMethodConstraints {
    type Error = Error;

    fn try_from(descs: Vec<StringMethodDesc>) -> Result<Self> {
        StringMethodConstraints::new(descs)
    }
}

impl From<StringMethodConstraints> for Vec<StringMethodDesc> {
    fn from(c: StringMethodConstraints) -> Self {
        c.descs
    }
}

impl StringMethodConstraints {
    pub fn new(descs: Vec<StringMethodDesc>) -> Result<StringMethodConstraints> {
        check(&descs)?;
        Ok(StringMethodConstraints { descs })
    }

    /// Constraints that apply to every method.
    pub fn uniform(constraints: InvocationConstraints) -> StringMethodConstraints {
        StringMethodConstraints {
            descs: vec![StringMethodDesc::default_rule(constraints)],
        }
    }

    pub fn descriptors(&self) -> &[StringMethodDesc] {
        &self.descs
    }

    /// Merges two rule lists. Rules with identical name and parameter types
    /// have their constraints combined; the result is ordered by `MethodKey`
    /// and validated again.
    pub fn combine(
        &self,
        other: &StringMethodConstraints,
    ) -> Result<StringMethodConstraints> {
        let mut rules: BTreeMap<MethodKey, InvocationConstraints> =
            BTreeMap::new();

        for desc in &self.descs {
            rules.insert(desc.key(), desc.constraints.clone());
        }
        for desc in &other.descs {
            match rules.entry(desc.key()) {
                Entry::Occupied(mut e) => {
                    let merged =
                        InvocationConstraints::combine(e.get(), &desc.constraints);
                    e.insert(merged);
                }
                Entry::Vacant(e) => {
                    e.insert(desc.constraints.clone());
                }
            }
        }

        let descs = rules
            .into_iter()
            .map(|(key, constraints)| StringMethodDesc {
                name: key.name,
                types: key.parameters,
                constraints,
            })
            .collect();

        StringMethodConstraints::new(descs)
    }
}

fn check(descs: &[StringMethodDesc]) -> Result<()> {
    if descs.is_empty() {
        return Err(Error::IllegalArgument(String::from(
            "method constraints need at least one descriptor",
        )));
    }

    for (i, desc) in descs.iter().enumerate() {
        let name = match &desc.name {
            None if i != descs.len() - 1 => {
                return Err(Error::IllegalArgument(String::from(
                    "default descriptor must be last",
                )));
            }
            None => continue,
            Some(n) => n,
        };

        for prev in &descs[..i] {
            let pname = match &prev.name {
                Some(p) => p,
                None => continue,
            };
            if covers(pname, name)
                && (prev.types.is_none() || prev.types == desc.types)
            {
                return Err(Error::IllegalArgument(format!(
                    "{} cannot precede {}",
                    prev, desc
                )));
            }
        }
    }

    Ok(())
}

impl MethodConstraints for StringMethodConstraints {
    fn get_constraints(&self, method: &Method) -> InvocationConstraints {
        self.descs
            .iter()
            .find(|d| d.matches(method))
            .map(|d| d.constraints.clone())
            .unwrap_or(InvocationConstraints::EMPTY)
    }

    fn possible_constraints(
        &self,
    ) -> Box<dyn Iterator<Item = InvocationConstraints> + '_> {
        Box::new(PossibleConstraints::new(&self.descs))
    }
}

impl Serializable for StringMethodConstraints {
    fn class_name() -> Cow<'static, str> {
        Cow::Borrowed("StringMethodConstraints")
    }
}

/// Walks the rules from last to first, yielding each distinct constraint
/// set once. When there is no default rule the empty set comes first, since
/// a method matching no rule gets no constraints.
pub struct PossibleConstraints<'a> {
    descs: Rev<slice::Iter<'a, StringMethodDesc>>,
    pending_empty: bool,
    seen: HashSet<InvocationConstraints>,
}

impl<'a> PossibleConstraints<'a> {
    fn new(descs: &'a [StringMethodDesc]) -> PossibleConstraints<'a> {
        let has_default = descs.last().map_or(false, |d| d.name.is_none());
        PossibleConstraints {
            descs: descs.iter().rev(),
            pending_empty: !has_default,
            seen: HashSet::new(),
        }
    }
}

impl<'a> Iterator for PossibleConstraints<'a> {
    type Item = InvocationConstraints;

    fn next(&mut self) -> Option<InvocationConstraints> {
        if self.pending_empty {
            self.pending_empty = false;
            self.seen.insert(InvocationConstraints::EMPTY);
            return Some(InvocationConstraints::EMPTY);
        }

        for desc in &mut self.descs {
            if self.seen.insert(desc.constraints.clone()) {
                return Some(desc.constraints.clone());
            }
        }
        None
    }
}
