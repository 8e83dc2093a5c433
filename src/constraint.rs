// Copyright 2020 Joyent, Inc.

//! Invocation constraints: the security and quality-of-service requirements
//! and preferences attached to a remote call.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::loader::Serializable;
use crate::method::Method;

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum InvocationConstraint {
    Integrity(bool),
    Confidentiality(bool),
    ServerAuthentication(bool),
    ClientAuthentication(bool),
    Delegation(bool),
    /// Connection establishment deadline, in milliseconds from the start of
    /// the call.
    ConnectionRelativeTime(u64),
    ServerMinPrincipal(BTreeSet<String>),
    ClientMinPrincipal(BTreeSet<String>),
}

impl InvocationConstraint {
    pub const INTEGRITY_YES: InvocationConstraint =
        InvocationConstraint::Integrity(true);
}

/// An immutable pair of constraint sets. A constraint that appears as a
/// requirement is never also kept as a preference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawConstraints")]
pub struct InvocationConstraints {
    requirements: BTreeSet<InvocationConstraint>,
    preferences: BTreeSet<InvocationConstraint>,
}

#[derive(Deserialize)]
struct RawConstraints {
    #[serde(default)]
    requirements: BTreeSet<InvocationConstraint>,
    #[serde(default)]
    preferences: BTreeSet<InvocationConstraint>,
}

impl From<RawConstraints> for InvocationConstraints {
    fn from(raw: RawConstraints) -> Self {
        InvocationConstraints::new(raw.requirements, raw.preferences)
    }
}

impl InvocationConstraints {
    pub const EMPTY: InvocationConstraints = InvocationConstraints {
        requirements: BTreeSet::new(),
        preferences: BTreeSet::new(),
    };

    pub fn new<R, P>(requirements: R, preferences: P) -> InvocationConstraints
    where
        R: IntoIterator<Item = InvocationConstraint>,
        P: IntoIterator<Item = InvocationConstraint>,
    {
        let requirements: BTreeSet<_> = requirements.into_iter().collect();
        let preferences = preferences
            .into_iter()
            .filter(|c| !requirements.contains(c))
            .collect();
        InvocationConstraints {
            requirements,
            preferences,
        }
    }

    pub fn required<R>(requirements: R) -> InvocationConstraints
    where
        R: IntoIterator<Item = InvocationConstraint>,
    {
        InvocationConstraints::new(requirements, Vec::new())
    }

    pub fn requirements(&self) -> &BTreeSet<InvocationConstraint> {
        &self.requirements
    }

    pub fn preferences(&self) -> &BTreeSet<InvocationConstraint> {
        &self.preferences
    }

    pub fn requires(&self, c: &InvocationConstraint) -> bool {
        self.requirements.contains(c)
    }

    pub fn prefers(&self, c: &InvocationConstraint) -> bool {
        self.preferences.contains(c)
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty() && self.preferences.is_empty()
    }

    pub fn combine(
        a: &InvocationConstraints,
        b: &InvocationConstraints,
    ) -> InvocationConstraints {
        if a.is_empty() {
            return b.clone();
        }
        if b.is_empty() {
            return a.clone();
        }
        InvocationConstraints::new(
            a.requirements.union(&b.requirements).cloned(),
            a.preferences.union(&b.preferences).cloned(),
        )
    }
}

impl Default for InvocationConstraints {
    fn default() -> Self {
        InvocationConstraints::EMPTY
    }
}

impl fmt::Display for InvocationConstraints {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "requirements: {:?}, preferences: {:?}",
            self.requirements, self.preferences
        )
    }
}

impl Serializable for InvocationConstraints {
    fn class_name() -> Cow<'static, str> {
        Cow::Borrowed("InvocationConstraints")
    }
}

/// Per-method constraint lookup.
pub trait MethodConstraints {
    /// The constraints for `method`. Empty, never absent, when no rule
    /// applies.
    fn get_constraints(&self, method: &Method) -> InvocationConstraints;

    /// Every distinct constraint set a lookup could produce. Finite; the
    /// iterator cannot be restarted.
    fn possible_constraints(
        &self,
    ) -> Box<dyn Iterator<Item = InvocationConstraints> + '_>;
}
