// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use static_assertions::const_assert_eq;

/// The base provenance relation a dependency edge carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Relation {
    Assign,
    Assignment,
    Argument,
    Collection,
    Decorate,
    Dependency,
    Func,
    Item,
}

impl Relation {
    pub fn as_str(self) -> &'static str {
        match self {
            Relation::Assign => "assign",
            Relation::Assignment => "assignment",
            Relation::Argument => "argument",
            Relation::Collection => "collection",
            Relation::Decorate => "decorate",
            Relation::Dependency => "dependency",
            Relation::Func => "func",
            Relation::Item => "item",
        }
    }
}

/// A dependency mode: a relation plus the bind marker.
///
/// The bind marker records that an evaluation observed the *same* runtime
/// object as an antecedent computation rather than a fresh one. It is a flag
/// instead of extra enum variants because the bind rule suffixes `-bind` onto
/// whatever mode the matched dependency carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DependencyMode {
    pub relation: Relation,
    pub bind: bool,
}

pub const ASSIGN: DependencyMode = DependencyMode::new(Relation::Assign);
pub const ASSIGN_BIND: DependencyMode = ASSIGN.with_bind();
pub const ASSIGNMENT: DependencyMode = DependencyMode::new(Relation::Assignment);
pub const ARGUMENT: DependencyMode = DependencyMode::new(Relation::Argument);
pub const COLLECTION: DependencyMode = DependencyMode::new(Relation::Collection);
pub const DECORATE: DependencyMode = DependencyMode::new(Relation::Decorate);
pub const DEPENDENCY: DependencyMode = DependencyMode::new(Relation::Dependency);
pub const DEPENDENCY_BIND: DependencyMode = DEPENDENCY.with_bind();
pub const FUNC: DependencyMode = DependencyMode::new(Relation::Func);
pub const ITEM: DependencyMode = DependencyMode::new(Relation::Item);

/// The closed set of modes named by the data model.
pub const CLOSED_SET: [DependencyMode; 10] = [
    ASSIGN,
    ASSIGNMENT,
    ARGUMENT,
    DEPENDENCY,
    DEPENDENCY_BIND,
    ASSIGN_BIND,
    ITEM,
    FUNC,
    COLLECTION,
    DECORATE,
];
const_assert_eq!(CLOSED_SET.len(), 10);

impl DependencyMode {
    pub const fn new(relation: Relation) -> Self {
        DependencyMode {
            relation,
            bind: false,
        }
    }

    pub const fn with_bind(self) -> Self {
        DependencyMode {
            relation: self.relation,
            bind: true,
        }
    }

    /// The bind rule's mode rewrite: a `dependency` edge whose endpoint turns
    /// out to be the observed object becomes `assign`; any other mode gains
    /// the bind marker.
    pub fn rebind(self) -> Self {
        match self {
            DependencyMode {
                relation: Relation::Dependency,
                ..
            } => ASSIGN,
            DependencyMode { bind: false, .. } => self.with_bind(),
            already_bound => already_bound,
        }
    }
}

impl fmt::Display for DependencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.relation.as_str())?;
        if self.bind {
            f.write_str("-bind")?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown dependency mode {0:?}")]
pub struct UnknownMode(pub String);

impl FromStr for DependencyMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, bind) = match s.strip_suffix("-bind") {
            Some(base) => (base, true),
            None => (s, false),
        };
        let relation = match base {
            "assign" => Relation::Assign,
            "assignment" => Relation::Assignment,
            "argument" => Relation::Argument,
            "collection" => Relation::Collection,
            "decorate" => Relation::Decorate,
            "dependency" => Relation::Dependency,
            "func" => Relation::Func,
            "item" => Relation::Item,
            _ => return Err(UnknownMode(s.to_owned())),
        };
        Ok(DependencyMode { relation, bind })
    }
}

impl Serialize for DependencyMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DependencyMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
