//! Column values.
//!
//! OVSDB columns hold an atom, a set of atoms or a map. Map columns used by
//! this crate are string-to-string (`ip_port_mappings`, `external_ids`,
//! `options`), so the map variant is keyed and valued by strings.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Atom {
    Integer(i64),
    Boolean(bool),
    String(String),
    Uuid(Uuid),
}

impl Display for Atom {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Atom::Integer(i) => write!(f, "{i}"),
            Atom::Boolean(b) => write!(f, "{b}"),
            Atom::String(s) => f.write_str(s),
            Atom::Uuid(u) => write!(f, "{u}"),
        }
    }
}

impl From<i64> for Atom {
    fn from(value: i64) -> Self {
        Atom::Integer(value)
    }
}

impl From<bool> for Atom {
    fn from(value: bool) -> Self {
        Atom::Boolean(value)
    }
}

impl From<&str> for Atom {
    fn from(value: &str) -> Self {
        Atom::String(value.to_string())
    }
}

impl From<String> for Atom {
    fn from(value: String) -> Self {
        Atom::String(value)
    }
}

impl From<Uuid> for Atom {
    fn from(value: Uuid) -> Self {
        Atom::Uuid(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Atom(Atom),
    Set(BTreeSet<Atom>),
    Map(BTreeMap<String, String>),
}

impl Value {
    pub fn empty_set() -> Self {
        Value::Set(BTreeSet::new())
    }

    pub fn empty_map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn set<I, A>(atoms: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Atom>,
    {
        Value::Set(atoms.into_iter().map(Into::into).collect())
    }

    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn as_atom(&self) -> Option<&Atom> {
        match self {
            Value::Atom(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Atom(Atom::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Atom(Atom::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Atom(Atom::Uuid(u)) => Some(*u),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&BTreeSet<Atom>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Scalar equality, or membership for set columns.
    ///
    /// Optional references (`min: 0, max: 1`) are stored as sets, so a
    /// single-element set matches its element.
    pub fn matches(&self, atom: &Atom) -> bool {
        match self {
            Value::Atom(a) => a == atom,
            Value::Set(s) => s.contains(atom),
            Value::Map(_) => false,
        }
    }
}

impl From<Atom> for Value {
    fn from(value: Atom) -> Self {
        Value::Atom(value)
    }
}

macro_rules! value_from_atom {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::Atom(Atom::from(value))
                }
            }
        )*
    };
}

value_from_atom!(i64, bool, &str, String, Uuid);
