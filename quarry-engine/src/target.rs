//! Addresses, targets, and their fields.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use compact_str::CompactString;
use quarry_ore::hash::Xxh3Hasher;

use crate::registry::Param;

/// The unique name of a [`Target`]: a directory path plus a target name,
/// rendered as `path:name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    path: CompactString,
    name: CompactString,
}

impl Address {
    pub fn new(path: impl Into<CompactString>, name: impl Into<CompactString>) -> Self {
        Address {
            path: path.into(),
            name: name.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.name)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("'{raw}' is not a valid address, expected 'path:name'")]
pub struct AddressParseError {
    raw: String,
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let Some((path, name)) = raw.split_once(':') else {
            return Err(AddressParseError { raw: raw.into() });
        };
        if name.is_empty() || name.contains(':') {
            return Err(AddressParseError { raw: raw.into() });
        }
        Ok(Address::new(path, name))
    }
}

/// One field on a [`Target`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Bool(bool),
    String(String),
    StringList(Vec<String>),
}

impl FieldValue {
    fn fingerprint(&self, hasher: &mut Xxh3Hasher) {
        match self {
            FieldValue::Bool(val) => hasher.update(&[0, u8::from(*val)]),
            FieldValue::String(val) => {
                hasher.update(&[1]);
                hasher.update(val.as_bytes());
            }
            FieldValue::StringList(vals) => {
                hasher.update(&[2]);
                for val in vals {
                    hasher.update(val.as_bytes());
                    hasher.update(&[0]);
                }
            }
        }
    }
}

/// A single addressable unit of metadata, e.g. one entry in a definitions
/// file. Targets carry no behavior themselves, union members interpret them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    address: Address,
    kind: CompactString,
    fields: BTreeMap<CompactString, FieldValue>,
}

impl Target {
    pub fn new(
        address: Address,
        kind: impl Into<CompactString>,
        fields: BTreeMap<CompactString, FieldValue>,
    ) -> Self {
        Target {
            address,
            kind: kind.into(),
            fields,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn bool_field(&self, name: &str, default: bool) -> bool {
        match self.fields.get(name) {
            Some(FieldValue::Bool(val)) => *val,
            _ => default,
        }
    }

    pub fn string_field(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::String(val)) => Some(val),
            _ => None,
        }
    }

    pub fn string_list_field(&self, name: &str) -> Option<&[String]> {
        match self.fields.get(name) {
            Some(FieldValue::StringList(vals)) => Some(vals),
            _ => None,
        }
    }

    /// Whether this target opts out of `goal` via a `skip_<goal>` field.
    pub fn skipped(&self, goal: &str) -> bool {
        self.bool_field(&format!("skip_{goal}"), false)
    }

    pub fn fingerprint(&self, hasher: &mut Xxh3Hasher) {
        hasher.update(self.address.path.as_bytes());
        hasher.update(&[b':']);
        hasher.update(self.address.name.as_bytes());
        hasher.update(self.kind.as_bytes());
        for (name, value) in &self.fields {
            hasher.update(name.as_bytes());
            value.fingerprint(hasher);
        }
    }
}

impl Param for Target {
    fn param_fingerprint(&self, hasher: &mut Xxh3Hasher) {
        self.fingerprint(hasher)
    }
}

/// A typed view over a required subset of a target's fields.
///
/// Union members extract one of these per target to decide applicability.
/// A target missing any required field simply doesn't get a field set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSet {
    fields: BTreeMap<CompactString, FieldValue>,
}

impl FieldSet {
    pub fn extract(target: &Target, required: &[&str]) -> Option<FieldSet> {
        let mut fields = BTreeMap::new();
        for name in required {
            let value = target.field(name)?;
            fields.insert(CompactString::new(name), value.clone());
        }
        Some(FieldSet { fields })
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::String(val)) => Some(val),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str, default: bool) -> bool {
        match self.fields.get(name) {
            Some(FieldValue::Bool(val)) => *val,
            _ => default,
        }
    }

    pub fn list(&self, name: &str) -> Option<&[String]> {
        match self.fields.get(name) {
            Some(FieldValue::StringList(vals)) => Some(vals),
            _ => None,
        }
    }
}
