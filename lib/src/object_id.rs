// Copyright 2024 The DaggerML Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Object identifiers and typed references.
//!
//! Most stored objects are addressed by a 16-byte id rendered as 32 hex
//! digits: content-addressed objects derive it from the MD5 of their packed
//! form, identity objects get a randomly minted one. Heads are the
//! exception, keyed by a user-supplied branch name. A [`Ref`] pairs an id
//! with the kind of object it points at and serializes as `"kind/id"`.

use std::fmt;
use std::fmt::Debug;
use std::str::FromStr;

use rand::RngCore as _;
use thiserror::Error;

use crate::hex_util;

/// Number of bytes in a minted or hashed object id.
pub const ID_LENGTH: usize = 16;

/// A 16-byte object identifier.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct Id([u8; ID_LENGTH]);

impl Id {
    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parses the given hex string into an `Id`.
    ///
    /// The given string must be valid. A static str is required to prevent
    /// API misuse.
    pub fn from_hex(hex: &'static str) -> Self {
        Self::try_from_hex(hex).unwrap()
    }

    /// Parses the given hex string into an `Id`.
    pub fn try_from_hex(hex: impl AsRef<[u8]>) -> Option<Self> {
        let bytes = hex_util::decode_hex(hex)?;
        Some(Self(bytes.try_into().ok()?))
    }

    /// Mints a fresh random id for objects whose identity is not content.
    pub fn random() -> Self {
        let mut bytes = [0; ID_LENGTH];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The all-zeros id reserved for the root commit of every repository.
    pub fn root() -> Self {
        Self([0; ID_LENGTH])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex_util::encode_hex(&self.0)
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Id").field(&self.hex()).finish()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.hex())
    }
}

impl serde::Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.hex().serialize(serializer)
    }
}

/// The kind of a stored object, doubling as the name of its sub-table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Index,
    Head,
    Commit,
    Tree,
    Dag,
    FnDag,
    Node,
    Datum,
}

impl ObjectKind {
    /// All kinds, in sub-table enumeration order.
    pub const ALL: [Self; 8] = [
        Self::Index,
        Self::Head,
        Self::Commit,
        Self::Tree,
        Self::Dag,
        Self::FnDag,
        Self::Node,
        Self::Datum,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Head => "head",
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Dag => "dag",
            Self::FnDag => "fndag",
            Self::Node => "node",
            Self::Datum => "datum",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Whether ids of this kind are derived from packed content. The
    /// remaining kinds mint random ids (or, for heads, carry names).
    pub fn is_content_addressed(self) -> bool {
        matches!(self, Self::Commit | Self::Tree | Self::FnDag | Self::Datum)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Error from parsing a `"kind/id"` ref string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid ref: {0}")]
pub struct RefParseError(pub String);

/// A typed pointer to a stored object, serialized as `"kind/id"`.
///
/// The id part is a 32-digit hex string for every kind except heads, whose
/// ids are branch names (possibly slash-qualified with a remote name).
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct Ref {
    kind: ObjectKind,
    id: String,
}

impl Ref {
    pub fn new(kind: ObjectKind, id: Id) -> Self {
        Self {
            kind,
            id: id.hex(),
        }
    }

    /// A head ref for a branch name.
    pub fn head(name: &str) -> Self {
        Self {
            kind: ObjectKind::Head,
            id: name.to_owned(),
        }
    }

    /// The branch created on repository init.
    pub fn default_head() -> Self {
        Self::head("main")
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The store key, `"kind/id"`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind.name(), self.id)
    }
}

impl Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&self.key()).finish()
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.key())
    }
}

impl serde::Serialize for Ref {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.key().serialize(serializer)
    }
}

impl FromStr for Ref {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once('/')
            .ok_or_else(|| RefParseError(s.to_owned()))?;
        let kind = ObjectKind::from_name(kind).ok_or_else(|| RefParseError(s.to_owned()))?;
        if id.is_empty() {
            return Err(RefParseError(s.to_owned()));
        }
        // Branch names are free-form; everything else must be a minted id.
        if kind != ObjectKind::Head && Id::try_from_hex(id).is_none() {
            return Err(RefParseError(s.to_owned()));
        }
        Ok(Self {
            kind,
            id: id.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_ref() {
        let id = Id::from_hex("00112233445566778899aabbccddeeff");
        let commit = Ref::new(ObjectKind::Commit, id);
        assert_eq!(
            format!("{commit}"),
            "commit/00112233445566778899aabbccddeeff"
        );
        assert_eq!(format!("{}", Ref::head("main")), "head/main");
    }

    #[test]
    fn test_parse_ref() {
        let parsed: Ref = "datum/00112233445566778899aabbccddeeff".parse().unwrap();
        assert_eq!(parsed.kind(), ObjectKind::Datum);
        assert_eq!(parsed.id(), "00112233445566778899aabbccddeeff");

        // Remote-qualified branch names keep their slashes.
        let parsed: Ref = "head/origin/main".parse().unwrap();
        assert_eq!(parsed.kind(), ObjectKind::Head);
        assert_eq!(parsed.id(), "origin/main");

        assert!("bogus/00112233445566778899aabbccddeeff"
            .parse::<Ref>()
            .is_err());
        assert!("datum/nothex".parse::<Ref>().is_err());
        assert!("datum".parse::<Ref>().is_err());
    }

    #[test]
    fn test_root_id() {
        assert_eq!(Id::root().hex(), "00000000000000000000000000000000");
    }
}
