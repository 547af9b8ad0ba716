//! Order key codec.
//!
//! An order key packs the identity of one outstanding bid into a single
//! `:`-delimited string:
//!
//! ```text
//! flat:   <task>:<sequence>:<marketplace>:<kind>:collection
//!         <task>:<sequence>:<marketplace>:<kind>:token.<tokenId>
//! trait:  <task>:<sequence>:<marketplace>:<kind>:trait:<traitType>:<traitValue>
//! ```
//!
//! Free-text segments (task id, token id, trait type and value) escape `%` as
//! `%25` and `:` as `%3A`. Decoding is strict: only those two upper-case
//! escapes are accepted and the sequence must be written canonically, so every
//! accepted string re-encodes to itself.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DecodeError;
use crate::types::Marketplace;

pub const DELIMITER: char = ':';

/// Segment count of a collection/token key.
pub const FLAT_SEGMENTS: usize = 5;
/// Segment count of a trait-scoped key.
pub const TRAIT_SEGMENTS: usize = FLAT_SEGMENTS + 2;

const COLLECTION_MARKER: &str = "collection";
const TOKEN_PREFIX: &str = "token.";
const TRAIT_MARKER: &str = "trait";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Key of an order record.
    Order,
    /// Plain registry pointer.
    Ref,
}

impl RecordKind {
    fn as_str(self) -> &'static str {
        match self {
            RecordKind::Order => "order",
            RecordKind::Ref => "ref",
        }
    }
}

/// What a bid targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OfferScope {
    Collection,
    Token {
        #[serde(rename = "tokenId")]
        token_id: String,
    },
    Trait {
        #[serde(rename = "traitType")]
        trait_type: String,
        #[serde(rename = "traitValue")]
        trait_value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShape {
    Flat,
    Trait,
}

impl OfferScope {
    pub fn shape(&self) -> KeyShape {
        match self {
            OfferScope::Collection | OfferScope::Token { .. } => KeyShape::Flat,
            OfferScope::Trait { .. } => KeyShape::Trait,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderKey {
    pub task_id: String,
    /// Bid counter assigned by the worker.
    pub sequence: u64,
    pub marketplace: Marketplace,
    pub kind: RecordKind,
    pub scope: OfferScope,
}

impl OrderKey {
    pub fn new(
        task_id: impl Into<String>,
        sequence: u64,
        marketplace: Marketplace,
        scope: OfferScope,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            sequence,
            marketplace,
            kind: RecordKind::Order,
            scope,
        }
    }

    pub fn shape(&self) -> KeyShape {
        self.scope.shape()
    }

    pub fn encode(&self) -> String {
        let mut out = format!(
            "{}:{}:{}:{}:",
            escape(&self.task_id),
            self.sequence,
            self.marketplace,
            self.kind.as_str()
        );
        match &self.scope {
            OfferScope::Collection => out.push_str(COLLECTION_MARKER),
            OfferScope::Token { token_id } => {
                out.push_str(TOKEN_PREFIX);
                out.push_str(&escape(token_id));
            }
            OfferScope::Trait {
                trait_type,
                trait_value,
            } => {
                out.push_str(TRAIT_MARKER);
                out.push(DELIMITER);
                out.push_str(&escape(trait_type));
                out.push(DELIMITER);
                out.push_str(&escape(trait_value));
            }
        }
        out
    }

    /// Decode a key, dispatching on segment count: five segments is the flat
    /// shape, seven the trait-scoped one, anything else is rejected.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let segments: Vec<&str> = raw.split(DELIMITER).collect();
        let shape = match segments.len() {
            FLAT_SEGMENTS => KeyShape::Flat,
            TRAIT_SEGMENTS => KeyShape::Trait,
            n => {
                return Err(DecodeError::new(
                    raw,
                    format!("expected {FLAT_SEGMENTS} or {TRAIT_SEGMENTS} segments, found {n}"),
                ));
            }
        };

        let task_id = unescape(segments[0]).map_err(|r| DecodeError::new(raw, r))?;
        if task_id.is_empty() {
            return Err(DecodeError::new(raw, "empty task id"));
        }
        let sequence = parse_sequence(segments[1]).map_err(|r| DecodeError::new(raw, r))?;
        let marketplace = segments[2]
            .parse::<Marketplace>()
            .map_err(|r| DecodeError::new(raw, r))?;
        let kind = match segments[3] {
            "order" => RecordKind::Order,
            "ref" => RecordKind::Ref,
            other => {
                return Err(DecodeError::new(raw, format!("unknown record kind {other:?}")));
            }
        };

        let scope = match shape {
            KeyShape::Flat => {
                let scope = segments[4];
                if scope == COLLECTION_MARKER {
                    OfferScope::Collection
                } else if let Some(token) = scope.strip_prefix(TOKEN_PREFIX) {
                    OfferScope::Token {
                        token_id: unescape(token).map_err(|r| DecodeError::new(raw, r))?,
                    }
                } else {
                    return Err(DecodeError::new(raw, format!("unknown flat scope {scope:?}")));
                }
            }
            KeyShape::Trait => {
                if segments[4] != TRAIT_MARKER {
                    return Err(DecodeError::new(
                        raw,
                        format!("expected {TRAIT_MARKER:?} marker, found {:?}", segments[4]),
                    ));
                }
                OfferScope::Trait {
                    trait_type: unescape(segments[5]).map_err(|r| DecodeError::new(raw, r))?,
                    trait_value: unescape(segments[6]).map_err(|r| DecodeError::new(raw, r))?,
                }
            }
        };

        Ok(Self {
            task_id,
            sequence,
            marketplace,
            kind,
            scope,
        })
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for OrderKey {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for OrderKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for OrderKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::decode(&raw).map_err(serde::de::Error::custom)
    }
}

/// Escape a free-text segment so it can never contain the delimiter.
pub fn escape(segment: &str) -> Cow<'_, str> {
    if !segment.contains(['%', DELIMITER]) {
        return Cow::Borrowed(segment);
    }
    let mut out = String::with_capacity(segment.len() + 8);
    for c in segment.chars() {
        match c {
            '%' => out.push_str("%25"),
            DELIMITER => out.push_str("%3A"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn unescape(segment: &str) -> Result<String, String> {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let escape = rest.get(idx..idx + 3);
        match escape {
            Some("%25") => out.push('%'),
            Some("%3A") => out.push(DELIMITER),
            _ => return Err(format!("invalid escape in segment {segment:?}")),
        }
        rest = &rest[idx + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

fn parse_sequence(segment: &str) -> Result<u64, String> {
    let value = segment
        .parse::<u64>()
        .map_err(|e| format!("invalid sequence {segment:?}: {e}"))?;
    if value.to_string() != segment {
        return Err(format!("non-canonical sequence {segment:?}"));
    }
    Ok(value)
}
