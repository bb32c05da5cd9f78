//! Directory operations carried by replicated updates.

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A single attribute value.
///
/// Values are opaque bytes; matching is exact byte equality. Serialized as
/// a CBOR byte string rather than an array of integers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AttributeValue(Vec<u8>);

impl AttributeValue {
    /// Wraps raw bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Unwraps the raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for AttributeValue {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => f.write_str(text),
            Err(_) => {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for AttributeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for AttributeValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = AttributeValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(AttributeValue(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(AttributeValue(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(AttributeValue(v.as_bytes().to_vec()))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element::<u8>()? {
                    out.push(byte);
                }
                Ok(AttributeValue(out))
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

/// Kind of change applied to one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Add the listed values.
    Add,
    /// Delete the listed values, or the whole attribute when none are listed.
    Delete,
    /// Replace the attribute with the listed values.
    Replace,
}

/// One attribute modification inside a modify operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Attribute type name.
    pub attribute: String,
    /// What to do with `values`.
    pub kind: ChangeKind,
    /// Values affected by the change.
    pub values: Vec<AttributeValue>,
}

impl AttributeChange {
    /// Adds `values` to `attribute`.
    pub fn add<V: Into<AttributeValue>>(
        attribute: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::new(attribute, ChangeKind::Add, values)
    }

    /// Deletes `values` from `attribute`.
    pub fn delete_values<V: Into<AttributeValue>>(
        attribute: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::new(attribute, ChangeKind::Delete, values)
    }

    /// Deletes the whole attribute.
    pub fn delete_attribute(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            kind: ChangeKind::Delete,
            values: Vec::new(),
        }
    }

    /// Replaces `attribute` with `values`.
    pub fn replace<V: Into<AttributeValue>>(
        attribute: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::new(attribute, ChangeKind::Replace, values)
    }

    fn new<V: Into<AttributeValue>>(
        attribute: impl Into<String>,
        kind: ChangeKind,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            kind,
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// A directory update, as replicated between servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Create an entry with initial attributes.
    Add {
        /// Initial attribute values, one element per attribute.
        attributes: Vec<(String, Vec<AttributeValue>)>,
    },
    /// Modify attributes of an entry.
    Modify {
        /// Changes applied in order.
        changes: Vec<AttributeChange>,
    },
    /// Delete an entry.
    Delete,
    /// Rename or move an entry.
    ModifyDn {
        /// New relative distinguished name, e.g. `cn=new`.
        new_rdn: String,
        /// New parent DN; `None` keeps the current parent.
        new_superior: Option<String>,
        /// Remove the old RDN value from the entry's attributes.
        delete_old_rdn: bool,
    },
}

impl Operation {
    /// Short name used in logs and dumps.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Modify { .. } => "modify",
            Self::Delete => "delete",
            Self::ModifyDn { .. } => "modrdn",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cbor_round_trip<T: Serialize + for<'de> Deserialize<'de>>(value: &T) -> T {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf).unwrap();
        ciborium::from_reader(buf.as_slice()).unwrap()
    }

    #[test]
    fn value_serializes_as_byte_string() {
        let value = AttributeValue::from("abc");
        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).unwrap();
        // major type 2 (byte string), length 3
        assert_eq!(buf, vec![0x43, b'a', b'b', b'c']);
        assert_eq!(cbor_round_trip(&value), value);
    }

    #[test]
    fn modify_survives_cbor() {
        let op = Operation::Modify {
            changes: vec![
                AttributeChange::add("mail", ["a@example.com"]),
                AttributeChange::delete_attribute("description"),
                AttributeChange::replace("cn", ["Babs"]),
            ],
        };
        assert_eq!(cbor_round_trip(&op), op);
        assert_eq!(op.name(), "modify");
    }

    #[test]
    fn display_falls_back_to_hex() {
        assert_eq!(AttributeValue::from("cn").to_string(), "cn");
        assert_eq!(AttributeValue::new(vec![0xff, 0x01]).to_string(), "ff01");
    }
}
