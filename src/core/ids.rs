//! Cluster and neuron identities.
//!
//! Every id crossing a store or lookup boundary goes through `parse`, which
//! accepts any case and the hyphenated, simple, braced and urn spellings and
//! always yields one binary identity. Ids are compared as 128-bit values,
//! never as strings.

use core::fmt;
use core::str::FromStr;

use uuid::Uuid;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IdError;
use crate::storage;

/// Namespace for feature-derived neuron ids (UUIDv5).
const NEURON_NAMESPACE: Uuid = Uuid::from_u128(0x6e63_6c75_7374_4e65_8000_6e65_7572_6f6e);

fn parse_uuid(raw: &str) -> Result<Uuid, IdError> {
    let trimmed = raw.trim();
    Uuid::try_parse(trimmed).map_err(|_| IdError::Malformed(raw.to_string()))
}

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            pub const fn from_u128(v: u128) -> Self {
                Self(Uuid::from_u128(v))
            }

            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Parse any accepted spelling into the canonical identity.
            pub fn parse(raw: &str) -> Result<Self, IdError> {
                parse_uuid(raw).map(Self)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn as_u128(&self) -> u128 {
                self.0.as_u128()
            }

            pub fn partition_key(&self, partition_count: u16) -> PartitionKey {
                PartitionKey::for_u128(self.0.as_u128(), partition_count)
            }
        }

        impl fmt::Display for $name {
            /// Canonical lowercase hyphenated form.
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0.hyphenated(), f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0.hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        #[cfg(feature = "serde")]
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        #[cfg(feature = "serde")]
        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

uuid_id!(ClusterId);
uuid_id!(NeuronId);

impl NeuronId {
    /// Stable id for a named feature.
    ///
    /// The name is trimmed and lowercased first, so `"Fur"` and `" fur"` name
    /// the same neuron and every cluster trained on it shares one record.
    pub fn for_feature(name: &str) -> Self {
        let canonical = name.trim().to_lowercase();
        Self(Uuid::new_v5(&NEURON_NAMESPACE, canonical.as_bytes()))
    }
}

/// Storage shard identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey(u16);

impl PartitionKey {
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    pub fn for_u128(value: u128, partition_count: u16) -> Self {
        let count = partition_count.max(1) as u64;
        let h = storage::mix64(storage::mix64(0, value as u64), (value >> 64) as u64);
        Self((h % count) as u16)
    }

    pub fn index(&self) -> u16 {
        self.0
    }

    /// File stem, e.g. `p-002a`.
    pub fn file_stem(&self) -> String {
        format!("p-{:04x}", self.0)
    }

    /// Inverse of `file_stem` (case-insensitive hex).
    pub fn from_file_stem(stem: &str) -> Option<Self> {
        let hex = stem.strip_prefix("p-")?;
        if hex.len() != 4 {
            return None;
        }
        u16::from_str_radix(hex, 16).ok().map(Self)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}

impl fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionKey({})", self.file_stem())
    }
}

#[cfg(feature = "serde")]
impl Serialize for PartitionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.file_stem())
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for PartitionKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_file_stem(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("malformed partition key: {raw:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn differently_cased_spellings_are_one_identity() {
        let canonical = "6f1c2e3a-9b7d-4c1e-8f00-123456789abc";
        let upper = canonical.to_uppercase();
        let braced = format!("{{{upper}}}");
        let simple = canonical.replace('-', "");
        let urn = format!("urn:uuid:{canonical}");

        let a = ClusterId::parse(canonical).unwrap();
        for spelling in [&upper, &braced, &simple, &urn] {
            let b = ClusterId::parse(spelling).unwrap();
            assert_eq!(a, b, "{spelling}");
            assert_eq!(b.to_string(), canonical);
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            ClusterId::parse("not-a-guid"),
            Err(IdError::Malformed(_))
        ));
        assert!(NeuronId::parse("").is_err());
    }

    #[test]
    fn feature_neurons_are_shared_by_normalized_name() {
        assert_eq!(NeuronId::for_feature("Fur"), NeuronId::for_feature(" fur "));
        assert_ne!(NeuronId::for_feature("fur"), NeuronId::for_feature("feathers"));
    }

    #[test]
    fn partition_key_is_stable_and_bounded() {
        let id = ClusterId::from_u128(0x1234_5678_9abc_def0_1122_3344_5566_7788);
        let k1 = id.partition_key(64);
        let k2 = ClusterId::parse(&id.to_string().to_uppercase())
            .unwrap()
            .partition_key(64);
        assert_eq!(k1, k2);
        assert!(k1.index() < 64);
        assert_eq!(PartitionKey::from_file_stem(&k1.file_stem()), Some(k1));
        assert_eq!(PartitionKey::from_file_stem("p-00zz"), None);
    }

    #[test]
    fn partition_keys_spread_across_shards() {
        let mut used = std::collections::HashSet::new();
        for i in 0..512u128 {
            used.insert(ClusterId::from_u128(i << 64 | i).partition_key(16));
        }
        assert_eq!(used.len(), 16);
    }
}
