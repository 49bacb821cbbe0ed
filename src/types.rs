//! Core identity types shared by collections, registries and bundles.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// A value that can stand in for a file or directory name.
///
/// Registry keys round-trip through this representation: the key of every
/// child is the name of its entry on disk (minus any configured extension).
pub trait StringRepresentable: Sized {
    fn to_key_string(&self) -> String;
    fn from_key_string(value: &str) -> Option<Self>;
}

impl StringRepresentable for String {
    fn to_key_string(&self) -> String {
        self.clone()
    }

    fn from_key_string(value: &str) -> Option<Self> {
        Some(value.to_string())
    }
}

macro_rules! string_representable_via_from_str {
    ($($ty:ty),*) => {
        $(
            impl StringRepresentable for $ty {
                fn to_key_string(&self) -> String {
                    self.to_string()
                }

                fn from_key_string(value: &str) -> Option<Self> {
                    value.parse().ok()
                }
            }
        )*
    };
}

string_representable_via_from_str!(u8, u16, u32, u64, u128, usize, i32, i64, i128);

/// Bound set required of registry keys
pub trait Key: Clone + Eq + Hash + fmt::Debug + StringRepresentable + Send + Sync + 'static {}

impl<T> Key for T where
    T: Clone + Eq + Hash + fmt::Debug + StringRepresentable + Send + Sync + 'static
{
}

/// An item with a stable identity
pub trait Identifiable {
    type Id: Key;

    fn id(&self) -> Self::Id;
}

impl<T: Identifiable> Identifiable for Arc<T> {
    type Id = T::Id;

    fn id(&self) -> Self::Id {
        self.as_ref().id()
    }
}

/// A registry entry whose identity is carried by its file name rather than
/// by its payload.
///
/// Only `value` is written to disk; `key` is recovered from the entry name
/// when the file is read back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Keyed<K, V> {
    pub key: K,
    pub value: V,
}

impl<K, V> Keyed<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

impl<K: Key, V> Identifiable for Keyed<K, V> {
    type Id = K;

    fn id(&self) -> K {
        self.key.clone()
    }
}

/// Key used to recognise "the same logical value" across a reconcile: a
/// hash of the value's encoded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Fingerprint(*blake3::hash(bytes).as_bytes())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "content:{}", hex::encode(&self.0[..8]))
    }
}
