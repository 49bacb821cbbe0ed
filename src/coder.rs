//! Coder strategies
//!
//! A coder turns a typed value into the bytes of one file and back. Options
//! travel with every call in a [`CodingContext`]; nothing is read from ambient
//! state.

use crate::error::CoderError;
use crate::types::{Key, Keyed};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::Path;

/// Formatting options applied by text-based coders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodingOptions {
    /// Pretty-print structured formats
    pub pretty: bool,
    /// Terminate text output with a newline
    pub trailing_newline: bool,
}

impl Default for CodingOptions {
    fn default() -> Self {
        Self {
            pretty: true,
            trailing_newline: true,
        }
    }
}

/// Per-call coding context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodingContext {
    pub options: CodingOptions,
    /// Key of the registry entry being coded, when there is one
    pub key: Option<String>,
}

impl CodingContext {
    pub fn new(options: CodingOptions) -> Self {
        Self { options, key: None }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Pluggable serialization format
pub trait Coder<T>: Send + Sync {
    fn encode(&self, value: &T, cx: &CodingContext) -> Result<Vec<u8>, CoderError>;
    fn decode(&self, bytes: &[u8], cx: &CodingContext) -> Result<T, CoderError>;
}

fn finish_text(mut text: String, cx: &CodingContext) -> Vec<u8> {
    if cx.options.trailing_newline && !text.ends_with('\n') {
        text.push('\n');
    }
    text.into_bytes()
}

/// JSON via `serde_json`; the default format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCoder;

impl<T> Coder<T> for JsonCoder
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T, cx: &CodingContext) -> Result<Vec<u8>, CoderError> {
        let text = if cx.options.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .map_err(|e| CoderError::Encode(e.to_string()))?;
        Ok(finish_text(text, cx))
    }

    fn decode(&self, bytes: &[u8], _cx: &CodingContext) -> Result<T, CoderError> {
        serde_json::from_slice(bytes).map_err(|e| CoderError::Decode(e.to_string()))
    }
}

/// TOML via the `toml` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlCoder;

impl<T> Coder<T> for TomlCoder
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T, cx: &CodingContext) -> Result<Vec<u8>, CoderError> {
        let text = if cx.options.pretty {
            toml::to_string_pretty(value)
        } else {
            toml::to_string(value)
        }
        .map_err(|e| CoderError::Encode(e.to_string()))?;
        Ok(finish_text(text, cx))
    }

    fn decode(&self, bytes: &[u8], _cx: &CodingContext) -> Result<T, CoderError> {
        let text = std::str::from_utf8(bytes).map_err(|e| CoderError::Decode(e.to_string()))?;
        toml::from_str(text).map_err(|e| CoderError::Decode(e.to_string()))
    }
}

/// Plain UTF-8 text, written verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCoder;

impl Coder<String> for TextCoder {
    fn encode(&self, value: &String, _cx: &CodingContext) -> Result<Vec<u8>, CoderError> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8], _cx: &CodingContext) -> Result<String, CoderError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CoderError::Decode(e.to_string()))
    }
}

/// Raw bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCoder;

impl Coder<Vec<u8>> for BytesCoder {
    fn encode(&self, value: &Vec<u8>, _cx: &CodingContext) -> Result<Vec<u8>, CoderError> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8], _cx: &CodingContext) -> Result<Vec<u8>, CoderError> {
        Ok(bytes.to_vec())
    }
}

/// Codes the value of a [`Keyed`] entry with an inner coder. The key is not
/// part of the payload; decoding restores it from [`CodingContext::key`].
pub struct KeyedCoder<C, V> {
    inner: C,
    _value: PhantomData<fn() -> V>,
}

impl<C, V> KeyedCoder<C, V> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            _value: PhantomData,
        }
    }
}

impl<K, V, C> Coder<Keyed<K, V>> for KeyedCoder<C, V>
where
    K: Key,
    C: Coder<V>,
{
    fn encode(&self, value: &Keyed<K, V>, cx: &CodingContext) -> Result<Vec<u8>, CoderError> {
        self.inner.encode(&value.value, cx)
    }

    fn decode(&self, bytes: &[u8], cx: &CodingContext) -> Result<Keyed<K, V>, CoderError> {
        let key = cx
            .key
            .as_deref()
            .and_then(K::from_key_string)
            .ok_or(CoderError::MissingKey)?;
        let value = self.inner.decode(bytes, cx)?;
        Ok(Keyed { key, value })
    }
}

/// Choose a structured coder from a file extension: TOML for `.toml`, JSON otherwise.
pub fn coder_for_path<T>(path: &Path) -> Box<dyn Coder<T>>
where
    T: Serialize + DeserializeOwned + 'static,
{
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("toml") => Box::new(TomlCoder),
        _ => Box::new(JsonCoder),
    }
}
