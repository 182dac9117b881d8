//! Durable session state: auth token, default headers, cached API data.
//!
//! # Design
//! - Storage backends only move strings; [`StoredValue`] adds a `;;;type`
//!   suffix so scalars and documents round-trip without losing their type.
//! - Values written without a recognised suffix decode as plain strings.
//! - `clear_session` removes identity and cached data but keeps the theme.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Number, Value};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::request::HeaderMap;

/// Persisted default request headers.
pub const DEFAULT_HEADERS_KEY: &str = "defaultRequestHeaders";
/// Persisted auth token.
pub const TOKEN_KEY: &str = "token";
/// Persisted user profile.
pub const USER_KEY: &str = "user";
/// Persisted navigation history.
pub const PAGE_HISTORY_KEY: &str = "page-history";
/// Persisted application payload.
pub const DATA_KEY: &str = "data";
/// Persisted theme; survives `clear_session`.
pub const THEME_KEY: &str = "theme";
/// Index of cached API data keys.
pub const API_DATA_KEYS_KEY: &str = "api-data-keys";
/// Prefix of cached API data entries.
pub const API_DATA_PREFIX: &str = "api-data-";

const TYPE_SEPARATOR: &str = ";;;";

/// String key/value persistence backend.
pub trait KeyValueStore: Send + Sync {
    /// Read a raw value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a raw value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    fn set(&self, key: &str, value: String) -> StoreResult<()>;

    /// Remove a key; missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    fn remove(&self, key: &str) -> StoreResult<()>;

    /// Every stored key.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn keys(&self) -> StoreResult<Vec<String>>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.entries().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries().remove(key);
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.entries().keys().cloned().collect())
    }
}

/// Store persisted as one JSON object on disk, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open `path`, starting empty when the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Json {
                key: path.display().to_string(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    operation: "session.read",
                    path,
                    source,
                });
            }
        };
        debug!(path = %path.display(), entries = entries.len(), "opened session store");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate(&self, change: impl FnOnce(&mut BTreeMap<String, String>)) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        change(&mut entries);
        self.flush(&entries)
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> StoreResult<()> {
        let io_error = |operation: &'static str, path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io {
                operation,
                path,
                source,
            }
        };
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error("session.create_dir", parent))?;
        }
        let document = serde_json::to_string_pretty(entries).map_err(|source| StoreError::Json {
            key: self.path.display().to_string(),
            source,
        })?;
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, document).map_err(io_error("session.write", &staging))?;
        fs::rename(&staging, &self.path).map_err(io_error("session.rename", &self.path))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.mutate(|entries| {
            entries.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.mutate(|entries| {
            entries.remove(key);
        })
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}

/// Typed value stored with its type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    /// `string`
    String(String),
    /// `number`
    Number(Number),
    /// `boolean`
    Boolean(bool),
    /// `object`: any JSON document.
    Object(Value),
}

impl StoredValue {
    /// Wire tag written after the separator.
    #[must_use]
    pub const fn type_tag(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Number(_) => "number",
            Self::Boolean(_) => "boolean",
            Self::Object(_) => "object",
        }
    }

    /// Encode as `value;;;type`.
    #[must_use]
    pub fn encode(&self) -> String {
        let body = match self {
            Self::String(text) => text.clone(),
            Self::Number(number) => number.to_string(),
            Self::Boolean(flag) => flag.to_string(),
            Self::Object(document) => document.to_string(),
        };
        format!("{body}{TYPE_SEPARATOR}{}", self.type_tag())
    }

    /// Decode a raw value; untagged values are plain strings.
    ///
    /// # Errors
    ///
    /// Returns an error when the body does not parse as its tagged type.
    pub fn decode(key: &str, raw: &str) -> StoreResult<Self> {
        let Some((body, tag)) = raw.rsplit_once(TYPE_SEPARATOR) else {
            return Ok(Self::String(raw.to_string()));
        };
        let mismatch = || StoreError::TypeMismatch {
            key: key.to_string(),
            tag: tag.to_string(),
        };
        match tag {
            "string" => Ok(Self::String(body.to_string())),
            "number" => serde_json::from_str::<Number>(body)
                .map(Self::Number)
                .map_err(|_| mismatch()),
            "boolean" => body.parse::<bool>().map(Self::Boolean).map_err(|_| mismatch()),
            "object" => serde_json::from_str(body)
                .map(Self::Object)
                .map_err(|source| StoreError::Json {
                    key: key.to_string(),
                    source,
                }),
            _ => Ok(Self::String(raw.to_string())),
        }
    }

    /// Convert to a JSON value.
    #[must_use]
    pub fn into_json(self) -> Value {
        match self {
            Self::String(text) => Value::String(text),
            Self::Number(number) => Value::Number(number),
            Self::Boolean(flag) => Value::Bool(flag),
            Self::Object(document) => document,
        }
    }

    /// Choose the tag matching a JSON value.
    #[must_use]
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::String(text) => Self::String(text),
            Value::Number(number) => Self::Number(number),
            Value::Bool(flag) => Self::Boolean(flag),
            other => Self::Object(other),
        }
    }
}

/// Typed view over a [`KeyValueStore`].
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn KeyValueStore>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Wrap a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Session held only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Read a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the value is malformed.
    pub fn get(&self, key: &str) -> StoreResult<Option<StoredValue>> {
        self.backend
            .get(key)?
            .map(|raw| StoredValue::decode(key, &raw))
            .transpose()
    }

    /// Write a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn set(&self, key: &str, value: &StoredValue) -> StoreResult<()> {
        self.backend.set(key, value.encode())
    }

    /// Remove a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn remove(&self, key: &str) -> StoreResult<()> {
        self.backend.remove(key)
    }

    /// Stored auth token.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the value is malformed.
    pub fn token(&self) -> StoreResult<Option<String>> {
        Ok(self.get(TOKEN_KEY)?.and_then(|value| match value {
            StoredValue::String(token) if !token.is_empty() => Some(token),
            _ => None,
        }))
    }

    /// Persist the auth token.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn set_token(&self, token: &str) -> StoreResult<()> {
        self.set(TOKEN_KEY, &StoredValue::String(token.to_string()))
    }

    /// Stored user profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the value is malformed.
    pub fn user(&self) -> StoreResult<Option<Value>> {
        Ok(self.get(USER_KEY)?.map(StoredValue::into_json))
    }

    /// Persist the user profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn set_user(&self, user: Value) -> StoreResult<()> {
        self.set(USER_KEY, &StoredValue::from_json(user))
    }

    /// Stored theme.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the value is malformed.
    pub fn theme(&self) -> StoreResult<Option<Value>> {
        Ok(self.get(THEME_KEY)?.map(StoredValue::into_json))
    }

    /// Persist the theme.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn set_theme(&self, theme: Value) -> StoreResult<()> {
        self.set(THEME_KEY, &StoredValue::from_json(theme))
    }

    /// Persisted default request headers; empty when nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the value is malformed.
    pub fn default_headers(&self) -> StoreResult<HeaderMap> {
        let Some(value) = self.get(DEFAULT_HEADERS_KEY)? else {
            return Ok(HeaderMap::new());
        };
        let Value::Object(fields) = value.into_json() else {
            return Err(StoreError::TypeMismatch {
                key: DEFAULT_HEADERS_KEY.to_string(),
                tag: "object".to_string(),
            });
        };
        Ok(fields
            .into_iter()
            .filter_map(|(name, value)| match value {
                Value::String(text) => Some((name.to_ascii_lowercase(), text)),
                Value::Null => None,
                other => Some((name.to_ascii_lowercase(), other.to_string())),
            })
            .collect())
    }

    /// Persist default request headers.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn set_default_headers(&self, headers: &HeaderMap) -> StoreResult<()> {
        let document = headers
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect();
        self.set(DEFAULT_HEADERS_KEY, &StoredValue::Object(Value::Object(document)))
    }

    /// Keys recorded in the API data index.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the value is malformed.
    pub fn api_data_keys(&self) -> StoreResult<Vec<String>> {
        Ok(match self.get(API_DATA_KEYS_KEY)?.map(StoredValue::into_json) {
            Some(Value::Array(keys)) => keys
                .into_iter()
                .filter_map(|key| key.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        })
    }

    /// Cache an API payload under `api-data-<key>` and index the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn cache_api_data(&self, key: &str, data: Value) -> StoreResult<()> {
        self.set(&api_data_key(key), &StoredValue::from_json(data))?;
        let mut keys = self.api_data_keys()?;
        if !keys.iter().any(|existing| existing == key) {
            keys.push(key.to_string());
            let index = Value::Array(keys.into_iter().map(Value::String).collect());
            self.set(API_DATA_KEYS_KEY, &StoredValue::Object(index))?;
        }
        Ok(())
    }

    /// Cached API payload for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the value is malformed.
    pub fn cached_api_data(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.get(&api_data_key(key))?.map(StoredValue::into_json))
    }

    /// Remove identity, headers and cached data; the theme is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn clear_session(&self) -> StoreResult<()> {
        for key in [TOKEN_KEY, USER_KEY, PAGE_HISTORY_KEY, DATA_KEY, DEFAULT_HEADERS_KEY] {
            self.remove(key)?;
        }
        let cached = self
            .backend
            .keys()?
            .into_iter()
            .filter(|key| key.starts_with(API_DATA_PREFIX));
        for key in cached {
            self.remove(&key)?;
        }
        debug!("cleared persisted session");
        Ok(())
    }
}

fn api_data_key(key: &str) -> String {
    format!("{API_DATA_PREFIX}{key}")
}
