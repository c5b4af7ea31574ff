//! Typed key/value configuration container, keyed by qualified name.
//!
//! Stands in for the serialized OPC UA key-value list at the boundary of
//! this crate: callers build a [`ParamMap`] to configure a listener or an
//! outbound connection, and the connection callback receives one back (e.g.
//! carrying `remote-hostname`).

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// A qualified parameter key: a namespace index plus a name, matching the
/// `(nsIndex, name)` pairs used throughout the original key-value API. The
/// default namespace (0) covers every key this crate defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key<'a> {
    pub ns: u16,
    pub name: &'a str,
}

impl<'a> Key<'a> {
    pub const fn new(name: &'a str) -> Self {
        Key { ns: 0, name }
    }
}

impl fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ns, self.name)
    }
}

/// A parameter value. `StringArray` exists because `listen-hostnames`
/// accepts either a single string or an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    StringArray(Vec<String>),
    U16(u16),
}

/// Typed key/value parameter container.
#[derive(Debug, Clone, Default)]
pub struct ParamMap {
    entries: BTreeMap<(u16, String), Value>,
}

impl ParamMap {
    pub fn new() -> Self {
        ParamMap {
            entries: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, key: Key<'_>, value: Value) -> &mut Self {
        self.entries.insert((key.ns, key.name.to_owned()), value);
        self
    }

    pub fn with(mut self, key: Key<'_>, value: Value) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: Key<'_>) -> Option<&Value> {
        self.entries.get(&(key.ns, key.name.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_str(&self, key: Key<'_>) -> Result<Option<&str>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(Error::InvalidArgument(format!(
                "parameter {key} is not a string"
            ))),
        }
    }

    pub fn require_str(&self, key: Key<'_>) -> Result<&str> {
        self.get_str(key)?
            .ok_or_else(|| Error::InvalidArgument(format!("missing required parameter {key}")))
    }

    pub fn get_u16(&self, key: Key<'_>) -> Result<Option<u16>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::U16(v)) => Ok(Some(*v)),
            Some(_) => Err(Error::InvalidArgument(format!(
                "parameter {key} is not a u16"
            ))),
        }
    }

    pub fn require_u16(&self, key: Key<'_>) -> Result<u16> {
        self.get_u16(key)?
            .ok_or_else(|| Error::InvalidArgument(format!("missing required parameter {key}")))
    }

    /// Accepts either `Value::String` or `Value::StringArray`, normalizing
    /// to a `Vec<String>`. Used by `listen-hostnames`.
    pub fn get_str_list(&self, key: Key<'_>) -> Result<Option<Vec<String>>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(vec![s.clone()])),
            Some(Value::StringArray(v)) => Ok(Some(v.clone())),
            Some(_) => Err(Error::InvalidArgument(format!(
                "parameter {key} is not a string or string array"
            ))),
        }
    }
}

pub mod keys {
    use super::Key;

    pub const LISTEN_PORT: Key<'static> = Key::new("listen-port");
    pub const LISTEN_HOSTNAMES: Key<'static> = Key::new("listen-hostnames");
    pub const RECV_BUFSIZE: Key<'static> = Key::new("recv-bufsize");
    pub const HOSTNAME: Key<'static> = Key::new("hostname");
    pub const PORT: Key<'static> = Key::new("port");
    pub const REMOTE_HOSTNAME: Key<'static> = Key::new("remote-hostname");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_keys() {
        let params = ParamMap::new()
            .with(keys::HOSTNAME, Value::String("localhost".into()))
            .with(keys::PORT, Value::U16(4840));
        assert_eq!(params.require_str(keys::HOSTNAME).unwrap(), "localhost");
        assert_eq!(params.require_u16(keys::PORT).unwrap(), 4840);
    }

    #[test]
    fn missing_required_key_is_invalid_argument() {
        let params = ParamMap::new();
        assert!(matches!(
            params.require_str(keys::HOSTNAME),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn hostnames_accepts_single_string_or_array() {
        let single = ParamMap::new().with(keys::LISTEN_HOSTNAMES, Value::String("a".into()));
        assert_eq!(
            single.get_str_list(keys::LISTEN_HOSTNAMES).unwrap(),
            Some(vec!["a".to_string()])
        );

        let many = ParamMap::new().with(
            keys::LISTEN_HOSTNAMES,
            Value::StringArray(vec!["a".into(), "b".into()]),
        );
        assert_eq!(
            many.get_str_list(keys::LISTEN_HOSTNAMES).unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }
}
