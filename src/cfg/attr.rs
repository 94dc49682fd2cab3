// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Parser for the `key=value&key=value` attribute strings used by
//! [`crate::client::TagClient::create`].

use std::collections::HashMap;

use crate::error::{ArgumentError, Error};

/// A parsed, trimmed attribute bag. Preserves insertion order is not
/// required; lookups are by key.
#[derive(Debug, Clone, Default)]
pub struct AttrBag {
    values: HashMap<String, String>,
}

impl AttrBag {
    /// Parse `k=v&k=v`, trimming whitespace around keys and values.
    /// Rejects empty keys, empty values, or entries missing `=`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut values = HashMap::new();
        for part in s.split('&') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (k, v) = part.split_once('=').ok_or_else(|| {
                ArgumentError::BadParam(format!("attribute entry missing '=': {part}"))
            })?;
            let k = k.trim();
            let v = v.trim();
            if k.is_empty() {
                return Err(ArgumentError::BadParam("empty attribute key".into()).into());
            }
            if v.is_empty() {
                return Err(
                    ArgumentError::BadParam(format!("empty value for key '{k}'")).into(),
                );
            }
            if values.insert(k.to_string(), v.to_string()).is_some() {
                return Err(ArgumentError::Duplicate(k.to_string()).into());
            }
        }
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_required(&self, key: &str) -> Result<&str, Error> {
        self.get(key)
            .ok_or_else(|| ArgumentError::BadParam(format!("missing required key '{key}'")).into())
    }

    pub fn get_str(&self, key: &str, default: &'static str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_int(&self, key: &str, default: i64) -> Result<i64, Error> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v
                .parse::<i64>()
                .map_err(|_| ArgumentError::BadParam(format!("key '{key}' is not an integer: {v}")).into()),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, Error> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => match v {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => Err(ArgumentError::BadParam(format!(
                    "key '{key}' is not a boolean: {other}"
                ))
                .into()),
            },
        }
    }

    /// Every key this bag recognises has already been consumed by
    /// [`crate::cfg::config::TagConfig::from_attrs`]; whatever remains is
    /// forwarded to `custom` rather than rejected, so unknown vendor keys
    /// never fail `create`.
    pub fn remaining(&self, consumed: &[&str]) -> HashMap<String, String> {
        self.values
            .iter()
            .filter(|(k, _)| !consumed.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
