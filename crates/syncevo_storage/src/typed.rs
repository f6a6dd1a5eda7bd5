//! Typed accessors on top of string properties.

use crate::error::{StorageError, StorageResult};
use crate::node::ConfigNode;
use std::time::Duration;

/// Typed read access for any [`ConfigNode`].
///
/// Every accessor returns `Ok(None)` for a missing or empty property and an
/// [`StorageError::InvalidValue`] for a value that does not parse.
pub trait NodeExt: ConfigNode {
    /// Reads a string property, treating an empty value as unset.
    fn get_string(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.get_property(key)?.filter(|v| !v.is_empty()))
    }

    /// Reads a boolean property (`1/0`, `true/false`, `yes/no`, `on/off`).
    fn get_bool(&self, key: &str) -> StorageResult<Option<bool>> {
        let Some(value) = self.get_string(key)? else {
            return Ok(None);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" | "t" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "f" => Ok(Some(false)),
            _ => Err(StorageError::invalid_value(key, &value, "boolean")),
        }
    }

    /// Reads an unsigned integer property.
    fn get_u32(&self, key: &str) -> StorageResult<Option<u32>> {
        let Some(value) = self.get_string(key)? else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| StorageError::invalid_value(key, &value, "unsigned integer"))
    }

    /// Reads a duration property.
    ///
    /// Accepts plain seconds (`300`) or unit suffixes combined in
    /// descending order (`1d2h3m4s`, `5M`, `90s`).
    fn get_duration(&self, key: &str) -> StorageResult<Option<Duration>> {
        let Some(value) = self.get_string(key)? else {
            return Ok(None);
        };
        parse_duration(&value)
            .map(Some)
            .ok_or_else(|| StorageError::invalid_value(key, &value, "duration"))
    }
}

impl<N: ConfigNode + ?Sized> NodeExt for N {}

/// Parses `300`, `5m`, `1d2h3m4s` style durations.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(seconds) = text.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let mut total: u64 = 0;
    let mut number = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let factor = match c.to_ascii_lowercase() {
            'd' => 24 * 60 * 60,
            'h' => 60 * 60,
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        let amount: u64 = number.parse().ok()?;
        total = total.checked_add(amount.checked_mul(factor)?)?;
        number.clear();
    }

    if !number.is_empty() {
        // Trailing digits without unit count as seconds
        total = total.checked_add(number.parse().ok()?)?;
    }
    Some(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryNode;

    #[test]
    fn typed_missing_and_empty() {
        let node = InMemoryNode::with_properties("cfg", [("empty", "")]);
        assert_eq!(node.get_string("empty").unwrap(), None);
        assert_eq!(node.get_bool("missing").unwrap(), None);
        assert_eq!(node.get_duration("empty").unwrap(), None);
    }

    #[test]
    fn typed_bool_values() {
        let node = InMemoryNode::with_properties(
            "cfg",
            [("a", "1"), ("b", "FALSE"), ("c", "yes"), ("d", "maybe")],
        );
        assert_eq!(node.get_bool("a").unwrap(), Some(true));
        assert_eq!(node.get_bool("b").unwrap(), Some(false));
        assert_eq!(node.get_bool("c").unwrap(), Some(true));
        assert!(matches!(
            node.get_bool("d"),
            Err(StorageError::InvalidValue { .. })
        ));
    }

    #[test]
    fn typed_u32() {
        let node = InMemoryNode::with_properties("cfg", [("n", " 42 "), ("bad", "-1")]);
        assert_eq!(node.get_u32("n").unwrap(), Some(42));
        assert!(node.get_u32("bad").is_err());
    }

    #[test]
    fn duration_formats() {
        assert_eq!(parse_duration("300"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("5M"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(
            parse_duration("1d2h3m4s"),
            Some(Duration::from_secs(86400 + 7200 + 180 + 4))
        );
        assert_eq!(parse_duration("2m10"), Some(Duration::from_secs(130)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("m"), None);
    }

    #[test]
    fn typed_duration_invalid() {
        let node = InMemoryNode::with_properties("cfg", [("RetryInterval", "2x")]);
        assert!(node.get_duration("RetryInterval").is_err());
    }
}
