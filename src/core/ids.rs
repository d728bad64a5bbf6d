//! Identifier formats.
//!
//! Primary ids are opaque and time-ordered (`tsk-<uuidv7>`). Short ids are
//! sequential aliases of the form `PREFIX-N` or `PREFIX-SUB-N`; the counter
//! that issues them is keyed by `PREFIX` or `PREFIX-SUB`.

use crate::core::error::{Result, StoreError};
use uuid::Uuid;

/// Prefix of generated task ids.
pub const TASK_ID_PREFIX: &str = "tsk";

const MAX_ENTITY_ID_LEN: usize = 128;

/// Generates a new primary task id.
#[must_use]
pub fn new_task_id() -> String {
    format!("{TASK_ID_PREFIX}-{}", Uuid::now_v7().simple())
}

/// Checks `[A-Za-z0-9][A-Za-z0-9._-]{0,127}`.
#[must_use]
pub fn is_valid_entity_id(id: &str) -> bool {
    let mut chars = id.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    id.len() <= MAX_ENTITY_ID_LEN
        && first.is_ascii_alphanumeric()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Validates a caller-supplied task id or resource name.
///
/// # Errors
/// Returns a validation error naming the offending id.
pub fn validate_entity_id(id: &str, origin: &str) -> Result<()> {
    if is_valid_entity_id(id) {
        Ok(())
    } else {
        Err(StoreError::validation(
            "invalid_id",
            format!("'{id}' is not a valid identifier"),
            origin,
        )
        .with_context("id", id)
        .with_hint("Use 1-128 characters from [A-Za-z0-9._-], starting with a letter or digit"))
    }
}

/// Checks `[A-Z][A-Z0-9]*`.
#[must_use]
pub fn is_valid_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    chars.next().is_some_and(|c| c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// A parsed short id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShortId {
    prefix: String,
    sub: Option<String>,
    number: u64,
}

impl ShortId {
    /// Builds a short id from a counter key and a sequence number.
    ///
    /// Returns `None` if the counter key is malformed or `number` is zero.
    #[must_use]
    pub fn from_counter(counter_key: &str, number: u64) -> Option<Self> {
        let (prefix, sub) = match counter_key.split_once('-') {
            Some((prefix, sub)) => (prefix, Some(sub)),
            None => (counter_key, None),
        };
        let valid = number >= 1
            && is_valid_prefix(prefix)
            && sub.map_or(true, is_valid_prefix);
        valid.then(|| Self {
            prefix: prefix.to_string(),
            sub: sub.map(str::to_string),
            number,
        })
    }

    /// Parses `PREFIX-N` or `PREFIX-SUB-N`. Leading zeros are rejected so
    /// that parsing and formatting round trip.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (counter_key, digits) = raw.rsplit_once('-')?;
        if digits.is_empty()
            || digits.starts_with('0')
            || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        let number = digits.parse().ok()?;
        Self::from_counter(counter_key, number)
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn number(&self) -> u64 {
        self.number
    }

    /// The key of the counter this id was issued from.
    #[must_use]
    pub fn counter_key(&self) -> String {
        match &self.sub {
            Some(sub) => format!("{}-{sub}", self.prefix),
            None => self.prefix.clone(),
        }
    }
}

impl std::fmt::Display for ShortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.counter_key(), self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_task_ids_are_valid_and_ordered() {
        let a = new_task_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_task_id();
        assert!(a.starts_with("tsk-"));
        assert!(is_valid_entity_id(&a));
        assert!(a < b);
    }

    #[test]
    fn entity_id_rules() {
        assert!(is_valid_entity_id("T1"));
        assert!(is_valid_entity_id("printer.lab-2_b"));
        assert!(!is_valid_entity_id(""));
        assert!(!is_valid_entity_id("-leading"));
        assert!(!is_valid_entity_id("_global"));
        assert!(!is_valid_entity_id("a/b"));
        assert!(!is_valid_entity_id(&"x".repeat(129)));
        assert!(validate_entity_id("../x", "test").is_err());
    }

    #[test]
    fn short_id_parsing() {
        let plain = ShortId::parse("TASK-42").expect("plain");
        assert_eq!(plain.counter_key(), "TASK");
        assert_eq!(plain.number(), 42);

        let sub = ShortId::parse("TASK-UI-7").expect("sub");
        assert_eq!(sub.counter_key(), "TASK-UI");
        assert_eq!(sub.prefix(), "TASK");
        assert_eq!(sub.to_string(), "TASK-UI-7");

        for bad in ["TASK-0", "TASK-07", "task-1", "TASK", "TASK-", "A-B-C-1", "1X-2"] {
            assert!(ShortId::parse(bad).is_none(), "{bad} should not parse");
        }
    }

    #[test]
    fn from_counter_validates_key() {
        assert_eq!(
            ShortId::from_counter("OPS-DB", 3).map(|s| s.to_string()),
            Some("OPS-DB-3".to_string())
        );
        assert!(ShortId::from_counter("ops", 1).is_none());
        assert!(ShortId::from_counter("OPS", 0).is_none());
    }
}
