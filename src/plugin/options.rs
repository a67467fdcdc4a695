//! Typed configuration slots a plugin exposes to the host.
//!
//! Keys beginning with the reserved `!` sigil are hidden plugin-to-host
//! signals: they are never prompted and never shown, and the coordinator
//! consults them to pin the archive flag or the worker count.

use std::sync::Mutex;

use thiserror::Error;

/// Reserved prefix marking host-directed options. User-facing keys must not
/// start with it.
pub const HIDDEN_OPTION_SIGIL: char = '!';
pub const FORCE_ZIP_KEY: &str = "!Zip";
pub const FORCE_WORKERS_KEY: &str = "!Workers";

#[derive(Debug, Error)]
#[error("option {key} expects {expected}, got {input:?}")]
pub struct OptionParseError {
    pub key: String,
    pub expected: &'static str,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl OptionValue {
    fn expected(&self) -> &'static str {
        match self {
            OptionValue::Str(_) => "a string",
            OptionValue::Int(_) => "an integer",
            OptionValue::Float(_) => "a number",
            OptionValue::Bool(_) => "a boolean",
        }
    }

    pub fn display(&self) -> String {
        match self {
            OptionValue::Str(v) => v.clone(),
            OptionValue::Int(v) => v.to_string(),
            OptionValue::Float(v) => v.to_string(),
            OptionValue::Bool(v) => v.to_string(),
        }
    }
}

/// A single named slot. Construct with the typed helpers, then chain
/// `required` / `comment`.
#[derive(Debug, Clone)]
pub struct PluginOption {
    pub key: &'static str,
    pub value: OptionValue,
    pub required: bool,
    pub comment: &'static str,
}

impl PluginOption {
    pub fn string(key: &'static str, default: &str) -> Self {
        Self::new(key, OptionValue::Str(default.to_string()))
    }

    pub fn int(key: &'static str, default: i64) -> Self {
        Self::new(key, OptionValue::Int(default))
    }

    pub fn float(key: &'static str, default: f64) -> Self {
        Self::new(key, OptionValue::Float(default))
    }

    pub fn boolean(key: &'static str, default: bool) -> Self {
        Self::new(key, OptionValue::Bool(default))
    }

    fn new(key: &'static str, value: OptionValue) -> Self {
        Self {
            key,
            value,
            required: false,
            comment: "",
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn comment(mut self, comment: &'static str) -> Self {
        self.comment = comment;
        self
    }

    pub fn is_hidden(&self) -> bool {
        self.key.starts_with(HIDDEN_OPTION_SIGIL)
    }

    /// Replace the value from user input, keeping the slot's type.
    pub fn set_from_str(&mut self, input: &str) -> Result<(), OptionParseError> {
        let err = || OptionParseError {
            key: self.key.to_string(),
            expected: self.value.expected(),
            input: input.to_string(),
        };
        self.value = match self.value {
            OptionValue::Str(_) => OptionValue::Str(input.to_string()),
            OptionValue::Int(_) => OptionValue::Int(input.parse().map_err(|_| err())?),
            OptionValue::Float(_) => OptionValue::Float(input.parse().map_err(|_| err())?),
            OptionValue::Bool(_) => OptionValue::Bool(parse_bool(input).ok_or_else(err)?),
        };
        Ok(())
    }
}

fn parse_bool(input: &str) -> Option<bool> {
    match input {
        "1" | "t" | "T" | "true" | "True" | "TRUE" => Some(true),
        "0" | "f" | "F" | "false" | "False" | "FALSE" => Some(false),
        _ => None,
    }
}

/// Force the coordinator to archive (or not) regardless of `--zip`.
pub fn force_zip(value: bool) -> PluginOption {
    PluginOption::boolean(FORCE_ZIP_KEY, value)
        .comment("Forces zipping of the title directories after the download finishes.")
}

/// Force the coordinator's worker count regardless of `--workers`.
pub fn force_workers(value: i64) -> PluginOption {
    PluginOption::int(FORCE_WORKERS_KEY, value)
        .comment("Forces the maximum number of workers to a certain number.")
}

/// The option bag itself. Plugins hold one behind `&self`; the host mutates
/// slots through it before `open` runs.
#[derive(Debug, Default)]
pub struct OptionSet {
    slots: Mutex<Vec<PluginOption>>,
}

impl OptionSet {
    pub fn new(slots: Vec<PluginOption>) -> Self {
        Self {
            slots: Mutex::new(slots),
        }
    }

    pub fn snapshot(&self) -> Vec<PluginOption> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Set a slot from user input. Keys match case-insensitively. Returns
    /// false when no slot has that key.
    pub fn set(&self, key: &str, input: &str) -> Result<bool, OptionParseError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for slot in slots.iter_mut() {
            if slot.key.eq_ignore_ascii_case(key) {
                slot.set_from_str(input)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn get(&self, key: &str) -> Option<OptionValue> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .find(|s| s.key.eq_ignore_ascii_case(key))
            .map(|s| s.value.clone())
    }

    pub fn str_value(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(OptionValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    pub fn int_value(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(OptionValue::Int(v)) => Some(v),
            _ => None,
        }
    }

    pub fn bool_value(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(OptionValue::Bool(v)) => Some(v),
            _ => None,
        }
    }

    /// The hidden host-directed slots, with the sigil stripped from the key.
    pub fn special(&self) -> Vec<(String, OptionValue)> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .filter(|s| s.is_hidden())
            .map(|s| (s.key[1..].to_string(), s.value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_parsing() {
        let set = OptionSet::new(vec![
            PluginOption::string("Username", "").required(),
            PluginOption::int("JPEGQuality", 95),
            PluginOption::boolean("Lossless", false),
            PluginOption::float("Scale", 1.0),
        ]);

        assert!(set.set("username", "mino").unwrap());
        assert_eq!(set.str_value("Username").as_deref(), Some("mino"));

        assert!(set.set("JPEGQuality", "80").unwrap());
        assert_eq!(set.int_value("JPEGQuality"), Some(80));
        assert!(set.set("JPEGQuality", "eighty").is_err());

        assert!(set.set("Lossless", "true").unwrap());
        assert_eq!(set.bool_value("Lossless"), Some(true));
        assert!(set.set("Lossless", "yes").is_err());

        assert!(set.set("Scale", "0.5").unwrap());
        assert!(!set.set("NoSuchKey", "x").unwrap());
    }

    #[test]
    fn special_options_are_hidden_and_stripped() {
        let set = OptionSet::new(vec![
            PluginOption::string("Visible", ""),
            force_zip(true),
            force_workers(1),
        ]);
        let special = set.special();
        assert_eq!(special.len(), 2);
        assert_eq!(special[0], ("Zip".to_string(), OptionValue::Bool(true)));
        assert_eq!(special[1], ("Workers".to_string(), OptionValue::Int(1)));
        assert!(set.snapshot()[1].is_hidden());
        assert!(!set.snapshot()[0].is_hidden());
    }
}
