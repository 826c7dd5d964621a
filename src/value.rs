//! Typed Values
//!
//! Property and data entries are tagged variants rather than trait
//! objects: a `Value` pairs with a descriptor (see `property.rs`) that
//! fixes which variant is legal for a given key.
//!
//! ## String Conversions
//!
//! | Type | Format |
//! |--------|--------------------------------------------------|
//! | Bool | exactly `true` / `false` |
//! | Uint | decimal, optional `K`/`M`/`G`/`T` suffix (1024-based) when the key allows it |
//! | List | semicolon-separated, `\;` escapes a literal separator |
//! | Map | `k1: v1; k2: v2`, whitespace trimmed, trailing `;` allowed |

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, ErrorKind};

/// Type tag for a property or data entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Str,
    Int,
    Uint,
    Bool,
    List,
    Map,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Str => "string",
            ValueType::Int => "int",
            ValueType::Uint => "uint",
            ValueType::Bool => "bool",
            ValueType::List => "list",
            ValueType::Map => "map",
        };
        f.write_str(name)
    }
}

/// Uint maps keep key order stable so formatted output is deterministic.
pub type UintMap = BTreeMap<String, u64>;

/// A typed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Int(i64),
    Uint(u64),
    Bool(bool),
    List(Vec<String>),
    Map(UintMap),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Str(_) => ValueType::Str,
            Value::Int(_) => ValueType::Int,
            Value::Uint(_) => ValueType::Uint,
            Value::Bool(_) => ValueType::Bool,
            Value::List(_) => ValueType::List,
            Value::Map(_) => ValueType::Map,
        }
    }

    /// Parse `s` into the given type. `unit_suffix` permits K/M/G/T on Uint.
    pub fn parse(ty: ValueType, s: &str, unit_suffix: bool) -> Result<Value, Error> {
        match ty {
            ValueType::Str => Ok(Value::Str(s.to_string())),
            ValueType::Int => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| Error::invalid_value(format!("invalid integer value {}", s))),
            ValueType::Uint => {
                if unit_suffix {
                    parse_unit_uint(s).map(Value::Uint)
                } else {
                    s.trim()
                        .parse::<u64>()
                        .map(Value::Uint)
                        .map_err(|_| Error::invalid_value(format!("invalid unsigned value {}", s)))
                }
            }
            ValueType::Bool => match s {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(Error::invalid_value(format!("invalid boolean value {}", s))),
            },
            ValueType::List => Ok(Value::List(split_escaped(s, ';'))),
            ValueType::Map => parse_uint_map(s).map(Value::Map),
        }
    }

    /// Canonical string form, the inverse of [`parse`](Self::parse).
    pub fn format(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Int(v) => v.to_string(),
            Value::Uint(v) => v.to_string(),
            Value::Bool(v) => if *v { "true" } else { "false" }.to_string(),
            Value::List(items) => join_escaped(items, ';'),
            Value::Map(map) => {
                let mut parts = Vec::with_capacity(map.len());
                for (k, v) in map {
                    parts.push(format!("{}: {}", k, v));
                }
                parts.join("; ")
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&UintMap> {
        match self {
            Value::Map(v) => Some(v),
            _ => None,
        }
    }
}

// ============================================================================
// String Helpers
// ============================================================================

/// Parse an unsigned value with an optional 1024-based unit suffix.
///
/// Whitespace around the number and between number and suffix is ignored.
pub fn parse_unit_uint(s: &str) -> Result<u64, Error> {
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(Error::invalid_value("empty unsigned value"));
    }

    let (digits, suffix) = match compact.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => compact.split_at(pos),
        None => (compact.as_str(), ""),
    };

    let base = digits
        .parse::<u64>()
        .map_err(|_| Error::invalid_value(format!("invalid unsigned value {}", s)))?;

    let shift = match suffix {
        "" => 0,
        "K" | "k" => 10,
        "M" | "m" => 20,
        "G" | "g" => 30,
        "T" | "t" => 40,
        _ => {
            return Err(Error::invalid_value(format!(
                "invalid unit suffix in {}",
                s
            )))
        }
    };

    base.checked_shl(shift)
        .filter(|v| v >> shift == base)
        .ok_or_else(|| Error::invalid_value(format!("value {} overflows", s)))
}

/// Split on `sep`, honouring `\<sep>` escapes; empty tokens are dropped.
pub fn split_escaped(s: &str, sep: char) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&sep) {
            current.push(sep);
            chars.next();
        } else if c == sep {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                tokens.push(trimmed.to_string());
            }
            current.clear();
        } else {
            current.push(c);
        }
    }

    let trimmed = current.trim();
    if !trimmed.is_empty() {
        tokens.push(trimmed.to_string());
    }

    tokens
}

/// Join tokens with `sep`, escaping separators embedded in a token.
pub fn join_escaped(items: &[String], sep: char) -> String {
    let escaped: Vec<String> = items
        .iter()
        .map(|item| item.replace(sep, &format!("\\{}", sep)))
        .collect();
    escaped.join(&format!("{} ", sep))
}

/// Parse `"k1: v1; k2: v2"` into a map; later keys overwrite earlier ones.
pub fn parse_uint_map(s: &str) -> Result<UintMap, Error> {
    let mut map = UintMap::new();

    for entry in split_escaped(s, ';') {
        let (key, val) = entry
            .split_once(':')
            .ok_or_else(|| Error::invalid_value(format!("invalid map entry {}", entry)))?;

        let key = key.trim();
        if key.is_empty() {
            return Err(Error::invalid_value(format!("empty key in {}", entry)));
        }

        let val = parse_unit_uint(val.trim())?;
        map.insert(key.to_string(), val);
    }

    Ok(map)
}

/// Parse an `env`-style list: `KEY=VALUE;KEY=VALUE` with `\;` escapes.
pub fn parse_env_list(s: &str) -> Result<Vec<(String, String)>, Error> {
    let mut entries = Vec::new();

    for token in split_escaped(s, ';') {
        match token.split_once('=') {
            Some((key, val)) if !key.is_empty() => {
                entries.push((key.to_string(), val.to_string()))
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("invalid environment entry {}", token),
                ))
            }
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unit_uint() {
        assert_eq!(parse_unit_uint("0").unwrap(), 0);
        assert_eq!(parse_unit_uint("123").unwrap(), 123);
        assert_eq!(parse_unit_uint("1K").unwrap(), 1024);
        assert_eq!(parse_unit_uint("2M").unwrap(), 2 << 20);
        assert_eq!(parse_unit_uint("3g").unwrap(), 3 << 30);
        assert_eq!(parse_unit_uint("1T").unwrap(), 1 << 40);
        assert_eq!(parse_unit_uint(" 32 M ").unwrap(), 32 << 20);
    }

    #[test]
    fn test_parse_unit_uint_rejects() {
        assert!(parse_unit_uint("").is_err());
        assert!(parse_unit_uint("abc").is_err());
        assert!(parse_unit_uint("12X").is_err());
        assert!(parse_unit_uint("-1").is_err());
        assert!(parse_unit_uint("99999999999999999999T").is_err());
    }

    #[test]
    fn test_bool_is_strict() {
        assert_eq!(
            Value::parse(ValueType::Bool, "true", false).unwrap(),
            Value::Bool(true)
        );
        assert!(Value::parse(ValueType::Bool, "True", false).is_err());
        assert!(Value::parse(ValueType::Bool, "1", false).is_err());
        assert!(Value::parse(ValueType::Bool, "yes", false).is_err());
    }

    #[test]
    fn test_split_escaped() {
        assert_eq!(split_escaped("a;b;c", ';'), vec!["a", "b", "c"]);
        assert_eq!(split_escaped("a\\;b;c", ';'), vec!["a;b", "c"]);
        assert_eq!(split_escaped("a; ;b;", ';'), vec!["a", "b"]);
        assert!(split_escaped("", ';').is_empty());
    }

    #[test]
    fn test_list_round_trip() {
        let v = Value::parse(ValueType::List, "echo hi;sleep 1\\;2", false).unwrap();
        assert_eq!(
            v.as_list().unwrap(),
            ["echo hi".to_string(), "sleep 1;2".to_string()]
        );
        let again = Value::parse(ValueType::List, &v.format(), false).unwrap();
        assert_eq!(again, v);
    }

    #[test]
    fn test_parse_uint_map() {
        let m = parse_uint_map("cpu: 10; memory: 4K;").unwrap();
        assert_eq!(m["cpu"], 10);
        assert_eq!(m["memory"], 4096);

        assert!(parse_uint_map("no-colon-here").is_err());
        assert!(parse_uint_map(": 5").is_err());
        assert!(parse_uint_map("k: x").is_err());
    }

    #[test]
    fn test_map_round_trip() {
        let v = Value::parse(ValueType::Map, "a: 1; b: 2", false).unwrap();
        let s = v.format();
        assert_eq!(Value::parse(ValueType::Map, &s, false).unwrap(), v);
    }

    #[test]
    fn test_parse_env_list() {
        let env = parse_env_list("PATH=/bin;MARK=a\\;b").unwrap();
        assert_eq!(env[0], ("PATH".to_string(), "/bin".to_string()));
        assert_eq!(env[1], ("MARK".to_string(), "a;b".to_string()));

        assert!(parse_env_list("NOEQ").is_err());
        assert!(parse_env_list("=value").is_err());
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Uint(5).as_uint(), Some(5));
        assert_eq!(Value::Uint(5).as_int(), None);
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Str("x".into()).as_str(), Some("x"));
    }
}
