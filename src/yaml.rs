//! YAML helpers shared by status persistence, configuration and the wire
//! protocol.
//!
//! The framework speaks a single YAML flavor everywhere: plain scalars,
//! sequences and mappings, with dense `f64` sequences treated specially where
//! size matters (status files store them inline; the remote protocol moves
//! them through a binary side channel, see `remote::protocol`).

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::Result;

pub use serde_yaml::Value;

/// Mapping shorthand used when building values by hand.
pub fn mapping(entries: Vec<(&str, Value)>) -> Value {
    let mut map = serde_yaml::Mapping::new();
    for (key, value) in entries {
        map.insert(Value::String(key.to_string()), value);
    }
    Value::Mapping(map)
}

/// Interprets a value as a dense `f64` sequence. Returns `None` for anything
/// that is not a sequence of numbers.
pub fn as_f64_array(value: &Value) -> Option<Vec<f64>> {
    let seq = value.as_sequence()?;
    let mut out = Vec::with_capacity(seq.len());
    for item in seq {
        out.push(item.as_f64()?);
    }
    Some(out)
}

/// Builds a YAML sequence from a dense `f64` array.
pub fn f64_array(values: &[f64]) -> Value {
    Value::Sequence(values.iter().map(|v| Value::from(*v)).collect())
}

/// Serializes `value` and writes it to `path` atomically: the document goes
/// to a sibling temp file first and is renamed into place, so readers never
/// observe a half-written file.
pub fn atomic_dump<T: serde::Serialize>(value: &T, path: &Path) -> Result<()> {
    let text = serde_yaml::to_string(value)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Loads a YAML document from `path`.
pub fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn f64_array_roundtrip() {
        let values = vec![0.0, 1.5, -3.25, 1e9];
        let yaml = f64_array(&values);
        assert_eq!(as_f64_array(&yaml), Some(values));
    }

    #[test]
    fn non_numeric_sequence_is_not_an_array() {
        let yaml: Value = serde_yaml::from_str("[1.0, two, 3.0]").unwrap();
        assert_eq!(as_f64_array(&yaml), None);
        assert_eq!(as_f64_array(&Value::String("x".into())), None);
    }

    #[test]
    fn atomic_dump_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("counter.status.yml");

        let value = mapping(vec![("count", Value::from(7)), ("label", Value::from("run-3"))]);
        atomic_dump(&value, &path).unwrap();

        let loaded: Value = load(&path).unwrap();
        assert_eq!(loaded, value);
        assert!(!path.with_extension("tmp").exists());
    }
}
