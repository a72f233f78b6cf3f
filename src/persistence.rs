//! Persistence
//!
//! JSON save/load shared by models, configs and the calibration record. Every
//! write goes to a sibling temporary file that is renamed over the destination,
//! so a reader sees either the old file or the complete new one.
use crate::errors::PriceboundError;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

fn temporary_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "pricebound".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to `path` through a temporary file and a rename.
pub fn write_atomic<P: AsRef<Path>>(path: P, bytes: &[u8]) -> Result<(), PriceboundError> {
    let path = path.as_ref();
    let tmp = temporary_sibling(path);
    let result = (|| -> std::io::Result<()> {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(PriceboundError::UnableToWrite(format!("{}: {}", path.display(), e)));
    }
    Ok(())
}

/// JSON has no NaN, serde_json writes it as `null`; read `null` back as NaN.
pub(crate) fn parse_missing<'de, D>(d: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Deserialize::deserialize(d).map(|x: Option<_>| x.unwrap_or(f64::NAN))
}

/// IO
pub trait JsonIO: Serialize + DeserializeOwned + Sized {
    /// Save as a json object to a file.
    ///
    /// * `path` - Path to save to.
    fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), PriceboundError> {
        write_atomic(path, self.json_dump()?.as_bytes())
    }

    /// Dump as a json object
    fn json_dump(&self) -> Result<String, PriceboundError> {
        serde_json::to_string_pretty(self).map_err(|e| PriceboundError::UnableToWrite(e.to_string()))
    }

    /// Load from a json string.
    ///
    /// * `json_str` - String object, which can be deserialized from json.
    fn from_json(json_str: &str) -> Result<Self, PriceboundError> {
        serde_json::from_str::<Self>(json_str).map_err(|e| PriceboundError::UnableToRead(e.to_string()))
    }

    /// Load from a path to a json object.
    ///
    /// * `path` - Path to load from.
    fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, PriceboundError> {
        let path = path.as_ref();
        let json_str = fs::read_to_string(path)
            .map_err(|e| PriceboundError::UnableToRead(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Record {
        factor: f64,
        name: String,
    }
    impl JsonIO for Record {}

    #[test]
    fn test_json_round_trip_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("record.json");
        let r = Record {
            factor: 1.2345678901234567,
            name: "x".to_string(),
        };
        r.save_json(&path).unwrap();
        assert!(!temporary_sibling(&path).exists());
        let r2 = Record::load_json(&path).unwrap();
        assert_eq!(r, r2);
    }

    #[derive(Serialize, Deserialize)]
    struct WithMissing {
        #[serde(deserialize_with = "parse_missing")]
        value: f64,
    }
    impl JsonIO for WithMissing {}

    #[test]
    fn test_nan_survives_round_trip() {
        let dumped = WithMissing { value: f64::NAN }.json_dump().unwrap();
        assert!(WithMissing::from_json(&dumped).unwrap().value.is_nan());
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.txt");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        match Record::load_json(dir.path().join("nope.json")) {
            Err(PriceboundError::UnableToRead(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_write_into_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("out.json");
        assert!(matches!(
            write_atomic(&path, b"{}"),
            Err(PriceboundError::UnableToWrite(_))
        ));
    }
}
