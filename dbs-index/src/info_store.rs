use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use serde::de::DeserializeOwned;
use serde::Serialize;

use dbs_tools::fs::{create_dir, replace_file};

/// Small persistent key → typed-record map.
///
/// One JSON file per key, written with atomic replace. Holds the container
/// storage header, the container trackers and statistics snapshots; nothing
/// here is on a hot path.
pub struct InfoStore {
    dir: PathBuf,
    file_mode: u32,
}

fn check_key(key: &str) -> Result<(), Error> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        bail!("invalid info store key {key:?}");
    }
    Ok(())
}

impl InfoStore {
    pub fn open<P: AsRef<Path>>(dir: P, dir_mode: u32, file_mode: u32) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        create_dir(&dir, dir_mode)?;
        Ok(Self { dir, file_mode })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let mut path = self.dir.clone();
        path.push(format!("{key}.json"));
        path
    }

    pub fn set<T: Serialize>(&self, key: &str, record: &T) -> Result<(), Error> {
        check_key(key)?;
        let data = serde_json::to_vec_pretty(record)?;
        replace_file(self.record_path(key), &data, self.file_mode, true)
            .map_err(|err| format_err!("unable to persist info record '{key}' - {err}"))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        check_key(key)?;
        let path = self.record_path(key);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => bail!("unable to read info record '{key}' - {err}"),
        };
        let record = serde_json::from_slice(&data)
            .map_err(|err| format_err!("info record '{key}' is damaged - {err}"))?;
        Ok(Some(record))
    }

    pub fn remove(&self, key: &str) -> Result<bool, Error> {
        check_key(key)?;
        match std::fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => bail!("unable to remove info record '{key}' - {err}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Header {
        last_id: u64,
        name: String,
    }

    #[test]
    fn record_roundtrip() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("dbs-info-store-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let store = InfoStore::open(&dir, 0o750, 0o640).unwrap();
        assert_eq!(store.get::<Header>("header").unwrap(), None);

        let header = Header {
            last_id: 42,
            name: "test".to_string(),
        };
        store.set("header", &header).unwrap();
        assert_eq!(store.get::<Header>("header").unwrap(), Some(header));

        assert!(store.remove("header").unwrap());
        assert!(!store.remove("header").unwrap());

        assert!(store.set("Bad Key", &1u32).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
