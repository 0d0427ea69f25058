//! Disk-backed content store, one per task factory.
//!
//! Layout of a store rooted at `<cache_dir>/checkpoint/<name>`:
//!
//! ```text
//! result/     one record per call key, compressed CBOR of the return value
//! timestamp/  one record per call key, time of the last `save`
//! data/       per-task scratch directories
//! code/       source fingerprint of the factory
//! ```
//!
//! Every namespace maps a [`CallKey`] to a file named after the BLAKE3 hash of
//! the key. The file holds a CBOR record with the key itself (so the key set
//! can be listed) and the stored value. Writes go through a temporary file
//! which is renamed into place, so a single key is never observed half
//! written. A `save` touches two namespaces and is *not* atomic as a whole:
//! a crash between the two writes leaves a result without a timestamp.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use ciborium::Value;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::Config;
use crate::core::{Hash32, Timestamp};
use crate::error::StoreError;
use crate::key::CallKey;

const NS_RESULT: &str = "result";
const NS_TIMESTAMP: &str = "timestamp";
const DIR_DATA: &str = "data";
const FILE_SOURCE: &str = "code/source.txt";

#[derive(Serialize, Deserialize)]
struct Record {
    key: CallKey,
    data: Value,
}

/// A directory of key-addressed records.
#[derive(Debug, Clone)]
struct Namespace {
    name: &'static str,
    dir: Utf8PathBuf,
}

impl Namespace {
    fn open(base: &Utf8Path, name: &'static str) -> Result<Self, StoreError> {
        let dir = base.join(name);
        fs::create_dir_all(&dir)?;
        Ok(Self { name, dir })
    }

    fn path(&self, key: &CallKey) -> Utf8PathBuf {
        self.dir.join(Hash32::hash(key.as_str()).to_hex())
    }

    fn not_found(&self, key: &CallKey) -> StoreError {
        StoreError::KeyNotFound {
            namespace: self.name,
            key: key.clone(),
        }
    }

    fn put(&self, key: &CallKey, data: Value) -> Result<(), StoreError> {
        let record = Record {
            key: key.clone(),
            data,
        };

        let mut temp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            ciborium::into_writer(&record, &mut writer)?;
            writer.flush()?;
        }
        temp.persist(self.path(key)).map_err(|err| err.error)?;

        Ok(())
    }

    fn get(&self, key: &CallKey) -> Result<Value, StoreError> {
        let path = self.path(key);
        let record = match read_record(&path) {
            Err(StoreError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                return Err(self.not_found(key));
            }
            other => other?,
        };

        // the record must belong to this exact key
        if record.key != *key {
            return Err(self.not_found(key));
        }

        Ok(record.data)
    }

    fn contains(&self, key: &CallKey) -> bool {
        self.path(key).is_file()
    }

    fn remove(&self, key: &CallKey) -> Result<(), StoreError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(self.not_found(key)),
            Err(err) => Err(err.into()),
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn keys(&self) -> Result<BTreeSet<CallKey>, StoreError> {
        let mut keys = BTreeSet::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = Utf8PathBuf::try_from(entry.path())
                .map_err(|err| StoreError::Io(err.into_io_error()))?;

            // skip in-flight temporary files
            if path.file_name().is_none_or(|name| name.starts_with('.')) {
                continue;
            }

            match read_record(&path) {
                Ok(record) => {
                    keys.insert(record.key);
                }
                // removed concurrently
                Err(StoreError::Io(err)) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }

        Ok(keys)
    }
}

fn read_record(path: &Utf8Path) -> Result<Record, StoreError> {
    let file = BufReader::new(File::open(path)?);
    Ok(ciborium::from_reader(file)?)
}

/// Persistent cache of one task factory's results and their write times.
#[derive(Debug, Clone)]
pub struct Store {
    name: String,
    base: Utf8PathBuf,
    compress_level: u32,
    result: Namespace,
    timestamp: Namespace,
}

impl Store {
    /// Opens (creating if needed) the store of the factory called `name`.
    ///
    /// `compress_level` ranges from 0 (no compression) to 9 (best).
    pub fn open(config: &Config, name: &str, compress_level: u32) -> Result<Self, StoreError> {
        if !is_plain_name(name) {
            return Err(StoreError::InvalidName(name.to_string()));
        }

        let base = config.store_dir(name);

        let store = Self {
            name: name.to_string(),
            result: Namespace::open(&base, NS_RESULT)?,
            timestamp: Namespace::open(&base, NS_TIMESTAMP)?,
            compress_level: compress_level.min(9),
            base,
        };

        fs::create_dir_all(store.data_directory())?;

        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root directory of this store, also the identity of its factory.
    pub fn path(&self) -> &Utf8Path {
        &self.base
    }

    pub fn data_directory(&self) -> Utf8PathBuf {
        self.base.join(DIR_DATA)
    }

    fn dumps<T>(&self, value: &T) -> Result<Vec<u8>, StoreError>
    where
        T: Serialize,
    {
        let level = Compression::new(self.compress_level);
        let mut encoder = ZlibEncoder::new(Vec::new(), level);
        ciborium::into_writer(value, &mut encoder)?;
        Ok(encoder.finish()?)
    }

    fn loads<T>(&self, data: &[u8]) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
    {
        let mut decoder = ZlibDecoder::new(data);
        let mut buffer = Vec::new();
        decoder.read_to_end(&mut buffer)?;
        Ok(ciborium::from_reader(buffer.as_slice())?)
    }

    /// Writes `value` under `key` and records the current time next to it.
    pub fn save<T>(&self, key: &CallKey, value: &T) -> Result<Timestamp, StoreError>
    where
        T: Serialize,
    {
        let data = self.dumps(value)?;
        self.result.put(key, Value::Bytes(data))?;

        let timestamp = Timestamp::now();
        self.timestamp.put(key, Value::Float(timestamp.as_secs()))?;

        Ok(timestamp)
    }

    pub fn load<T>(&self, key: &CallKey) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
    {
        match self.result.get(key)? {
            Value::Bytes(data) => self.loads(&data),
            _ => Err(StoreError::Corrupt(self.result.path(key))),
        }
    }

    pub fn load_timestamp(&self, key: &CallKey) -> Result<Timestamp, StoreError> {
        match self.timestamp.get(key)? {
            Value::Float(secs) => Ok(Timestamp::from_secs(secs)),
            _ => Err(StoreError::Corrupt(self.timestamp.path(key))),
        }
    }

    /// Like [`load_timestamp`](Self::load_timestamp), with a missing entry
    /// mapped to `None`.
    pub fn peek_timestamp(&self, key: &CallKey) -> Result<Option<Timestamp>, StoreError> {
        match self.load_timestamp(key) {
            Ok(timestamp) => Ok(Some(timestamp)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn contains(&self, key: &CallKey) -> bool {
        self.result.contains(key)
    }

    /// Removes both the result and the timestamp of `key`.
    pub fn delete(&self, key: &CallKey) -> Result<(), StoreError> {
        self.result.remove(key)?;
        self.timestamp.remove(key)?;
        Ok(())
    }

    /// Empties this store, leaving other factories' stores untouched.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.result.clear()?;
        self.timestamp.clear()?;

        let data = self.data_directory();
        if data.exists() {
            fs::remove_dir_all(&data)?;
        }
        fs::create_dir_all(&data)?;

        Ok(())
    }

    pub fn list_keys(&self) -> Result<BTreeSet<CallKey>, StoreError> {
        self.result.keys()
    }

    /// Records the factory's source fingerprint and returns the time it last
    /// changed. The file is rewritten only when the fingerprint differs, so
    /// its modification time marks the most recent change.
    pub fn update_source_if_necessary(&self, source: &str) -> Result<Timestamp, StoreError> {
        let path = self.base.join(FILE_SOURCE);

        let cached = match fs::read_to_string(&path) {
            Ok(cached) => Some(cached),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        if cached.as_deref() != Some(source) {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&path, source)?;
            tracing::debug!("source of '{}' changed", self.name);
        }

        let modified: SystemTime = fs::metadata(&path)?.modified()?;
        Ok(Timestamp::from(modified))
    }
}

// A store must map to exactly one directory below the checkpoint root.
fn is_plain_name(name: &str) -> bool {
    !matches!(name, "" | "." | "..") && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, name: &str, level: u32) -> Store {
        let config = Config::default().with_cache_dir(Utf8Path::from_path(dir.path()).unwrap());
        Store::open(&config, name, level).unwrap()
    }

    fn key(raw: &str) -> CallKey {
        CallKey::from_raw(raw)
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "tests.round_trip", 0);

        let mut value = HashMap::new();
        value.insert("a".to_string(), vec![1.5, 2.5]);

        let ts = store.save(&key(r#"{"x":1}"#), &value).unwrap();
        let back: HashMap<String, Vec<f64>> = store.load(&key(r#"{"x":1}"#)).unwrap();

        assert_eq!(back, value);
        assert_eq!(store.load_timestamp(&key(r#"{"x":1}"#)).unwrap(), ts);
        assert!(store.contains(&key(r#"{"x":1}"#)));
    }

    #[test]
    fn test_round_trip_compressed() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "tests.compressed", 9);

        let value = "a".repeat(10_000);
        store.save(&key("{}"), &value).unwrap();

        let back: String = store.load(&key("{}")).unwrap();
        assert_eq!(back, value);

        let size = fs::metadata(store.result.path(&key("{}"))).unwrap().len();
        assert!(size < 1_000, "expected compressed record, got {size} bytes");
    }

    #[test]
    fn test_missing_key() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "tests.missing", 0);

        assert!(store.load::<i32>(&key("{}")).unwrap_err().is_not_found());
        assert!(store.load_timestamp(&key("{}")).unwrap_err().is_not_found());
        assert!(store.delete(&key("{}")).unwrap_err().is_not_found());
        assert_eq!(store.peek_timestamp(&key("{}")).unwrap(), None);
        assert!(!store.contains(&key("{}")));
    }

    #[test]
    fn test_delete_removes_both_entries() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "tests.delete", 0);

        store.save(&key(r#"{"x":1}"#), &1).unwrap();
        store.delete(&key(r#"{"x":1}"#)).unwrap();

        assert!(!store.contains(&key(r#"{"x":1}"#)));
        assert_eq!(store.peek_timestamp(&key(r#"{"x":1}"#)).unwrap(), None);
    }

    #[test]
    fn test_delete_without_timestamp_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "tests.partial", 0);

        // Simulates a crash between the two writes of `save`.
        store.save(&key("{}"), &1).unwrap();
        store.timestamp.remove(&key("{}")).unwrap();

        let err = store.delete(&key("{}")).unwrap_err();
        assert!(matches!(err, StoreError::KeyNotFound { namespace: "timestamp", .. }));
    }

    #[test]
    fn test_list_keys_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "tests.list", 0);
        let other = open(&dir, "tests.other", 0);

        store.save(&key(r#"{"x":1}"#), &1).unwrap();
        store.save(&key(r#"{"x":2}"#), &2).unwrap();
        other.save(&key(r#"{"x":1}"#), &1).unwrap();

        let keys = store.list_keys().unwrap();
        assert_eq!(
            keys.into_iter().map(|k| k.to_string()).collect::<Vec<_>>(),
            vec![r#"{"x":1}"#, r#"{"x":2}"#]
        );

        fs::write(store.data_directory().join("junk"), b"junk").unwrap();
        store.clear().unwrap();

        assert!(store.list_keys().unwrap().is_empty());
        assert_eq!(store.peek_timestamp(&key(r#"{"x":1}"#)).unwrap(), None);
        assert!(store.data_directory().is_dir());
        assert!(!store.data_directory().join("junk").exists());
        // Other stores are unaffected.
        assert!(other.contains(&key(r#"{"x":1}"#)));
    }

    #[test]
    fn test_overwrite_refreshes_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "tests.overwrite", 0);

        let first = store.save(&key("{}"), &1).unwrap();
        let second = store.save(&key("{}"), &2).unwrap();

        assert!(second >= first);
        assert_eq!(store.load::<i32>(&key("{}")).unwrap(), 2);
    }

    #[test]
    fn test_source_fingerprint() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "tests.source", 0);

        let first = store.update_source_if_necessary("v1").unwrap();
        let again = store.update_source_if_necessary("v1").unwrap();
        assert_eq!(first, again);

        let changed = store.update_source_if_necessary("v2").unwrap();
        assert!(changed >= first);
        assert_eq!(
            fs::read_to_string(store.path().join(FILE_SOURCE)).unwrap(),
            "v2"
        );
    }

    #[test]
    fn test_nested_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let config = Config::default().with_cache_dir(Utf8Path::from_path(dir.path()).unwrap());

        for name in ["outer/data", "..", ".", "", "a\\b", "../escape"] {
            let err = Store::open(&config, name, 0).unwrap_err();
            assert!(matches!(err, StoreError::InvalidName(ref n) if n == name));
        }

        assert!(!config.checkpoint_dir().join("outer").exists());
        assert!(Store::open(&config, "demo::square", 0).is_ok());
    }
}
