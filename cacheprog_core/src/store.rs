//! Content-addressed storage of build outputs.

use crate::error::{Error, Result};
use crate::hash::validate_hex;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Directory holding `<action hex>` files whose content is an output hex.
pub const ACTIONS_DIR: &str = "actions";
/// Directory holding `<output hex>` files whose content is the artifact.
pub const OUTPUTS_DIR: &str = "outputs";

/// Storage backend behind the request dispatcher.
///
/// Keys are lowercase hex strings. Absence is never an error: `get` reports
/// it as `Ok(None)`.
pub trait CacheStorage: Send + Sync {
    /// Resolve an action to the path of its output blob.
    ///
    /// Returns `None` when no mapping exists or the mapped blob is missing.
    fn get(&self, action_id: &str) -> Result<Option<PathBuf>>;

    /// Store `content` under `output_id` and map `action_id` to it.
    ///
    /// Returns the path of the output blob.
    fn put(&self, action_id: &str, output_id: &str, content: &mut dyn Read) -> Result<PathBuf>;

    /// Release any resources held by the backend.
    fn close(&self) -> Result<()>;
}

/// A filesystem-backed store.
///
/// Layout:
/// - `actions/<action hex>` maps an action to an output (file content is
///   the output hex)
/// - `outputs/<output hex>` holds the raw output bytes
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    actions: PathBuf,
    outputs: PathBuf,
}

impl DiskStore {
    /// Open a store at the given path, creating the directory structure if
    /// needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;

        // Returned blob paths are handed to the client, so they must be absolute
        let root = fs::canonicalize(root)?;
        let actions = root.join(ACTIONS_DIR);
        let outputs = root.join(OUTPUTS_DIR);
        fs::create_dir_all(&actions)?;
        fs::create_dir_all(&outputs)?;

        Ok(Self {
            root,
            actions,
            outputs,
        })
    }

    /// Get the root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path of the mapping file for an action.
    pub fn action_path(&self, action_id: &str) -> Result<PathBuf> {
        validate_hex(action_id)?;
        Ok(self.actions.join(action_id))
    }

    /// Get the path of the blob for an output.
    pub fn output_path(&self, output_id: &str) -> Result<PathBuf> {
        validate_hex(output_id)?;
        Ok(self.outputs.join(output_id))
    }

    /// Read the output hex an action maps to.
    fn read_mapping(&self, action_id: &str) -> Result<Option<String>> {
        let path = self.action_path(action_id)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let output_id = content.trim();
        validate_hex(output_id).map_err(|e| Error::corrupted_mapping(&path, e.to_string()))?;
        Ok(Some(output_id.to_string()))
    }

    /// Write a blob. Losing a create race to another writer of the same
    /// output is fine, since both wrote identical bytes.
    fn write_blob(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut temp_file = temp_file_in(&self.outputs)?;
        temp_file.write_all(data)?;
        temp_file.flush()?;

        match temp_file.persist_noclobber(path) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "blob written concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the mapping for an action with a rename, so readers see either
    /// the old or the new output id.
    fn write_mapping(&self, action_id: &str, output_id: &str) -> Result<()> {
        let path = self.action_path(action_id)?;
        let mut temp_file = temp_file_in(&self.actions)?;
        temp_file.write_all(output_id.as_bytes())?;
        temp_file.flush()?;
        temp_file.persist(&path)?;
        Ok(())
    }
}

/// Temp files start out private to the owner; cache entries are not.
fn temp_file_in(dir: &Path) -> Result<NamedTempFile> {
    let temp_file = NamedTempFile::new_in(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp_file
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))?;
    }
    Ok(temp_file)
}

impl CacheStorage for DiskStore {
    fn get(&self, action_id: &str) -> Result<Option<PathBuf>> {
        let Some(output_id) = self.read_mapping(action_id)? else {
            debug!(action_id, "no mapping");
            return Ok(None);
        };

        let output_path = self.output_path(&output_id)?;
        match fs::metadata(&output_path) {
            Ok(_) => Ok(Some(output_path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(action_id, output_id = %output_id, "mapped blob is missing");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, action_id: &str, output_id: &str, content: &mut dyn Read) -> Result<PathBuf> {
        let mapping_path = self.action_path(action_id)?;
        let output_path = self.output_path(output_id)?;

        // Existing blobs are trusted as-is; the content reader is left untouched
        if output_path.exists() {
            debug!(output_id, "blob already stored");
        } else {
            let mut data = Vec::new();
            content.read_to_end(&mut data)?;
            self.write_blob(&output_path, &data)?;
            debug!(output_id, size = data.len(), "stored blob");
        }

        // The blob is in place before the mapping can point at it
        self.write_mapping(action_id, output_id)?;
        debug!(mapping = %mapping_path.display(), output_id, "updated mapping");

        Ok(output_path)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Reader that fails the test if anything reads from it.
    struct Untouchable;

    impl Read for Untouchable {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            panic!("content reader must not be consumed");
        }
    }

    fn output_id_of(data: &[u8]) -> String {
        blake3::hash(data).to_hex().to_string()
    }

    #[test]
    fn test_store_open_creates_layout() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("nested").join("cache");
        let store = DiskStore::open(&root).unwrap();

        assert!(store.root().is_absolute());
        assert!(root.join(ACTIONS_DIR).is_dir());
        assert!(root.join(OUTPUTS_DIR).is_dir());

        // Opening again is fine
        DiskStore::open(&root).unwrap();
    }

    #[test]
    fn test_put_then_get() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::open(temp_dir.path()).unwrap();

        let data = b"compiled object";
        let output_id = output_id_of(data);
        let path = store.put("616263", &output_id, &mut &data[..]).unwrap();

        assert!(path.is_absolute());
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), output_id);
        assert_eq!(fs::read(&path).unwrap(), data);

        let mapping = fs::read_to_string(store.action_path("616263").unwrap()).unwrap();
        assert_eq!(mapping, output_id);

        assert_eq!(store.get("616263").unwrap(), Some(path));
    }

    #[test]
    fn test_get_unknown_action_is_miss() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::open(temp_dir.path()).unwrap();

        assert_eq!(store.get("deadbeef").unwrap(), None);
    }

    #[test]
    fn test_get_missing_blob_is_miss() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::open(temp_dir.path()).unwrap();

        let path = store.put("01", "02", &mut &b"data"[..]).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(store.get("01").unwrap(), None);
    }

    #[test]
    fn test_get_trims_mapping_whitespace() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::open(temp_dir.path()).unwrap();

        let path = store.put("aa", "bb", &mut &b"data"[..]).unwrap();
        fs::write(store.action_path("aa").unwrap(), "bb\n").unwrap();

        assert_eq!(store.get("aa").unwrap(), Some(path));
    }

    #[test]
    fn test_get_corrupted_mapping() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::open(temp_dir.path()).unwrap();

        fs::write(store.action_path("aa").unwrap(), "../../etc/passwd").unwrap();

        let err = store.get("aa").unwrap_err();
        assert!(matches!(err, Error::CorruptedMapping { .. }));
    }

    #[test]
    fn test_get_unreadable_mapping_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::open(temp_dir.path()).unwrap();

        // A directory where the mapping file should be cannot be read as text
        fs::create_dir(store.action_path("aa").unwrap()).unwrap();

        assert!(matches!(store.get("aa"), Err(Error::Io { .. })));
    }

    #[test]
    fn test_put_existing_blob_skips_write() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::open(temp_dir.path()).unwrap();

        let data = b"shared output";
        let output_id = output_id_of(data);
        let first = store.put("01", &output_id, &mut &data[..]).unwrap();
        let second = store.put("02", &output_id, &mut Untouchable).unwrap();

        assert_eq!(first, second);
        assert_eq!(fs::read(&second).unwrap(), data);

        // Both actions resolve to the shared blob
        assert_eq!(store.get("01").unwrap(), Some(first.clone()));
        assert_eq!(store.get("02").unwrap(), Some(first));
    }

    #[test]
    fn test_put_last_mapping_wins() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::open(temp_dir.path()).unwrap();

        store.put("0a", "01", &mut &b"one"[..]).unwrap();
        let second = store.put("0a", "02", &mut &b"two"[..]).unwrap();

        let resolved = store.get("0a").unwrap().unwrap();
        assert_eq!(resolved, second);
        assert_eq!(fs::read(resolved).unwrap(), b"two");
    }

    #[test]
    fn test_put_empty_content() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::open(temp_dir.path()).unwrap();

        let path = store.put("01", "00", &mut io::empty()).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(store.get("01").unwrap(), Some(path));
    }

    #[test]
    fn test_put_rejects_invalid_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::open(temp_dir.path()).unwrap();

        assert!(matches!(
            store.put("", "01", &mut &b"x"[..]),
            Err(Error::InvalidKey { .. })
        ));
        assert!(matches!(
            store.put("01", "../x", &mut &b"x"[..]),
            Err(Error::InvalidKey { .. })
        ));
        assert!(matches!(store.get("a/b"), Err(Error::InvalidKey { .. })));

        // Nothing leaked into the store
        assert_eq!(fs::read_dir(store.root().join(OUTPUTS_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::open(temp_dir.path()).unwrap();

        store.put("01", "02", &mut &b"data"[..]).unwrap();
        store.put("01", "03", &mut &b"more"[..]).unwrap();

        let actions: Vec<_> = fs::read_dir(store.root().join(ACTIONS_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(actions, vec!["01".to_string()]);
        assert_eq!(fs::read_dir(store.root().join(OUTPUTS_DIR)).unwrap().count(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_entries_readable_by_others() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::open(temp_dir.path()).unwrap();
        let blob = store.put("01", "02", &mut &b"data"[..]).unwrap();
        let mapping = store.action_path("01").unwrap();

        for path in [blob, mapping] {
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644, "{}", path.display());
        }
    }

    #[test]
    fn test_concurrent_puts_same_output() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::open(temp_dir.path()).unwrap();

        let data = b"raced output";
        let output_id = output_id_of(data);
        std::thread::scope(|scope| {
            for i in 0..8u8 {
                let store = &store;
                let output_id = &output_id;
                scope.spawn(move || {
                    let action_id = hex::encode([i]);
                    store.put(&action_id, output_id, &mut &data[..]).unwrap();
                });
            }
        });

        for i in 0..8u8 {
            let path = store.get(&hex::encode([i])).unwrap().unwrap();
            assert_eq!(fs::read(path).unwrap(), data);
        }
    }

    #[test]
    fn test_close_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::open(temp_dir.path()).unwrap();
        store.close().unwrap();
    }

    // Property-based tests
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// A put is always readable back through its action.
        #[test]
        fn prop_put_get_roundtrip(
            action in prop::collection::vec(any::<u8>(), 1..32),
            content in prop::collection::vec(any::<u8>(), 0..4096)
        ) {
            let temp_dir = TempDir::new().unwrap();
            let store = DiskStore::open(temp_dir.path())?;

            let action_id = hex::encode(&action);
            let output_id = output_id_of(&content);
            store.put(&action_id, &output_id, &mut content.as_slice())?;

            let path = store.get(&action_id)?;
            prop_assert!(path.is_some());
            prop_assert_eq!(fs::read(path.unwrap()).unwrap(), content);
        }

        /// The latest put for an action decides what it resolves to.
        #[test]
        fn prop_last_mapping_wins(
            first in prop::collection::vec(any::<u8>(), 0..256),
            second in prop::collection::vec(any::<u8>(), 0..256)
        ) {
            let temp_dir = TempDir::new().unwrap();
            let store = DiskStore::open(temp_dir.path())?;

            store.put("ab", &output_id_of(&first), &mut first.as_slice())?;
            store.put("ab", &output_id_of(&second), &mut second.as_slice())?;

            let path = store.get("ab")?.unwrap();
            prop_assert_eq!(fs::read(path).unwrap(), second);
        }
    }
}
