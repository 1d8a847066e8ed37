use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use agenthost_core::session::SessionRecord;

use crate::backend::{SessionBackend, StoreError};

/// One `<encoded-id>.json` file per session under `save_dir`.
pub struct JsonFileBackend {
    save_dir: PathBuf,
    write_seq: AtomicU64,
}

impl JsonFileBackend {
    /// Creates `save_dir` if needed.
    pub async fn open(save_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let save_dir = save_dir.into();
        fs::create_dir_all(&save_dir)
            .await
            .map_err(|source| StoreError::Io { path: save_dir.clone(), source })?;
        Ok(Self { save_dir, write_seq: AtomicU64::new(0) })
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn record_path(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.save_dir.join(format!("{}.json", encode_file_stem(session_id)?)))
    }

    fn temp_path(&self, stem: &str) -> PathBuf {
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        self.save_dir.join(format!(".{stem}.{}-{seq}.tmp", std::process::id()))
    }
}

/// Longest file stem handed out, leaving room for the temp-file affixes
/// within the common 255-byte file name limit.
pub const MAX_FILE_STEM_BYTES: usize = 200;

/// Maps an arbitrary session id onto a safe file stem.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes
/// `%XX`, so distinct ids never share a file and no id can escape `save_dir`.
/// Ids whose encoding exceeds [`MAX_FILE_STEM_BYTES`] are rejected.
pub fn encode_file_stem(session_id: &str) -> Result<String, StoreError> {
    let mut encoded = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    if encoded.len() > MAX_FILE_STEM_BYTES {
        return Err(StoreError::InvalidSessionId {
            backend: "json",
            reason: format!(
                "id of {} bytes encodes to a {}-byte file name, the limit is {MAX_FILE_STEM_BYTES}",
                session_id.len(),
                encoded.len()
            ),
        });
    }
    Ok(encoded)
}

async fn write_atomically(temp: &Path, target: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(temp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(temp, target).await
}

#[async_trait::async_trait]
impl SessionBackend for JsonFileBackend {
    fn kind(&self) -> &'static str {
        "json"
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let path = self.record_path(session_id)?;
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        serde_json::from_slice(&raw).map(Some).map_err(|error| {
            StoreError::Decode(format!("invalid session file `{}`: {error}", path.display()))
        })
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let contents = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Encode {
            session_id: record.session_id.clone(),
            source,
        })?;
        let stem = encode_file_stem(&record.session_id)?;
        let target = self.save_dir.join(format!("{stem}.json"));
        let temp = self.temp_path(&stem);

        if let Err(source) = write_atomically(&temp, &target, &contents).await {
            let _ = fs::remove_file(&temp).await;
            return Err(StoreError::Io { path: target, source });
        }
        Ok(())
    }

    async fn exists(&self, session_id: &str) -> Result<bool, StoreError> {
        let path = self.record_path(session_id)?;
        fs::try_exists(&path).await.map_err(|source| StoreError::Io { path, source })
    }

    async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        let path = self.record_path(session_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use agenthost_core::session::{SessionRecord, SessionState};

    use super::{encode_file_stem, JsonFileBackend, MAX_FILE_STEM_BYTES};
    use crate::backend::{SessionBackend, StoreError};

    fn state_with(key: &str, value: serde_json::Value) -> SessionState {
        let mut state = SessionState::new();
        state.insert(key, value);
        state
    }

    #[test]
    fn file_stem_encoding_is_injective_and_path_safe() {
        let stem = |id: &str| encode_file_stem(id).expect("stem");
        assert_eq!(stem("user-42_a"), "user-42_a");
        assert_eq!(stem("../etc/passwd"), "%2E%2E%2Fetc%2Fpasswd");
        assert_ne!(stem("a/b"), stem("a_b"));
        assert_ne!(stem("a%2Fb"), stem("a/b"));
    }

    #[tokio::test]
    async fn overlong_session_id_is_rejected_before_touching_disk() {
        let dir = TempDir::new().expect("tempdir");
        let backend = JsonFileBackend::open(dir.path()).await.expect("open");

        assert!(encode_file_stem(&"a".repeat(MAX_FILE_STEM_BYTES)).is_ok());
        // Escaped bytes count three times toward the limit.
        let long_id = "é".repeat(40);

        let error = backend
            .save(&SessionRecord::new(long_id.as_str(), SessionState::new()))
            .await
            .expect_err("must fail");
        assert!(matches!(error, StoreError::InvalidSessionId { backend: "json", .. }));
        assert_eq!(error.code().as_str(), "INVALID_REQUEST");
        assert!(matches!(backend.load(&long_id).await, Err(StoreError::InvalidSessionId { .. })));
        assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 0);
    }

    #[tokio::test]
    async fn missing_session_loads_as_none() {
        let dir = TempDir::new().expect("tempdir");
        let backend = JsonFileBackend::open(dir.path()).await.expect("open");

        assert!(backend.load("nobody").await.expect("load").is_none());
        assert!(!backend.exists("nobody").await.expect("exists"));
        assert!(!backend.delete("nobody").await.expect("delete"));
    }

    #[tokio::test]
    async fn saved_record_is_readable_and_leaves_no_temp_files() {
        let dir = TempDir::new().expect("tempdir");
        let backend = JsonFileBackend::open(dir.path().join("nested")).await.expect("open");

        let record = SessionRecord::new("chat/1", state_with("memory", json!(["hi"])));
        backend.save(&record).await.expect("save");

        let loaded = backend.load("chat/1").await.expect("load").expect("record");
        assert_eq!(loaded, record);
        assert!(backend.exists("chat/1").await.expect("exists"));

        let entries: Vec<_> = std::fs::read_dir(backend.save_dir())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["chat%2F1.json".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_decode_error() {
        let dir = TempDir::new().expect("tempdir");
        let backend = JsonFileBackend::open(dir.path()).await.expect("open");
        std::fs::write(backend.record_path("broken").expect("path"), b"{not json").expect("write");

        let error = backend.load("broken").await.expect_err("must fail");
        assert!(matches!(error, StoreError::Decode(_)));
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_record() {
        let dir = TempDir::new().expect("tempdir");
        let backend = JsonFileBackend::open(dir.path()).await.expect("open");
        let original = SessionRecord::new("s1", state_with("turns", json!(1)));
        backend.save(&original).await.expect("save");

        let mut permissions = std::fs::metadata(dir.path()).expect("metadata").permissions();
        permissions.set_readonly(true);
        std::fs::set_permissions(dir.path(), permissions.clone()).expect("set readonly");

        let updated = SessionRecord::new("s1", state_with("turns", json!(2)));
        let result = backend.save(&updated).await;

        permissions.set_readonly(false);
        std::fs::set_permissions(dir.path(), permissions).expect("restore permissions");

        // Running as root ignores directory permissions; only assert when the write failed.
        if result.is_err() {
            let loaded = backend.load("s1").await.expect("load").expect("record");
            assert_eq!(loaded.state.get("turns"), Some(&json!(1)));
        }
    }
}
