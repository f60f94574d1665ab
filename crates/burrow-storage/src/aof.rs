//! Append-only log backend.
//!
//! Every successful mutation is appended to a newline-delimited JSON file and
//! the whole file is replayed into a fresh [`MemoryIndex`] on startup. One
//! line holds exactly one populated mutation field:
//!
//! ```text
//! {"user_create": {"id": 1}}
//! {"short_url_create": {"id": "abc", "original_url": "https://x.com", "user_id": 1}}
//! {"short_url_delete": {"user_id": 1, "ids": ["abc"]}}
//! ```
//!
//! Mutations are applied to the index first and appended second, both under
//! the index's exclusive lock. A failed append rolls the index back, so the
//! in-memory state never runs ahead of what is on disk.

use crate::memory::{IndexState, MemoryIndex};
use crate::pipeline::{DeletePipeline, SoftDelete};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use burrow_core::{ReadRepository, Repository, Result, ShortUrl, StorageError, User, UserId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};
use typed_builder::TypedBuilder;

/// Settings for [`LogRepository::open`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct LogConfig {
    /// Log file location; created if missing.
    #[builder(setter(into))]
    pub path: PathBuf,
    /// `fsync` after every append.
    #[builder(default = true)]
    pub fsync: bool,
    /// Batch-delete worker lanes.
    #[builder(default = num_cpus::get())]
    pub lanes: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_create: Option<UserCreateRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    short_url_create: Option<ShortUrlCreateRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    short_url_delete: Option<ShortUrlDeleteRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct UserCreateRecord {
    id: UserId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShortUrlCreateRecord {
    id: String,
    original_url: String,
    user_id: UserId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShortUrlDeleteRecord {
    user_id: UserId,
    ids: Vec<String>,
}

/// A decoded log line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mutation {
    UserCreate(User),
    ShortUrlCreate(ShortUrl),
    ShortUrlDelete { owner_id: UserId, ids: Vec<String> },
}

impl From<&Mutation> for LogRecord {
    fn from(mutation: &Mutation) -> Self {
        match mutation {
            Mutation::UserCreate(user) => LogRecord {
                user_create: Some(UserCreateRecord { id: user.id }),
                ..LogRecord::default()
            },
            Mutation::ShortUrlCreate(short_url) => LogRecord {
                short_url_create: Some(ShortUrlCreateRecord {
                    id: short_url.id.clone(),
                    original_url: short_url.original_url.clone(),
                    user_id: short_url.user_id,
                }),
                ..LogRecord::default()
            },
            Mutation::ShortUrlDelete { owner_id, ids } => LogRecord {
                short_url_delete: Some(ShortUrlDeleteRecord {
                    user_id: *owner_id,
                    ids: ids.clone(),
                }),
                ..LogRecord::default()
            },
        }
    }
}

impl LogRecord {
    fn into_mutation(self) -> std::result::Result<Mutation, String> {
        match (self.user_create, self.short_url_create, self.short_url_delete) {
            (Some(user), None, None) => Ok(Mutation::UserCreate(User::with_id(user.id))),
            (None, Some(url), None) => Ok(Mutation::ShortUrlCreate(ShortUrl::new(
                url.id,
                url.original_url,
                url.user_id,
            ))),
            (None, None, Some(delete)) => Ok(Mutation::ShortUrlDelete {
                owner_id: delete.user_id,
                ids: delete.ids,
            }),
            (None, None, None) => Err("record carries no mutation".to_string()),
            _ => Err("record carries more than one mutation".to_string()),
        }
    }
}

fn decode_line(line_no: usize, line: &str) -> Result<Mutation> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| StorageError::LogRead(format!("line {line_no}: {e}")))?;
    let record: LogRecord = serde_json::from_value(value)
        .map_err(|e| StorageError::LogStructure(format!("line {line_no}: {e}")))?;
    record
        .into_mutation()
        .map_err(|e| StorageError::LogStructure(format!("line {line_no}: {e}")))
}

fn encode(mutation: &Mutation) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(&LogRecord::from(mutation))
        .map_err(|e| StorageError::LogWrite(format!("failed to encode record: {e}")))?;
    line.push(b'\n');
    Ok(line)
}

/// Destination of encoded log lines.
pub(crate) trait LogSink: Send {
    /// Appends one complete line. On error nothing must have been persisted.
    fn append(&mut self, line: &[u8]) -> io::Result<()>;
}

/// File operations [`FileSink`] relies on besides writing.
pub(crate) trait LogFile: Write + Send {
    fn sync_data(&self) -> io::Result<()>;
    fn set_len(&self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn sync_data(&self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

struct FileSink<F = File> {
    file: F,
    /// Length of the file up to the last complete line.
    len: u64,
    fsync: bool,
    /// Set once a torn line could not be cut off; every later append fails.
    poisoned: bool,
}

impl<F: LogFile> FileSink<F> {
    fn new(file: F, len: u64, fsync: bool) -> Self {
        Self {
            file,
            len,
            fsync,
            poisoned: false,
        }
    }
}

impl<F: LogFile> LogSink for FileSink<F> {
    fn append(&mut self, line: &[u8]) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other(
                "log tail is torn from an earlier failed append",
            ));
        }

        let written = self
            .file
            .write_all(line)
            .and_then(|()| self.file.flush())
            .and_then(|()| if self.fsync { self.file.sync_data() } else { Ok(()) });

        match written {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(err) => {
                // Cut off a torn line so the next append starts clean.
                if let Err(truncate_err) = self.file.set_len(self.len) {
                    self.poisoned = true;
                    error!(
                        len = self.len,
                        error = %truncate_err,
                        "failed to truncate torn log line, refusing further appends"
                    );
                    return Err(io::Error::other(format!(
                        "{err}; truncating the torn line also failed: {truncate_err}"
                    )));
                }
                Err(err)
            }
        }
    }
}

/// Whether a non-empty file stops partway through a line.
fn ends_unterminated(mut file: &File, len: u64) -> io::Result<bool> {
    if len == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// The index plus the open log, shared by the repository and its delete
/// pipeline.
pub(crate) struct LogStore {
    index: MemoryIndex,
    sink: Mutex<Option<Box<dyn LogSink>>>,
    path: PathBuf,
}

impl LogStore {
    pub(crate) fn new(index: MemoryIndex, sink: Box<dyn LogSink>, path: PathBuf) -> Self {
        Self {
            index,
            sink: Mutex::new(Some(sink)),
            path,
        }
    }

    fn append(&self, mutation: &Mutation) -> Result<()> {
        let line = encode(mutation)?;
        let mut sink = self.sink.lock();
        let Some(sink) = sink.as_mut() else {
            return Err(StorageError::LogWrite(format!(
                "{} is closed",
                self.path.display()
            )));
        };
        sink.append(&line)
            .map_err(|e| StorageError::LogWrite(format!("{}: {e}", self.path.display())))
    }

    fn user_create(&self, user: User) -> Result<User> {
        let mut state = self.index.write();
        let user = state.insert_user(user)?;
        if let Err(err) = self.append(&Mutation::UserCreate(user)) {
            state.remove_user(user.id);
            return Err(err);
        }
        Ok(user)
    }

    fn short_url_create(&self, short_url: ShortUrl) -> Result<()> {
        let mut state = self.index.write();
        let id = short_url.id.clone();
        let mutation = Mutation::ShortUrlCreate(short_url.clone());
        let displaced = state.insert_short_url(short_url)?;
        if let Err(err) = self.append(&mutation) {
            state.remove_short_url(&id, displaced);
            return Err(err);
        }
        Ok(())
    }

    fn close(&self) {
        if self.sink.lock().take().is_some() {
            debug!(path = %self.path.display(), "closed log");
        }
    }
}

#[async_trait]
impl SoftDelete for LogStore {
    async fn soft_delete(&self, owner_id: UserId, ids: &[String]) -> Result<Vec<String>> {
        let mut state = self.index.write();
        let flipped = state.soft_delete(owner_id, ids);
        if flipped.is_empty() {
            return Ok(flipped);
        }

        let mutation = Mutation::ShortUrlDelete {
            owner_id,
            ids: flipped.clone(),
        };
        if let Err(err) = self.append(&mutation) {
            state.restore(&flipped);
            return Err(err);
        }
        Ok(flipped)
    }
}

/// Applies one replayed mutation. Anything the index rejects aborts replay.
fn replay(state: &mut IndexState, line_no: usize, mutation: Mutation) -> Result<()> {
    match mutation {
        Mutation::UserCreate(user) => state.insert_user(user).map(|_| ()),
        Mutation::ShortUrlCreate(short_url) => state.insert_short_url(short_url).map(|_| ()),
        Mutation::ShortUrlDelete { owner_id, ids } => {
            let flipped = state.soft_delete(owner_id, &ids);
            if flipped.len() != ids.len() {
                return Err(StorageError::LogStructure(format!(
                    "line {line_no}: delete of {} id(s) by user {owner_id} only matched {}",
                    ids.len(),
                    flipped.len()
                )));
            }
            Ok(())
        }
    }
}

fn load(file: &File, path: &Path) -> Result<MemoryIndex> {
    let index = MemoryIndex::new();
    {
        let mut state = index.write();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line_no = n + 1;
            let line = line.map_err(|e| {
                StorageError::LogRead(format!("{}: line {line_no}: {e}", path.display()))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let mutation = decode_line(line_no, &line)?;
            replay(&mut state, line_no, mutation)?;
        }

        debug!(
            path = %path.display(),
            users = state.user_count(),
            short_urls = state.short_url_count(),
            "replayed log"
        );
    }
    Ok(index)
}

/// Durable repository: a [`MemoryIndex`] kept in lockstep with an append-only
/// log file.
///
/// The file must not be opened for writing by any other process while this
/// repository is alive.
#[derive(Clone)]
pub struct LogRepository {
    store: Arc<LogStore>,
    pipeline: DeletePipeline<LogStore>,
}

impl std::fmt::Debug for LogRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRepository")
            .field("path", &self.store.path)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl LogRepository {
    /// Opens (or creates) the log at `config.path` and replays it.
    ///
    /// Fails with `LogOpen` if the file cannot be opened, `LogRead` on a line
    /// that is not JSON, `LogStructure` on a line that is not exactly one
    /// known mutation, and with the index's own error (e.g. `Duplicate`) if
    /// a replayed mutation is rejected.
    pub fn open(config: LogConfig, shutdown: Shutdown) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&config.path)
            .map_err(|e| StorageError::LogOpen(format!("{}: {e}", config.path.display())))?;

        let index = load(&file, &config.path)?;
        let len = file
            .metadata()
            .map_err(|e| StorageError::LogOpen(format!("{}: {e}", config.path.display())))?
            .len();

        let unterminated = ends_unterminated(&file, len)
            .map_err(|e| StorageError::LogOpen(format!("{}: {e}", config.path.display())))?;
        let mut sink = FileSink::new(file, len, config.fsync);
        if unterminated {
            // The last record replayed fine; give it its newline so the next
            // append does not run into it.
            warn!(path = %config.path.display(), "log ends without a newline, terminating last record");
            sink.append(b"\n")
                .map_err(|e| StorageError::LogOpen(format!("{}: {e}", config.path.display())))?;
        }
        let store = LogStore::new(index, Box::new(sink), config.path);
        Ok(Self::with_store(store, config.lanes, shutdown))
    }

    pub(crate) fn with_store(store: LogStore, lanes: usize, shutdown: Shutdown) -> Self {
        let store = Arc::new(store);
        let pipeline = DeletePipeline::new(Arc::clone(&store), lanes, shutdown);
        Self { store, pipeline }
    }

    pub fn path(&self) -> &Path {
        &self.store.path
    }
}

#[async_trait]
impl ReadRepository for LogRepository {
    async fn user_get_by_id(&self, id: UserId) -> Result<User> {
        self.store.index.user_get_by_id(id)
    }

    async fn user_count(&self) -> Result<u64> {
        Ok(self.store.index.user_count())
    }

    async fn short_url_get_by_id(&self, id: &str) -> Result<ShortUrl> {
        self.store.index.short_url_get_by_id(id)
    }

    async fn short_url_get_by_user_id(&self, user_id: UserId) -> Result<Vec<ShortUrl>> {
        Ok(self.store.index.short_url_get_by_user_id(user_id))
    }

    async fn short_url_get_by_original_url(&self, original_url: &str) -> Result<ShortUrl> {
        self.store.index.short_url_get_by_original_url(original_url)
    }

    async fn short_url_count(&self) -> Result<u64> {
        Ok(self.store.index.short_url_count())
    }
}

#[async_trait]
impl Repository for LogRepository {
    async fn user_create(&self, user: User) -> Result<User> {
        self.store.user_create(user)
    }

    async fn short_url_create(&self, short_url: ShortUrl) -> Result<()> {
        self.store.short_url_create(short_url)
    }

    async fn short_url_delete_batch(&self, owner_id: UserId, ids: Vec<String>) -> Result<u64> {
        self.pipeline.run(owner_id, ids).await
    }

    async fn close(&self) -> Result<()> {
        self.store.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Writes into memory, failing every append while `fail` is set.
    struct FlakySink {
        fail: Arc<AtomicBool>,
        lines: Arc<Mutex<Vec<String>>>,
    }

    impl LogSink for FlakySink {
        fn append(&mut self, line: &[u8]) -> io::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::other("disk full"));
            }
            self.lines
                .lock()
                .push(String::from_utf8_lossy(line).into_owned());
            Ok(())
        }
    }

    struct Flaky {
        repo: LogRepository,
        fail: Arc<AtomicBool>,
        lines: Arc<Mutex<Vec<String>>>,
    }

    fn flaky() -> Flaky {
        let fail = Arc::new(AtomicBool::new(false));
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = FlakySink {
            fail: Arc::clone(&fail),
            lines: Arc::clone(&lines),
        };
        let store = LogStore::new(MemoryIndex::new(), Box::new(sink), "flaky.log".into());
        Flaky {
            repo: LogRepository::with_store(store, 2, Shutdown::never()),
            fail,
            lines,
        }
    }

    fn config(dir: &TempDir) -> LogConfig {
        LogConfig::builder()
            .path(dir.path().join("burrow.log"))
            .fsync(false)
            .lanes(2)
            .build()
    }

    fn open(dir: &TempDir) -> Result<LogRepository> {
        LogRepository::open(config(dir), Shutdown::never())
    }

    fn write_log(dir: &TempDir, contents: &str) {
        std::fs::write(dir.path().join("burrow.log"), contents).unwrap();
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn open_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir).unwrap();

        assert!(repo.path().exists());
        assert_eq!(repo.user_count().await.unwrap(), 0);
        assert_eq!(repo.short_url_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir).unwrap();

        let alice = repo.user_create(User::new()).await.unwrap();
        let bob = repo.user_create(User::new()).await.unwrap();
        repo.short_url_create(ShortUrl::new("x", "https://x", alice.id))
            .await
            .unwrap();
        repo.short_url_create(ShortUrl::new("y", "https://y", alice.id))
            .await
            .unwrap();
        repo.short_url_create(ShortUrl::new("z", "https://z", bob.id))
            .await
            .unwrap();
        assert_eq!(
            repo.short_url_delete_batch(alice.id, ids(&["x", "z"]))
                .await
                .unwrap(),
            1
        );
        repo.close().await.unwrap();

        let reopened = open(&dir).unwrap();
        assert_eq!(reopened.user_count().await.unwrap(), 2);
        assert_eq!(reopened.short_url_count().await.unwrap(), 3);
        assert_eq!(reopened.user_get_by_id(bob.id).await.unwrap(), bob);

        let owned = reopened.short_url_get_by_user_id(alice.id).await.unwrap();
        assert_eq!(
            owned,
            vec![
                ShortUrl {
                    deleted: true,
                    ..ShortUrl::new("x", "https://x", alice.id)
                },
                ShortUrl::new("y", "https://y", alice.id),
            ]
        );
        assert!(!reopened.short_url_get_by_id("z").await.unwrap().deleted);
    }

    #[tokio::test]
    async fn auto_ids_continue_after_replay() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir).unwrap();
        repo.user_create(User::new()).await.unwrap();
        repo.user_create(User::with_id(10)).await.unwrap();
        repo.close().await.unwrap();

        let reopened = open(&dir).unwrap();
        assert_eq!(reopened.user_create(User::new()).await.unwrap().id, 11);
        assert!(reopened
            .user_create(User::with_id(1))
            .await
            .unwrap_err()
            .is_duplicate());
    }

    #[tokio::test]
    async fn scenario() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir).unwrap();

        let user = repo.user_create(User::new()).await.unwrap();
        assert_eq!(user.id, 1);
        repo.short_url_create(ShortUrl::new("abc", "https://x.com", 1))
            .await
            .unwrap();
        let err = repo
            .short_url_create(ShortUrl::new("abc", "https://x.com", 1))
            .await
            .unwrap_err();
        assert!(err.is_duplicate());

        let found = repo
            .short_url_get_by_original_url("https://x.com")
            .await
            .unwrap();
        assert_eq!(found.id, "abc");

        // The rejected create must not have been logged.
        let contents = std::fs::read_to_string(repo.path()).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn log_lines_use_the_documented_format() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir).unwrap();
        repo.user_create(User::new()).await.unwrap();
        repo.short_url_create(ShortUrl::new("abc", "https://x.com", 1))
            .await
            .unwrap();
        repo.short_url_delete_batch(1, ids(&["abc"])).await.unwrap();

        let contents = std::fs::read_to_string(repo.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                r#"{"user_create":{"id":1}}"#,
                r#"{"short_url_create":{"id":"abc","original_url":"https://x.com","user_id":1}}"#,
                r#"{"short_url_delete":{"user_id":1,"ids":["abc"]}}"#,
            ]
        );
    }

    #[tokio::test]
    async fn noop_delete_is_not_logged() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir).unwrap();
        repo.short_url_create(ShortUrl::new("abc", "https://x.com", 1))
            .await
            .unwrap();

        assert_eq!(repo.short_url_delete_batch(2, ids(&["abc"])).await.unwrap(), 0);
        let contents = std::fs::read_to_string(repo.path()).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn garbage_line_is_a_read_error() {
        let dir = TempDir::new().unwrap();
        write_log(&dir, "{\"user_create\":{\"id\":1}}\nnot json\n");

        let err = open(&dir).unwrap_err();
        assert!(matches!(err, StorageError::LogRead(ref m) if m.contains("line 2")), "{err}");
    }

    #[test]
    fn unknown_field_is_a_structure_error() {
        let dir = TempDir::new().unwrap();
        write_log(&dir, "{\"user_delete\":{\"id\":1}}\n");
        assert!(matches!(open(&dir).unwrap_err(), StorageError::LogStructure(_)));

        write_log(&dir, "{\"user_create\":{\"id\":1,\"name\":\"x\"}}\n");
        assert!(matches!(open(&dir).unwrap_err(), StorageError::LogStructure(_)));
    }

    #[test]
    fn record_must_carry_exactly_one_mutation() {
        let dir = TempDir::new().unwrap();
        write_log(&dir, "{}\n");
        assert!(matches!(open(&dir).unwrap_err(), StorageError::LogStructure(_)));

        write_log(
            &dir,
            "{\"user_create\":{\"id\":1},\"short_url_create\":{\"id\":\"a\",\"original_url\":\"u\",\"user_id\":1}}\n",
        );
        assert!(matches!(open(&dir).unwrap_err(), StorageError::LogStructure(_)));
    }

    #[test]
    fn rejected_replay_aborts_startup() {
        let dir = TempDir::new().unwrap();
        write_log(&dir, "{\"user_create\":{\"id\":1}}\n{\"user_create\":{\"id\":1}}\n");
        assert!(open(&dir).unwrap_err().is_duplicate());

        write_log(&dir, "{\"short_url_delete\":{\"user_id\":1,\"ids\":[\"ghost\"]}}\n");
        assert!(matches!(open(&dir).unwrap_err(), StorageError::LogStructure(_)));
    }

    #[test]
    fn blank_lines_are_ignored() {
        let dir = TempDir::new().unwrap();
        write_log(&dir, "\n{\"user_create\":{\"id\":3}}\n\n");
        let repo = open(&dir).unwrap();
        assert_eq!(repo.store.index.user_count(), 1);
    }

    #[test]
    fn unreadable_path_is_an_open_error() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig::builder()
            .path(dir.path().join("missing").join("burrow.log"))
            .build();
        let err = LogRepository::open(config, Shutdown::never()).unwrap_err();
        assert!(matches!(err, StorageError::LogOpen(_)));
    }

    #[tokio::test]
    async fn failed_append_rolls_back_user() {
        let flaky = flaky();
        flaky.fail.store(true, Ordering::SeqCst);

        let err = flaky.repo.user_create(User::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::LogWrite(_)));
        assert!(flaky.repo.user_get_by_id(1).await.unwrap_err().is_not_found());
        assert_eq!(flaky.repo.user_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_append_rolls_back_short_url() {
        let flaky = flaky();
        flaky.fail.store(true, Ordering::SeqCst);

        let err = flaky
            .repo
            .short_url_create(ShortUrl::new("abc", "https://x.com", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::LogWrite(_)));
        assert!(flaky.repo.short_url_get_by_id("abc").await.unwrap_err().is_not_found());
        assert!(flaky
            .repo
            .short_url_get_by_original_url("https://x.com")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(flaky.repo.short_url_get_by_user_id(1).await.unwrap().is_empty());

        // The same record goes through once the log recovers.
        flaky.fail.store(false, Ordering::SeqCst);
        flaky
            .repo
            .short_url_create(ShortUrl::new("abc", "https://x.com", 1))
            .await
            .unwrap();
        assert_eq!(flaky.lines.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_append_rolls_back_delete() {
        let flaky = flaky();
        flaky
            .repo
            .short_url_create(ShortUrl::new("abc", "https://x.com", 1))
            .await
            .unwrap();
        flaky.fail.store(true, Ordering::SeqCst);

        let err = flaky
            .repo
            .short_url_delete_batch(1, ids(&["abc"]))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StorageError::BatchDelete { ref first, .. } if matches!(**first, StorageError::LogWrite(_))),
            "{err}"
        );
        assert!(!flaky.repo.short_url_get_by_id("abc").await.unwrap().deleted);
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir).unwrap();
        repo.close().await.unwrap();
        repo.close().await.unwrap();

        let err = repo.user_create(User::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::LogWrite(_)));
        assert_eq!(repo.user_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unterminated_last_record_is_completed_on_open() {
        let dir = TempDir::new().unwrap();
        write_log(&dir, r#"{"user_create":{"id":1}}"#);

        let repo = open(&dir).unwrap();
        assert_eq!(repo.user_create(User::new()).await.unwrap().id, 2);
        repo.close().await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join("burrow.log")).unwrap();
        assert_eq!(
            contents,
            "{\"user_create\":{\"id\":1}}\n{\"user_create\":{\"id\":2}}\n"
        );

        let reopened = open(&dir).unwrap();
        assert_eq!(reopened.user_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn torn_last_record_is_a_read_error() {
        let dir = TempDir::new().unwrap();
        write_log(&dir, "{\"user_create\":{\"id\":1}}\n{\"user_cre");

        let err = open(&dir).unwrap_err();
        assert!(matches!(err, StorageError::LogRead(_)), "{err}");
    }

    /// In-memory stand-in for the log file with switchable write and
    /// truncate failures. A failing write persists half of its buffer.
    #[derive(Clone, Default)]
    struct FaultyFile {
        bytes: Arc<Mutex<Vec<u8>>>,
        fail_write: Arc<AtomicBool>,
        fail_truncate: Arc<AtomicBool>,
    }

    impl Write for FaultyFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_write.load(Ordering::SeqCst) {
                self.bytes.lock().extend_from_slice(&buf[..buf.len() / 2]);
                return Err(io::Error::other("disk full"));
            }
            self.bytes.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogFile for FaultyFile {
        fn sync_data(&self) -> io::Result<()> {
            Ok(())
        }

        fn set_len(&self, len: u64) -> io::Result<()> {
            if self.fail_truncate.load(Ordering::SeqCst) {
                return Err(io::Error::other("read-only filesystem"));
            }
            self.bytes.lock().truncate(len as usize);
            Ok(())
        }
    }

    impl FaultyFile {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.bytes.lock()).into_owned()
        }
    }

    #[test]
    fn failed_append_cuts_off_the_torn_line() {
        let file = FaultyFile::default();
        let mut sink = FileSink::new(file.clone(), 0, true);

        sink.append(b"first\n").unwrap();
        file.fail_write.store(true, Ordering::SeqCst);
        assert!(sink.append(b"second\n").is_err());
        assert_eq!(file.contents(), "first\n");

        file.fail_write.store(false, Ordering::SeqCst);
        sink.append(b"third\n").unwrap();
        assert_eq!(file.contents(), "first\nthird\n");
    }

    #[test]
    fn failed_truncation_refuses_further_appends() {
        let file = FaultyFile::default();
        let mut sink = FileSink::new(file.clone(), 0, false);

        sink.append(b"first\n").unwrap();
        file.fail_write.store(true, Ordering::SeqCst);
        file.fail_truncate.store(true, Ordering::SeqCst);
        assert!(sink.append(b"second\n").is_err());

        file.fail_write.store(false, Ordering::SeqCst);
        file.fail_truncate.store(false, Ordering::SeqCst);
        assert!(sink.append(b"third\n").is_err());
        assert_eq!(file.contents(), "first\nsec");
    }

    #[tokio::test]
    async fn torn_tail_rolls_back_and_blocks_later_writes() {
        let file = FaultyFile::default();
        let sink = FileSink::new(file.clone(), 0, false);
        let store = LogStore::new(MemoryIndex::new(), Box::new(sink), "faulty.log".into());
        let repo = LogRepository::with_store(store, 2, Shutdown::never());

        repo.user_create(User::new()).await.unwrap();
        file.fail_write.store(true, Ordering::SeqCst);
        file.fail_truncate.store(true, Ordering::SeqCst);

        let err = repo.user_create(User::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::LogWrite(_)), "{err}");
        assert_eq!(repo.user_count().await.unwrap(), 1);

        file.fail_write.store(false, Ordering::SeqCst);
        file.fail_truncate.store(false, Ordering::SeqCst);
        let err = repo.user_create(User::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::LogWrite(_)), "{err}");
        assert_eq!(repo.user_count().await.unwrap(), 1);
    }
}
