//! Persistence bridge: version assignment at delivery and the durable
//! version log behind it.
//!
//! The multicast engine calls `make_version` as each message is delivered
//! and `post_persist` once `delivered_num` has advanced, both on the
//! predicate-engine thread and in strict per-subgroup sequence order. A
//! bridge persists asynchronously and publishes each durable version back
//! into the local `persisted_num` column through the publisher hook.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;

use crate::{MessageId, SubgroupId};

/// Version assigned to a delivered message: view id in the high 32 bits,
/// sequence number in the low 32.
pub type Version = i64;

pub fn combine_version(vid: i32, seq: MessageId) -> Version {
    ((vid as i64) << 32) | (seq as u32 as i64)
}

pub fn version_seq(version: Version) -> MessageId {
    (version & 0xffff_ffff) as MessageId
}

pub fn version_vid(version: Version) -> i32 {
    (version >> 32) as i32
}

/// Hybrid logical clock stamp carried with each version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Hlc {
    pub wall_us: u64,
    pub logical: u64,
}

impl Hlc {
    /// Builds a stamp from a wall-clock timestamp in nanoseconds, falling
    /// back to the current time when the timestamp is zero.
    pub fn from_wall_ns(wall_ns: u64) -> Self {
        let wall_us = if wall_ns == 0 {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_micros()
                .min(u128::from(u64::MAX)) as u64
        } else {
            wall_ns / 1_000
        };
        Self { wall_us, logical: 0 }
    }
}

/// Publishes a durable version into the local SST row.
pub type PersistedPublisher = Arc<dyn Fn(SubgroupId, Version) + Send + Sync>;

/// Durability callbacks invoked by the multicast engine.
///
/// `make_version` happens-before `post_persist` for the same version, and
/// versions arrive in ascending order per subgroup.
pub trait PersistenceBridge: Send + Sync {
    fn make_version(&self, subgroup_id: SubgroupId, version: Version, hlc: Hlc);
    fn post_persist(&self, subgroup_id: SubgroupId, version: Version);
    /// Discards every logged version newer than `version`. Used by total
    /// restart to conform to the leader's ragged trim.
    fn truncate(&self, subgroup_id: SubgroupId, version: Version) -> anyhow::Result<()>;
    /// Installs the hook used to report durable versions back into the SST.
    fn set_persisted_publisher(&self, publisher: PersistedPublisher);
}

const LOG_FILE_PREFIX: &str = "log";

struct VersionRecord {
    version: Version,
    hlc: Hlc,
}

enum LogCommand {
    MakeVersion {
        subgroup_id: SubgroupId,
        record: VersionRecord,
    },
    PostPersist {
        subgroup_id: SubgroupId,
        version: Version,
    },
    Shutdown,
}

/// File-backed persistence bridge: one framed append-only version log per
/// subgroup, written by a dedicated worker thread.
pub struct FileLogBridge {
    dir: PathBuf,
    tx: Mutex<Option<mpsc::Sender<LogCommand>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    publisher: Arc<Mutex<Option<PersistedPublisher>>>,
}

impl FileLogBridge {
    pub fn open_dir(path: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create version log dir")?;
        let publisher: Arc<Mutex<Option<PersistedPublisher>>> = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel();
        let worker_dir = dir.clone();
        let worker_publisher = Arc::clone(&publisher);
        let worker = thread::Builder::new()
            .name("version-log".to_string())
            .spawn(move || log_worker(&worker_dir, rx, worker_publisher))
            .context("spawn version log thread")?;
        Ok(Arc::new(Self {
            dir,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            publisher,
        }))
    }

    fn log_path(&self, subgroup_id: SubgroupId) -> PathBuf {
        log_path(&self.dir, subgroup_id)
    }

    /// Reads the highest version in the given subgroup's log, if any.
    pub fn last_version(&self, subgroup_id: SubgroupId) -> anyhow::Result<Option<Version>> {
        let records = read_log_records(&self.log_path(subgroup_id))?;
        Ok(records.last().map(|r| r.version))
    }

    pub fn shutdown(&self) {
        let tx = self.tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(LogCommand::Shutdown);
        }
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }

    fn send(&self, command: LogCommand) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(command);
        }
    }
}

impl Drop for FileLogBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PersistenceBridge for FileLogBridge {
    fn make_version(&self, subgroup_id: SubgroupId, version: Version, hlc: Hlc) {
        self.send(LogCommand::MakeVersion {
            subgroup_id,
            record: VersionRecord { version, hlc },
        });
    }

    fn post_persist(&self, subgroup_id: SubgroupId, version: Version) {
        self.send(LogCommand::PostPersist {
            subgroup_id,
            version,
        });
    }

    fn truncate(&self, subgroup_id: SubgroupId, version: Version) -> anyhow::Result<()> {
        truncate_log(&self.log_path(subgroup_id), version)
    }

    fn set_persisted_publisher(&self, publisher: PersistedPublisher) {
        *self.publisher.lock().unwrap() = Some(publisher);
    }
}

fn log_path(dir: &Path, subgroup_id: SubgroupId) -> PathBuf {
    dir.join(format!("{LOG_FILE_PREFIX}.{subgroup_id}"))
}

fn log_worker(
    dir: &Path,
    rx: mpsc::Receiver<LogCommand>,
    publisher: Arc<Mutex<Option<PersistedPublisher>>>,
) {
    let mut pending: HashMap<SubgroupId, Vec<VersionRecord>> = HashMap::new();
    let mut files: HashMap<SubgroupId, File> = HashMap::new();
    while let Ok(command) = rx.recv() {
        match command {
            LogCommand::MakeVersion {
                subgroup_id,
                record,
            } => {
                pending.entry(subgroup_id).or_default().push(record);
            }
            LogCommand::PostPersist {
                subgroup_id,
                version,
            } => {
                let queued = pending.entry(subgroup_id).or_default();
                let mut to_write = Vec::new();
                while queued.first().is_some_and(|r| r.version <= version) {
                    to_write.push(queued.remove(0));
                }
                if let Err(err) =
                    append_records(dir, &mut files, subgroup_id, &to_write)
                {
                    tracing::error!(error = ?err, subgroup_id, "version log append failed");
                    continue;
                }
                let publisher = publisher.lock().unwrap().clone();
                if let Some(publish) = publisher {
                    publish(subgroup_id, version);
                }
            }
            LogCommand::Shutdown => break,
        }
    }
    tracing::debug!("version log thread shutting down");
}

fn append_records(
    dir: &Path,
    files: &mut HashMap<SubgroupId, File>,
    subgroup_id: SubgroupId,
    records: &[VersionRecord],
) -> anyhow::Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    if !files.contains_key(&subgroup_id) {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path(dir, subgroup_id))
            .context("open version log for append")?;
        files.insert(subgroup_id, file);
    }
    let file = files.get_mut(&subgroup_id).expect("file just inserted");
    for record in records {
        write_record(file, &encode_record(record))?;
    }
    file.flush()?;
    file.sync_data().context("sync version log")?;
    Ok(())
}

fn write_record(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    file.write_all(&len.to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

fn encode_record(record: &VersionRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 8 + 8);
    out.extend_from_slice(&record.version.to_be_bytes());
    out.extend_from_slice(&record.hlc.wall_us.to_be_bytes());
    out.extend_from_slice(&record.hlc.logical.to_be_bytes());
    out
}

fn decode_record(buf: &[u8]) -> anyhow::Result<VersionRecord> {
    anyhow::ensure!(buf.len() == 24, "version record has wrong length");
    let mut version = [0u8; 8];
    version.copy_from_slice(&buf[0..8]);
    let mut wall = [0u8; 8];
    wall.copy_from_slice(&buf[8..16]);
    let mut logical = [0u8; 8];
    logical.copy_from_slice(&buf[16..24]);
    Ok(VersionRecord {
        version: i64::from_be_bytes(version),
        hlc: Hlc {
            wall_us: u64::from_be_bytes(wall),
            logical: u64::from_be_bytes(logical),
        },
    })
}

fn read_log_records(path: &Path) -> anyhow::Result<Vec<VersionRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut reader = std::io::BufReader::new(file);
    let mut records = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let expected_crc = u32::from_be_bytes(crc_buf);
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        anyhow::ensure!(hasher.finalize() == expected_crc, "version log checksum mismatch");
        records.push(decode_record(&payload)?);
    }
    Ok(records)
}

fn truncate_log(path: &Path, version: Version) -> anyhow::Result<()> {
    let records = read_log_records(path)?;
    if records.is_empty() {
        return Ok(());
    }
    let tmp_path = path.with_extension("tmp");
    let mut out = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp_path)
        .context("open version log truncate temp")?;
    let mut retained = 0usize;
    for record in &records {
        if record.version > version {
            continue;
        }
        write_record(&mut out, &encode_record(record))?;
        retained += 1;
    }
    out.flush()?;
    out.sync_all()?;
    fs::rename(&tmp_path, path).context("replace version log")?;
    tracing::debug!(
        path = %path.display(),
        retained,
        dropped = records.len() - retained,
        "truncated version log"
    );
    Ok(())
}

/// Bridge for groups with no persistent subgroup types: versions are
/// acknowledged as durable immediately.
pub struct NullBridge {
    publisher: Mutex<Option<PersistedPublisher>>,
}

impl NullBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            publisher: Mutex::new(None),
        })
    }
}

impl PersistenceBridge for NullBridge {
    fn make_version(&self, _subgroup_id: SubgroupId, _version: Version, _hlc: Hlc) {}

    fn post_persist(&self, subgroup_id: SubgroupId, version: Version) {
        let publisher = self.publisher.lock().unwrap().clone();
        if let Some(publish) = publisher {
            publish(subgroup_id, version);
        }
    }

    fn truncate(&self, _subgroup_id: SubgroupId, _version: Version) -> anyhow::Result<()> {
        Ok(())
    }

    fn set_persisted_publisher(&self, publisher: PersistedPublisher) {
        *self.publisher.lock().unwrap() = Some(publisher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    #[test]
    fn versions_pack_vid_and_seq() {
        let v = combine_version(3, 17);
        assert_eq!(version_vid(v), 3);
        assert_eq!(version_seq(v), 17);
        assert!(combine_version(0, 0) > crate::INVALID_VERSION);
        assert!(combine_version(1, 0) > combine_version(0, MessageId::MAX));
    }

    #[test]
    fn post_persist_reports_back_and_survives_reload() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let bridge = FileLogBridge::open_dir(dir.path()).expect("open bridge");
        let seen = Arc::new(AtomicI64::new(crate::INVALID_VERSION));
        let seen_hook = Arc::clone(&seen);
        bridge.set_persisted_publisher(Arc::new(move |_sid, version| {
            seen_hook.store(version, Ordering::SeqCst);
        }));

        bridge.make_version(0, combine_version(1, 0), Hlc::from_wall_ns(0));
        bridge.make_version(0, combine_version(1, 1), Hlc::from_wall_ns(0));
        bridge.post_persist(0, combine_version(1, 1));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) != combine_version(1, 1) {
            assert!(std::time::Instant::now() < deadline, "persist was never reported");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(
            bridge.last_version(0).expect("read log"),
            Some(combine_version(1, 1))
        );
    }

    #[test]
    fn truncate_drops_versions_past_the_trim() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let bridge = FileLogBridge::open_dir(dir.path()).expect("open bridge");
        for seq in 0..4 {
            bridge.make_version(2, combine_version(1, seq), Hlc::from_wall_ns(0));
        }
        bridge.post_persist(2, combine_version(1, 3));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while bridge.last_version(2).expect("read log") != Some(combine_version(1, 3)) {
            assert!(std::time::Instant::now() < deadline, "log never became durable");
            thread::sleep(Duration::from_millis(1));
        }

        bridge
            .truncate(2, combine_version(1, 1))
            .expect("truncate log");
        assert_eq!(
            bridge.last_version(2).expect("read log"),
            Some(combine_version(1, 1))
        );
    }
}
