//! File-backed partition log.
//!
//! Each partition is one segment file, `<root>/<topic>-<index>.log`, holding
//! a sequence of frames:
//!
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload (an encoded log record)]
//! ```
//!
//! A record's offset is its frame's ordinal in the file. Frames failing the
//! CRC check keep their ordinal but are skipped on read; a torn frame at the
//! tail is cut off when the partition is opened.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use pes_types::PartitionKey;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::backend::{LogBackend, LogItem, Subscription};
use crate::error::{BridgeError, BridgeResult};

const HEADER_SIZE: usize = 8;

struct Segment {
    path: PathBuf,
    file: File,
    /// Byte position of every frame, indexed by offset.
    positions: Vec<u64>,
    /// End of the last complete frame. The file never keeps bytes past it.
    end: u64,
    sync_every_write: bool,
}

impl Segment {
    fn open(path: PathBuf, sync_every_write: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();
        let (positions, end) = scan(&path)?;
        if end < file_len {
            warn!(path = %path.display(), valid = end, file_len, "truncating torn segment tail");
            file.set_len(end)?;
        }
        debug!(path = %path.display(), records = positions.len(), "segment opened");

        Ok(Self {
            path,
            file,
            positions,
            end,
            sync_every_write,
        })
    }

    fn append(&mut self, payload: &[u8]) -> io::Result<u64> {
        let sync = self.sync_every_write;
        self.append_with(payload, |mut file, frame| {
            file.write_all(frame)?;
            if sync {
                file.sync_data()?;
            }
            Ok(())
        })
    }

    /// Frame `payload` and hand it to `write`. A failed write is rolled
    /// back so no partial frame stays between `end` and the next append.
    fn append_with(
        &mut self,
        payload: &[u8],
        write: impl FnOnce(&File, &[u8]) -> io::Result<()>,
    ) -> io::Result<u64> {
        let length = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record exceeds 4 GiB"))?;
        let crc = crc32fast::hash(payload);

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(payload);

        if let Err(err) = write(&self.file, &frame) {
            match self.truncate_to_end() {
                Ok(()) => warn!(path = %self.path.display(), end = self.end, %err, "append failed; tail rolled back"),
                Err(rollback) => error!(
                    path = %self.path.display(),
                    end = self.end,
                    %err,
                    %rollback,
                    "append failed and tail could not be rolled back"
                ),
            }
            return Err(err);
        }

        let offset = self.positions.len() as u64;
        self.positions.push(self.end);
        self.end += frame.len() as u64;
        Ok(offset)
    }

    fn truncate_to_end(&mut self) -> io::Result<()> {
        self.file.set_len(self.end)?;
        self.file.seek(SeekFrom::Start(self.end))?;
        Ok(())
    }

    fn read_from(&self, from: u64) -> io::Result<Vec<LogItem>> {
        let mut file = File::open(&self.path)?;
        let mut items = Vec::new();
        for (offset, position) in self.positions.iter().enumerate().skip(from as usize) {
            file.seek(SeekFrom::Start(*position))?;
            let mut header = [0u8; HEADER_SIZE];
            file.read_exact(&mut header)?;
            let (length, expected_crc) = parse_header(&header);

            let mut payload = vec![0u8; length as usize];
            file.read_exact(&mut payload)?;
            let actual_crc = crc32fast::hash(&payload);
            if actual_crc != expected_crc {
                warn!(
                    path = %self.path.display(),
                    offset,
                    expected = expected_crc,
                    actual = actual_crc,
                    "CRC mismatch; skipping record"
                );
                continue;
            }
            items.push(LogItem {
                offset: offset as u64,
                bytes: Bytes::from(payload),
            });
        }
        Ok(items)
    }
}

fn parse_header(header: &[u8; HEADER_SIZE]) -> (u32, u32) {
    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    (length, crc)
}

/// Frame positions and the end of the last complete frame.
fn scan(path: &Path) -> io::Result<(Vec<u64>, u64)> {
    let data = fs::read(path)?;
    let mut positions = Vec::new();
    let mut cursor = 0usize;

    while cursor + HEADER_SIZE <= data.len() {
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&data[cursor..cursor + HEADER_SIZE]);
        let (length, expected_crc) = parse_header(&header);
        let end = cursor + HEADER_SIZE + length as usize;
        if length == 0 || end > data.len() {
            break;
        }
        if crc32fast::hash(&data[cursor + HEADER_SIZE..end]) != expected_crc {
            warn!(path = %path.display(), offset = positions.len(), "CRC mismatch in segment");
        }
        positions.push(cursor as u64);
        cursor = end;
    }
    Ok((positions, cursor as u64))
}

struct FilePartition {
    segment: Arc<Mutex<Segment>>,
    live: broadcast::Sender<LogItem>,
}

/// Durable partition log: one framed segment file per partition.
pub struct FileLog {
    root: PathBuf,
    partitions: RwLock<HashMap<PartitionKey, FilePartition>>,
    channel_capacity: usize,
    sync_every_write: bool,
}

impl FileLog {
    /// Open a log rooted at `root`, creating the directory if needed.
    /// Existing segments are opened lazily by `create_partition`.
    pub fn open(root: impl AsRef<Path>, channel_capacity: usize) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            partitions: RwLock::new(HashMap::new()),
            channel_capacity: channel_capacity.max(1),
            sync_every_write: false,
        })
    }

    pub fn sync_every_write(mut self, enabled: bool) -> Self {
        self.sync_every_write = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn segment_path(&self, key: &PartitionKey) -> PathBuf {
        self.root.join(format!("{}.log", key.file_stem()))
    }

    fn with_partition<R>(
        &self,
        key: &PartitionKey,
        f: impl FnOnce(&FilePartition) -> BridgeResult<R>,
    ) -> BridgeResult<R> {
        let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        let partition = partitions
            .get(key)
            .ok_or_else(|| BridgeError::UnknownPartition(key.clone()))?;
        f(partition)
    }
}

fn lock(segment: &Mutex<Segment>) -> std::sync::MutexGuard<'_, Segment> {
    segment.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl LogBackend for FileLog {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn create_partition(&self, key: &PartitionKey) -> BridgeResult<()> {
        let mut partitions = self.partitions.write().unwrap_or_else(|e| e.into_inner());
        if partitions.contains_key(key) {
            return Ok(());
        }
        let segment = Segment::open(self.segment_path(key), self.sync_every_write)?;
        info!(partition = %key, records = segment.positions.len(), "file partition ready");
        partitions.insert(
            key.clone(),
            FilePartition {
                segment: Arc::new(Mutex::new(segment)),
                live: broadcast::channel(self.channel_capacity).0,
            },
        );
        Ok(())
    }

    async fn append(&self, key: &PartitionKey, bytes: Bytes) -> BridgeResult<u64> {
        self.with_partition(key, |partition| {
            let mut segment = lock(&partition.segment);
            let offset = segment.append(&bytes)?;
            let _ = partition.live.send(LogItem { offset, bytes });
            Ok(offset)
        })
    }

    async fn read(&self, key: &PartitionKey, from: u64) -> BridgeResult<Vec<LogItem>> {
        self.with_partition(key, |partition| Ok(lock(&partition.segment).read_from(from)?))
    }

    async fn subscribe(&self, key: &PartitionKey, from: u64) -> BridgeResult<Subscription> {
        self.with_partition(key, |partition| {
            let segment = lock(&partition.segment);
            let live = partition.live.subscribe();
            let backlog = segment.read_from(from)?;
            drop(segment);

            let source = Arc::clone(&partition.segment);
            let reread = Box::new(move |from: u64| -> BridgeResult<Vec<LogItem>> {
                Ok(lock(&source).read_from(from)?)
            });
            Ok(Subscription::new(key.clone(), from, backlog, live, reread))
        })
    }
}
