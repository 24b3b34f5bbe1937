use crate::commitlog::Index;
use crate::replica::write_ahead_log::{get_configuration, put_configuration};
use crate::replica::{ClusterConfiguration, Term};
use bytes::{Buf, BufMut, Bytes};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Describes the log prefix a snapshot replaces.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SnapshotMetadata {
    pub(crate) last_included_index: Index,
    pub(crate) last_included_term: Term,
    /// Cluster configuration in effect at `last_included_index`.
    pub(crate) configuration: ClusterConfiguration,
    /// crc32 of the snapshot data.
    pub(crate) checksum: u32,
    pub(crate) size: u64,
}

#[derive(Clone, Debug)]
pub(crate) struct Snapshot {
    pub(crate) metadata: SnapshotMetadata,
    pub(crate) data: Bytes,
}

impl Snapshot {
    pub(crate) fn new(
        last_included_index: Index,
        last_included_term: Term,
        configuration: ClusterConfiguration,
        data: Bytes,
    ) -> Self {
        Snapshot {
            metadata: SnapshotMetadata {
                last_included_index,
                last_included_term,
                configuration,
                checksum: crc32fast::hash(&data),
                size: data.len() as u64,
            },
            data,
        }
    }
}

/// SnapshotStore keeps the latest state machine snapshot, on disk if a directory is configured.
///
/// File name is `snapshot.<term>_<index>`. Content:
///
/// ```text
/// | Vrs (1) | Index (8) | Term (8) | CRC32 of data (4) | Size (8) | Configuration | Data |
/// ```
pub(crate) struct SnapshotStore {
    logger: slog::Logger,
    directory: Option<PathBuf>,
    latest: Option<Arc<Snapshot>>,
}

const SNAPSHOT_FORMAT_VERSION: u8 = 1;
const SNAPSHOT_FILE_PREFIX: &str = "snapshot.";
const SNAPSHOT_TMP_FILE: &str = "snapshot.tmp";

impl SnapshotStore {
    pub(crate) fn in_memory(logger: slog::Logger) -> Self {
        SnapshotStore {
            logger,
            directory: None,
            latest: None,
        }
    }

    /// Opens the store in `directory`, loading the most recent snapshot in it.
    pub(crate) fn open(logger: slog::Logger, directory: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&directory)?;

        let mut latest: Option<(Index, PathBuf)> = None;
        for dir_entry in fs::read_dir(&directory)? {
            let path = dir_entry?.path();
            let index = match parse_snapshot_file_name(&path) {
                Some(index) => index,
                None => continue,
            };
            if latest.as_ref().map(|(i, _)| *i < index).unwrap_or(true) {
                latest = Some((index, path));
            }
        }

        let latest = match latest {
            Some((_, path)) => {
                let snapshot = read_snapshot_file(&path)?;
                slog::info!(
                    logger,
                    "Loaded snapshot at index {:?} term {:?} ({} bytes)",
                    snapshot.metadata.last_included_index,
                    snapshot.metadata.last_included_term,
                    snapshot.metadata.size
                );
                Some(Arc::new(snapshot))
            }
            None => None,
        };

        Ok(SnapshotStore {
            logger,
            directory: Some(directory),
            latest,
        })
    }

    pub(crate) fn latest(&self) -> Option<Arc<Snapshot>> {
        self.latest.clone()
    }

    pub(crate) fn latest_metadata(&self) -> Option<&SnapshotMetadata> {
        self.latest.as_ref().map(|snapshot| &snapshot.metadata)
    }

    pub(crate) fn latest_index(&self) -> Option<Index> {
        self.latest_metadata().map(|metadata| metadata.last_included_index)
    }

    /// Durably stores `snapshot` and makes it the latest. Older snapshot files are removed.
    ///
    /// The latest snapshot only ever moves forward: a snapshot that doesn't cover more of the log
    /// than the current one is rejected, and nothing on disk changes.
    pub(crate) fn save(&mut self, snapshot: Snapshot) -> Result<Arc<Snapshot>, SaveSnapshotError> {
        if let Some(latest) = self.latest_index() {
            if snapshot.metadata.last_included_index <= latest {
                return Err(SaveSnapshotError::NotNewer {
                    latest,
                    rejected: snapshot.metadata.last_included_index,
                });
            }
        }
        if crc32fast::hash(&snapshot.data) != snapshot.metadata.checksum {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Snapshot checksum mismatch").into());
        }

        if let Some(directory) = &self.directory {
            let file_name = format!(
                "{}{}_{}",
                SNAPSHOT_FILE_PREFIX,
                snapshot.metadata.last_included_term.as_u64(),
                snapshot.metadata.last_included_index.as_u64()
            );
            let tmp_path = directory.join(SNAPSHOT_TMP_FILE);
            let path = directory.join(&file_name);

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&encode_header(&snapshot.metadata))?;
            file.write_all(&snapshot.data)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &path)?;
            File::open(directory)?.sync_all()?;

            for dir_entry in fs::read_dir(directory)? {
                let old_path = dir_entry?.path();
                if old_path != path && parse_snapshot_file_name(&old_path).is_some() {
                    if let Err(e) = fs::remove_file(&old_path) {
                        slog::warn!(self.logger, "Failed to delete old snapshot {:?}: {:?}", old_path, e);
                    }
                }
            }
        }

        slog::info!(
            self.logger,
            "Saved snapshot at index {:?} term {:?} ({} bytes)",
            snapshot.metadata.last_included_index,
            snapshot.metadata.last_included_term,
            snapshot.metadata.size
        );

        let snapshot = Arc::new(snapshot);
        self.latest.replace(snapshot.clone());
        Ok(snapshot)
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SaveSnapshotError {
    #[error("Snapshot at {rejected:?} is not newer than the latest one at {latest:?}")]
    NotNewer { latest: Index, rejected: Index },
    #[error("Failed to persist snapshot: {0}")]
    Io(#[from] io::Error),
}

impl From<SaveSnapshotError> for io::Error {
    fn from(e: SaveSnapshotError) -> Self {
        match e {
            SaveSnapshotError::Io(e) => e,
            e @ SaveSnapshotError::NotNewer { .. } => io::Error::new(io::ErrorKind::InvalidInput, e.to_string()),
        }
    }
}

fn parse_snapshot_file_name(path: &Path) -> Option<Index> {
    let name = path.file_name()?.to_str()?;
    let suffix = name.strip_prefix(SNAPSHOT_FILE_PREFIX)?;
    let mut parts = suffix.splitn(2, '_');
    let _term: u64 = parts.next()?.parse().ok()?;
    let index: u64 = parts.next()?.parse().ok()?;
    Index::from_u64(index)
}

fn encode_header(metadata: &SnapshotMetadata) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_u8(SNAPSHOT_FORMAT_VERSION);
    buf.put_u64_le(metadata.last_included_index.as_u64());
    buf.put_u64_le(metadata.last_included_term.as_u64());
    buf.put_u32_le(metadata.checksum);
    buf.put_u64_le(metadata.size);
    put_configuration(&mut buf, &metadata.configuration);
    buf
}

fn read_snapshot_file(path: &Path) -> io::Result<Snapshot> {
    let corrupt = |reason: &str| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Corrupt snapshot file {:?}: {}", path, reason),
        )
    };

    let bytes = fs::read(path)?;
    let mut buf = bytes.as_slice();
    if buf.remaining() < 1 + 8 + 8 + 4 + 8 {
        return Err(corrupt("too short"));
    }
    if buf.get_u8() != SNAPSHOT_FORMAT_VERSION {
        return Err(corrupt("unknown version"));
    }
    let last_included_index = Index::from_u64(buf.get_u64_le()).ok_or_else(|| corrupt("zero index"))?;
    let last_included_term = Term::new(buf.get_u64_le());
    let checksum = buf.get_u32_le();
    let size = buf.get_u64_le();
    let configuration = get_configuration(&mut buf)?;

    if buf.remaining() as u64 != size {
        return Err(corrupt("size mismatch"));
    }
    if crc32fast::hash(buf) != checksum {
        return Err(corrupt("checksum mismatch"));
    }

    Ok(Snapshot {
        metadata: SnapshotMetadata {
            last_included_index,
            last_included_term,
            configuration,
            checksum,
            size,
        },
        data: Bytes::copy_from_slice(buf),
    })
}

/// A snapshot being received from the leader, one chunk at a time and strictly in order.
pub(crate) struct IncomingSnapshot {
    leader_term: Term,
    metadata: SnapshotMetadata,
    data: Vec<u8>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub(crate) enum IncomingSnapshotError {
    #[error("Expected chunk at offset {expected_offset}")]
    OffsetMismatch { expected_offset: u64 },
    #[error("Snapshot data doesn't match its metadata")]
    Corrupt,
}

impl IncomingSnapshot {
    pub(crate) fn new(leader_term: Term, metadata: SnapshotMetadata) -> Self {
        IncomingSnapshot {
            leader_term,
            metadata,
            data: Vec::new(),
        }
    }

    /// True if this transfer is for the same snapshot, from the same leader.
    pub(crate) fn is_same_transfer(&self, leader_term: Term, metadata: &SnapshotMetadata) -> bool {
        self.leader_term == leader_term && &self.metadata == metadata
    }

    pub(crate) fn received_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    pub(crate) fn accept_chunk(&mut self, offset: u64, chunk: &[u8]) -> Result<(), IncomingSnapshotError> {
        if offset != self.received_bytes() {
            return Err(IncomingSnapshotError::OffsetMismatch {
                expected_offset: self.received_bytes(),
            });
        }
        if self.received_bytes() + chunk.len() as u64 > self.metadata.size {
            return Err(IncomingSnapshotError::Corrupt);
        }

        self.data.extend_from_slice(chunk);
        Ok(())
    }

    /// Called after the last chunk. Verifies the assembled data.
    pub(crate) fn finish(self) -> Result<Snapshot, IncomingSnapshotError> {
        if self.received_bytes() != self.metadata.size || crc32fast::hash(&self.data) != self.metadata.checksum {
            return Err(IncomingSnapshotError::Corrupt);
        }

        Ok(Snapshot {
            metadata: self.metadata,
            data: Bytes::from(self.data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{ReplicaId, ReplicaInfoBlob, ReplicaMetadata};
    use std::net::Ipv4Addr;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn configuration() -> ClusterConfiguration {
        ClusterConfiguration::stable(vec![ReplicaMetadata::new(
            ReplicaId::new("a"),
            Ipv4Addr::LOCALHOST,
            7000,
            ReplicaInfoBlob::new(1),
        )])
    }

    #[test]
    fn saved_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = SnapshotStore::open(test_logger(), dir.path().to_path_buf()).unwrap();
            assert!(store.latest().is_none());

            store
                .save(Snapshot::new(Index::new(10), Term::new(2), configuration(), Bytes::from_static(b"old")))
                .unwrap();
            store
                .save(Snapshot::new(Index::new(20), Term::new(3), configuration(), Bytes::from_static(b"new")))
                .unwrap();
        }

        let store = SnapshotStore::open(test_logger(), dir.path().to_path_buf()).unwrap();
        let latest = store.latest().unwrap();
        assert_eq!(latest.metadata.last_included_index, Index::new(20));
        assert_eq!(latest.metadata.last_included_term, Term::new(3));
        assert_eq!(latest.metadata.configuration, configuration());
        assert_eq!(latest.data, Bytes::from_static(b"new"));

        // Only the latest is kept.
        let num_files = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(num_files, 1);
    }

    #[test]
    fn older_snapshot_never_replaces_newer_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::open(test_logger(), dir.path().to_path_buf()).unwrap();
        store
            .save(Snapshot::new(Index::new(21), Term::new(2), configuration(), Bytes::from_static(b"leader")))
            .unwrap();

        // A local snapshot that was started before the leader's one got installed.
        let stale = Snapshot::new(Index::new(2), Term::new(1), configuration(), Bytes::from_static(b"local"));
        match store.save(stale) {
            Err(SaveSnapshotError::NotNewer { latest, rejected }) => {
                assert_eq!(latest, Index::new(21));
                assert_eq!(rejected, Index::new(2));
            }
            other => panic!("Expected stale snapshot to be rejected, got {:?}", other.map(|s| s.metadata.clone())),
        }
        let same = Snapshot::new(Index::new(21), Term::new(2), configuration(), Bytes::from_static(b"again"));
        assert!(matches!(store.save(same), Err(SaveSnapshotError::NotNewer { .. })));

        assert_eq!(store.latest_index(), Some(Index::new(21)));
        let reopened = SnapshotStore::open(test_logger(), dir.path().to_path_buf()).unwrap();
        let latest = reopened.latest().unwrap();
        assert_eq!(latest.metadata.last_included_index, Index::new(21));
        assert_eq!(latest.data, Bytes::from_static(b"leader"));
    }

    #[test]
    fn corrupt_snapshot_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::open(test_logger(), dir.path().to_path_buf()).unwrap();
        store
            .save(Snapshot::new(Index::new(5), Term::new(1), configuration(), Bytes::from_static(b"state")))
            .unwrap();

        let path = dir.path().join("snapshot.1_5");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let err = SnapshotStore::open(test_logger(), dir.path().to_path_buf()).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn incoming_chunks_must_arrive_in_order() {
        let full = Snapshot::new(Index::new(7), Term::new(2), configuration(), Bytes::from_static(b"0123456789"));
        let mut incoming = IncomingSnapshot::new(Term::new(3), full.metadata.clone());
        assert!(incoming.is_same_transfer(Term::new(3), &full.metadata));
        assert!(!incoming.is_same_transfer(Term::new(4), &full.metadata));

        incoming.accept_chunk(0, b"0123").unwrap();
        assert_eq!(
            incoming.accept_chunk(8, b"89"),
            Err(IncomingSnapshotError::OffsetMismatch { expected_offset: 4 })
        );
        incoming.accept_chunk(4, b"456789").unwrap();

        let assembled = incoming.finish().unwrap();
        assert_eq!(assembled.data, full.data);
    }

    #[test]
    fn incoming_snapshot_with_bad_checksum_is_rejected() {
        let snapshot = Snapshot::new(Index::new(7), Term::new(2), configuration(), Bytes::from_static(b"abc"));
        let mut metadata = snapshot.metadata;
        metadata.checksum ^= 1;

        let mut incoming = IncomingSnapshot::new(Term::new(3), metadata);
        incoming.accept_chunk(0, b"abc").unwrap();
        assert_eq!(incoming.finish().err(), Some(IncomingSnapshotError::Corrupt));
    }
}
