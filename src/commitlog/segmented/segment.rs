use crate::commitlog::segmented::record::{self, Tail};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

const CLOSED_PREFIX: &str = "log_";
const OPEN_PREFIX: &str = "log_inprogress_";

/// A full, immutable segment file holding entries `[first, last]`.
#[derive(Clone, Debug)]
pub(super) struct ClosedSegment {
    pub(super) first: u64,
    pub(super) last: u64,
    pub(super) path: PathBuf,
}

/// The segment currently being appended to. Always resident in memory.
pub(super) struct OpenSegment {
    pub(super) first: u64,
    pub(super) payloads: Vec<Vec<u8>>,
    // Byte offset of each record within the file.
    pub(super) offsets: Vec<u64>,
    pub(super) byte_len: u64,
}

impl OpenSegment {
    pub(super) fn empty(first: u64) -> Self {
        OpenSegment {
            first,
            payloads: Vec::new(),
            offsets: Vec::new(),
            byte_len: 0,
        }
    }

    pub(super) fn from_payloads(first: u64, payloads: Vec<Vec<u8>>) -> Self {
        let mut segment = Self::empty(first);
        for payload in payloads {
            segment.push(payload);
        }
        segment
    }

    pub(super) fn push(&mut self, payload: Vec<u8>) {
        self.offsets.push(self.byte_len);
        self.byte_len += record::framed_size(&payload);
        self.payloads.push(payload);
    }

    /// Keep only the first `keep` records.
    pub(super) fn truncate(&mut self, keep: usize) {
        if keep < self.payloads.len() {
            self.byte_len = self.offsets[keep];
            self.payloads.truncate(keep);
            self.offsets.truncate(keep);
        }
    }

    pub(super) fn next(&self) -> u64 {
        self.first + self.payloads.len() as u64
    }
}

pub(super) fn closed_segment_path(dir: &Path, first: u64, last: u64) -> PathBuf {
    dir.join(format!("{}{}-{}", CLOSED_PREFIX, first, last))
}

pub(super) fn open_segment_path(dir: &Path, first: u64) -> PathBuf {
    dir.join(format!("{}{}", OPEN_PREFIX, first))
}

#[derive(Debug, PartialEq)]
enum SegmentName {
    Closed { first: u64, last: u64 },
    Open { first: u64 },
}

fn parse_segment_name(name: &str) -> Option<SegmentName> {
    if let Some(first) = name.strip_prefix(OPEN_PREFIX) {
        return first.parse().ok().map(|first| SegmentName::Open { first });
    }

    let range = name.strip_prefix(CLOSED_PREFIX)?;
    let mut parts = range.splitn(2, '-');
    let first: u64 = parts.next()?.parse().ok()?;
    let last: u64 = parts.next()?.parse().ok()?;
    if first == 0 || last < first {
        return None;
    }

    Some(SegmentName::Closed { first, last })
}

pub(super) struct SegmentListing {
    pub(super) closed: Vec<ClosedSegment>,
    pub(super) open: Vec<(u64, PathBuf)>,
}

/// Lists segment files in `dir`, sorted by first index. Unrelated files are ignored.
pub(super) fn list_segments(dir: &Path) -> io::Result<SegmentListing> {
    let mut closed = Vec::new();
    let mut open = Vec::new();

    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let file_name = dir_entry.file_name();
        let name = match file_name.to_str() {
            Some(name) => name,
            None => continue,
        };

        match parse_segment_name(name) {
            Some(SegmentName::Closed { first, last }) => closed.push(ClosedSegment {
                first,
                last,
                path: dir_entry.path(),
            }),
            Some(SegmentName::Open { first }) => open.push((first, dir_entry.path())),
            None => {}
        }
    }

    closed.sort_by_key(|s| s.first);
    open.sort_by_key(|(first, _)| *first);

    for pair in closed.windows(2) {
        if pair[0].last + 1 != pair[1].first {
            return Err(invalid_data(format!(
                "Gap between closed segments {:?} and {:?}",
                pair[0].path, pair[1].path
            )));
        }
    }

    Ok(SegmentListing { closed, open })
}

/// Reads every record of a closed segment. Closed segments were synced before being renamed, so
/// any corruption is surfaced as an error.
pub(super) fn load_closed(segment: &ClosedSegment) -> io::Result<Vec<Vec<u8>>> {
    let buf = fs::read(&segment.path)?;
    let decoded = record::decode_records(&buf);

    let expected = (segment.last - segment.first + 1) as usize;
    if decoded.tail != Tail::Clean || decoded.payloads.len() != expected {
        return Err(invalid_data(format!(
            "Closed segment {:?} is damaged: {:?} tail, {} of {} records readable",
            segment.path,
            decoded.tail,
            decoded.payloads.len(),
            expected
        )));
    }

    Ok(decoded.payloads)
}

/// Loads the open segment, cutting off a torn or corrupt tail left by a crash.
pub(super) fn recover_open(logger: &slog::Logger, first: u64, path: &Path) -> io::Result<OpenSegment> {
    let buf = fs::read(path)?;
    let decoded = record::decode_records(&buf);

    if decoded.tail != Tail::Clean {
        slog::warn!(
            logger,
            "Truncating {:?} tail of open segment {:?}: keeping {} bytes ({} records), dropping {} bytes",
            decoded.tail,
            path,
            decoded.valid_len,
            decoded.payloads.len(),
            buf.len() as u64 - decoded.valid_len,
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(decoded.valid_len)?;
        file.sync_all()?;
    }

    Ok(OpenSegment::from_payloads(first, decoded.payloads))
}

pub(super) fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_names() {
        assert_eq!(
            parse_segment_name("log_inprogress_17"),
            Some(SegmentName::Open { first: 17 })
        );
        assert_eq!(
            parse_segment_name("log_1-16"),
            Some(SegmentName::Closed { first: 1, last: 16 })
        );
        assert_eq!(parse_segment_name("log_16-1"), None);
        assert_eq!(parse_segment_name("log_0-1"), None);
        assert_eq!(parse_segment_name("meta"), None);
        assert_eq!(parse_segment_name("log_x-2"), None);

        let dir = Path::new("/data");
        assert_eq!(closed_segment_path(dir, 1, 16), Path::new("/data/log_1-16"));
        assert_eq!(open_segment_path(dir, 17), Path::new("/data/log_inprogress_17"));
    }

    #[test]
    fn open_segment_truncate_tracks_offsets() {
        let mut segment = OpenSegment::from_payloads(5, vec![vec![1; 2], vec![2; 4], vec![3; 8]]);
        assert_eq!(segment.next(), 8);
        assert_eq!(segment.byte_len, 3 * 8 + 14);

        segment.truncate(1);
        assert_eq!(segment.next(), 6);
        assert_eq!(segment.byte_len, 10);
    }
}
