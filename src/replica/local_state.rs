use crate::replica::ReplicaId;
use bytes::{Buf, BufMut};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::fmt;

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub(crate) struct Term(u64);

impl Term {
    pub(crate) fn new(term: u64) -> Self {
        Term(term)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn next(&self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState is used whenever the raft algorithm requires that something is persisted
/// to a durable store to guarantee safety. Not everything that uses disk has to go through this,
/// only algorithm-correctness-critical ones.
///
/// Store methods are CAS-like: they return `Ok(true)` if state was mutated, and only return once
/// the mutation is durable. An `Err` means the new state may or may not have been persisted, so
/// the caller must stop using this replica.
pub(crate) trait PersistentLocalState: Send {
    /// Set current term to `new_term` atomically, iff it is larger than current term. Clears vote.
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool>;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId) -> io::Result<bool>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>);
}

/// Term and vote held only in memory. Used by replicas without a storage directory.
pub(crate) struct VolatileLocalState {
    current_term: Term,
    voted_for_this_term: Option<Arc<ReplicaId>>,
    my_replica_id: Arc<ReplicaId>,
}

impl VolatileLocalState {
    pub(crate) fn new(my_replica_id: ReplicaId) -> Self {
        VolatileLocalState {
            current_term: Term::new(0),
            voted_for_this_term: None,
            my_replica_id: Arc::new(my_replica_id),
        }
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool> {
        if new_term <= self.current_term {
            return Ok(false);
        }

        self.current_term = new_term;
        self.voted_for_this_term = None;
        Ok(true)
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> io::Result<bool> {
        if expected_term != self.current_term || self.voted_for_this_term.is_some() {
            return Ok(false);
        }

        self.voted_for_this_term.replace(Arc::new(vote));
        Ok(true)
    }

    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term> {
        self.current_term = self.current_term.next();
        self.voted_for_this_term.replace(self.my_replica_id.clone());

        Ok(self.current_term)
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        (self.current_term, self.voted_for_this_term.clone())
    }
}

/// FileLocalState keeps term and vote in a single small file. Every change is written to a temp
/// file, fsync'd, then renamed over the old file, so a crash leaves either the old or new state.
///
/// ```text
/// +-----+-----------+-----------+-------------------+-----------+
/// | Vrs | Term (u64)| VoteLen   | Vote (replica id) |  CRC32    |
/// | (1) |    (8)    |   (2)     |   (VoteLen)       |   (4)     |
/// +-----+-----------+-----------+-------------------+-----------+
/// ```
///
/// `VoteLen` 0 means no vote. Integers are little-endian.
pub(crate) struct FileLocalState {
    path: PathBuf,
    inner: VolatileLocalState,
}

const LOCAL_STATE_FORMAT_VERSION: u8 = 1;

impl FileLocalState {
    pub(crate) fn open(directory: &Path, my_replica_id: ReplicaId) -> io::Result<Self> {
        fs::create_dir_all(directory)?;
        let path = directory.join("meta");

        let mut inner = VolatileLocalState::new(my_replica_id);
        match fs::read(&path) {
            Ok(bytes) => {
                let (term, vote) = decode(&bytes)?;
                inner.current_term = term;
                inner.voted_for_this_term = vote.map(Arc::new);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(FileLocalState { path, inner })
    }

    fn persist(&self, term: Term, vote: Option<&ReplicaId>) -> io::Result<()> {
        let bytes = encode(term, vote)?;
        let tmp_path = self.path.with_extension("tmp");

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            File::open(parent)?.sync_all()?;
        }

        Ok(())
    }
}

impl PersistentLocalState for FileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool> {
        if new_term <= self.inner.current_term {
            return Ok(false);
        }

        self.persist(new_term, None)?;
        self.inner.store_term_if_increased(new_term)
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> io::Result<bool> {
        if expected_term != self.inner.current_term || self.inner.voted_for_this_term.is_some() {
            return Ok(false);
        }

        self.persist(expected_term, Some(&vote))?;
        self.inner.store_vote_for_term_if_unvoted(expected_term, vote)
    }

    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term> {
        let new_term = self.inner.current_term.next();
        self.persist(new_term, Some(&self.inner.my_replica_id))?;
        self.inner.increment_term_and_vote_for_self()
    }

    fn current_term(&self) -> Term {
        self.inner.current_term()
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        self.inner.voted_for_current_term()
    }
}

fn encode(term: Term, vote: Option<&ReplicaId>) -> io::Result<Vec<u8>> {
    let vote_bytes = vote.map(|v| v.as_str().as_bytes()).unwrap_or(&[]);
    if vote_bytes.len() > u16::MAX as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "Replica id too long"));
    }

    let mut buf = Vec::with_capacity(1 + 8 + 2 + vote_bytes.len() + 4);
    buf.put_u8(LOCAL_STATE_FORMAT_VERSION);
    buf.put_u64_le(term.as_u64());
    buf.put_u16_le(vote_bytes.len() as u16);
    buf.put_slice(vote_bytes);
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);

    Ok(buf)
}

fn decode(bytes: &[u8]) -> io::Result<(Term, Option<ReplicaId>)> {
    let corrupt = |reason: &str| io::Error::new(io::ErrorKind::InvalidData, format!("Corrupt meta file: {}", reason));

    if bytes.len() < 1 + 8 + 2 + 4 {
        return Err(corrupt("too short"));
    }
    let (body, mut crc_bytes) = bytes.split_at(bytes.len() - 4);
    if crc32fast::hash(body) != crc_bytes.get_u32_le() {
        return Err(corrupt("checksum mismatch"));
    }

    let mut body = body;
    if body.get_u8() != LOCAL_STATE_FORMAT_VERSION {
        return Err(corrupt("unknown version"));
    }
    let term = Term::new(body.get_u64_le());
    let vote_len = body.get_u16_le() as usize;
    if body.remaining() != vote_len {
        return Err(corrupt("bad vote length"));
    }

    let vote = if vote_len == 0 {
        None
    } else {
        let id = String::from_utf8(body.to_vec()).map_err(|_| corrupt("vote is not utf-8"))?;
        Some(ReplicaId::new(id))
    };

    Ok((term, vote))
}
