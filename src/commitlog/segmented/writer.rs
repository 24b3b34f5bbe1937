use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

/// File mutations executed by the writer thread, in submission order.
pub(super) enum WriteOp {
    /// Write already-framed records to the end of the open segment.
    Append { records: Vec<Vec<u8>>, sync: bool },
    /// Sync and rename the open segment, then start a new empty one.
    Roll { closed_path: PathBuf, new_open_path: PathBuf },
    /// Delete files, then (re)open `reopen` as the open segment.
    ReplaceOpen { delete: Vec<PathBuf>, reopen: Reopen },
    /// Delete files that no longer hold live entries.
    Delete { paths: Vec<PathBuf> },
    Flush,
}

/// Describes the file that becomes the open segment. It's renamed from `from` if the paths differ,
/// created if missing, and cut to `len` bytes.
pub(super) struct Reopen {
    pub(super) from: PathBuf,
    pub(super) to: PathBuf,
    pub(super) len: u64,
}

struct WriteRequest {
    op: WriteOp,
    reply: mpsc::SyncSender<io::Result<()>>,
}

/// LogWriter owns the single thread allowed to mutate segment files. Callers block until their
/// operation completes.
pub(super) struct LogWriter {
    sender: Option<mpsc::SyncSender<WriteRequest>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl LogWriter {
    pub(super) fn spawn(logger: slog::Logger, open_path: PathBuf, queue_size: usize) -> io::Result<Self> {
        let file = open_for_append(&open_path)?;
        let (tx, rx) = mpsc::sync_channel(queue_size);

        let task = WriterTask {
            logger,
            file,
            path: open_path,
        };
        let thread = thread::Builder::new()
            .name("raft-log-writer".to_string())
            .spawn(move || task.run(rx))?;

        Ok(LogWriter {
            sender: Some(tx),
            thread: Some(thread),
        })
    }

    pub(super) fn submit(&self, op: WriteOp) -> io::Result<()> {
        let sender = self.sender.as_ref().ok_or_else(writer_gone)?;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        sender
            .send(WriteRequest { op, reply: reply_tx })
            .map_err(|_| writer_gone())?;

        reply_rx.recv().map_err(|_| writer_gone())?
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        // Closing the queue stops the thread once pending writes are done.
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "Log writer thread has exited")
}

fn open_for_append(path: &PathBuf) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn remove_if_exists(path: &PathBuf) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

struct WriterTask {
    logger: slog::Logger,
    file: File,
    path: PathBuf,
}

impl WriterTask {
    fn run(mut self, rx: mpsc::Receiver<WriteRequest>) {
        while let Ok(request) = rx.recv() {
            let result = self.execute(request.op);
            if let Err(e) = &result {
                slog::error!(self.logger, "Log writer failed on {:?}: {:?}", self.path, e);
            }
            let _ = request.reply.send(result);
        }

        if let Err(e) = self.file.sync_data() {
            slog::warn!(self.logger, "Failed final sync of {:?}: {:?}", self.path, e);
        }
    }

    fn execute(&mut self, op: WriteOp) -> io::Result<()> {
        match op {
            WriteOp::Append { records, sync } => {
                for record in records {
                    self.file.write_all(&record)?;
                }
                if sync {
                    self.file.sync_data()?;
                }
            }
            WriteOp::Roll {
                closed_path,
                new_open_path,
            } => {
                self.file.sync_data()?;
                fs::rename(&self.path, &closed_path)?;
                self.file = open_for_append(&new_open_path)?;
                self.path = new_open_path;
                slog::debug!(self.logger, "Rolled segment into {:?}", closed_path);
            }
            WriteOp::ReplaceOpen { delete, reopen } => {
                for path in delete.iter() {
                    remove_if_exists(path)?;
                }
                if reopen.from != reopen.to {
                    fs::rename(&reopen.from, &reopen.to)?;
                }
                let file = open_for_append(&reopen.to)?;
                file.set_len(reopen.len)?;
                file.sync_all()?;
                self.file = file;
                self.path = reopen.to;
            }
            WriteOp::Delete { paths } => {
                for path in paths.iter() {
                    remove_if_exists(path)?;
                }
            }
            WriteOp::Flush => self.file.sync_data()?,
        }

        Ok(())
    }
}
