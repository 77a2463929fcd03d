//! Asynchronous file operations completed through one-shot tokens.
//!
//! A [`FileBackend`] accepts a [`FileOp`] together with an [`IoCompletion`]
//! and returns immediately. Some time later, on a thread of its choosing, it
//! completes the token with an [`IoOutcome`]. Results follow the descriptor
//! convention: a non-negative value on success (descriptor, byte count or new
//! offset), `-1` on failure.
//!
//! A token that is dropped without being completed reports failure, so a
//! backend that loses an operation never leaves its thread blocked forever.
//!
//! # Descriptors
//!
//! [`ThreadedFileBackend`] binds descriptors `0`, `1` and `2` to the standard
//! streams of the host process. Descriptors returned by [`FileOp::Open`] start
//! at `3` and are not reused after being closed.
//!
//! Reads from descriptor `0` may wait on a terminal indefinitely, so they are
//! served in order by a worker of their own. Every other operation keeps
//! completing while such a read is pending.

use std::{
    collections::HashMap,
    fmt,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    sync::{mpsc, Mutex},
    thread,
};

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::{Error, Result};

/// Result value reported for any failed operation.
pub const IO_FAILURE: i32 = -1;

bitflags! {
    /// Flags controlling how [`FileOp::Open`] opens a file.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 0x0001;
        /// Open for writing.
        const WRITE = 0x0002;
        /// Create the file if it does not exist.
        const CREATE = 0x0004;
        /// Truncate the file to zero length.
        const TRUNCATE = 0x0008;
        /// Append every write to the end of the file.
        const APPEND = 0x0010;
    }
}

/// Reference point of a [`FileOp::Seek`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the file.
    Start,
    /// From the current offset.
    Current,
    /// From the end of the file.
    End,
}

/// A file operation submitted to a [`FileBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileOp {
    /// Opens `path`; completes with the new descriptor.
    Open {
        /// Host path of the file.
        path: String,
        /// Access and creation flags.
        flags: OpenFlags,
        /// Permission bits for newly created files (unix only).
        mode: u32,
    },
    /// Closes a descriptor; completes with `0`.
    Close {
        /// Descriptor to close.
        fd: i32,
    },
    /// Reads up to `len` bytes; completes with the byte count and the data.
    Read {
        /// Descriptor to read from.
        fd: i32,
        /// Maximum number of bytes.
        len: usize,
    },
    /// Writes `data`; completes with the byte count written.
    Write {
        /// Descriptor to write to.
        fd: i32,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Moves the file offset; completes with the new offset.
    Seek {
        /// Descriptor to seek.
        fd: i32,
        /// Signed distance from `whence`.
        offset: i32,
        /// Reference point.
        whence: Whence,
    },
}

/// Outcome of a completed operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IoOutcome {
    /// Descriptor, byte count or offset; negative on failure.
    pub result: i32,
    /// Bytes produced by a read.
    pub data: Vec<u8>,
}

impl IoOutcome {
    /// A successful outcome without payload.
    #[must_use]
    pub fn value(result: i32) -> Self {
        Self {
            result,
            data: Vec::new(),
        }
    }

    /// The failure outcome.
    #[must_use]
    pub fn failed() -> Self {
        Self::value(IO_FAILURE)
    }
}

/// Callback receiving the outcome of an operation.
pub type CompletionCallback = Box<dyn FnOnce(IoOutcome) + Send>;

/// One-shot completion token handed to a [`FileBackend`].
pub struct IoCompletion {
    callback: Option<CompletionCallback>,
}

impl fmt::Debug for IoCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoCompletion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

impl IoCompletion {
    /// Wraps the callback that receives the outcome.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(IoOutcome) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// Completes the operation.
    pub fn complete(mut self, outcome: IoOutcome) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }
}

impl Drop for IoCompletion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            warn!("file operation dropped without completion");
            callback(IoOutcome::failed());
        }
    }
}

/// Asynchronous file I/O provider.
///
/// Implementations must eventually complete or drop every token they accept.
/// The runtime submits outside of the scheduler critical section, so a token
/// may also be completed inline from [`FileBackend::submit`].
pub trait FileBackend: Send + Sync {
    /// Queues `op`; `completion` receives its outcome.
    fn submit(&self, op: FileOp, completion: IoCompletion);

    /// Stops accepting work. Operations submitted afterwards fail.
    fn shutdown(&self) {}
}

enum Descriptor {
    Stdin,
    Stdout,
    Stderr,
    File(File),
}

/// Descriptor table of the worker thread.
struct FileTable {
    descriptors: HashMap<i32, Descriptor>,
    next_fd: i32,
}

impl FileTable {
    fn new() -> Self {
        let mut descriptors = HashMap::new();
        descriptors.insert(0, Descriptor::Stdin);
        descriptors.insert(1, Descriptor::Stdout);
        descriptors.insert(2, Descriptor::Stderr);
        Self {
            descriptors,
            next_fd: 3,
        }
    }

    fn execute(&mut self, op: FileOp) -> io::Result<IoOutcome> {
        match op {
            FileOp::Open { path, flags, mode } => {
                let file = open_options(flags, mode).open(&path)?;
                let fd = self.next_fd;
                self.next_fd += 1;
                self.descriptors.insert(fd, Descriptor::File(file));
                debug!("opened {path} as fd {fd}");
                Ok(IoOutcome::value(fd))
            }
            FileOp::Close { fd } => {
                match self.descriptors.remove(&fd) {
                    Some(Descriptor::File(mut file)) => file.flush()?,
                    Some(_) => {}
                    None => return Err(bad_descriptor(fd)),
                }
                Ok(IoOutcome::value(0))
            }
            FileOp::Read { fd, len } => {
                let Descriptor::File(file) = self.descriptor(fd)? else {
                    return Err(bad_descriptor(fd));
                };
                read_outcome(file, len)
            }
            FileOp::Write { fd, data } => {
                let count = match self.descriptor(fd)? {
                    Descriptor::Stdout => {
                        let mut out = io::stdout().lock();
                        out.write_all(&data)?;
                        out.flush()?;
                        data.len()
                    }
                    Descriptor::Stderr => {
                        io::stderr().lock().write_all(&data)?;
                        data.len()
                    }
                    Descriptor::File(file) => {
                        file.write_all(&data)?;
                        data.len()
                    }
                    Descriptor::Stdin => return Err(bad_descriptor(fd)),
                };
                Ok(IoOutcome::value(to_result(count)?))
            }
            FileOp::Seek { fd, offset, whence } => {
                let Descriptor::File(file) = self.descriptor(fd)? else {
                    return Err(bad_descriptor(fd));
                };
                let target = match whence {
                    Whence::Start => SeekFrom::Start(
                        u64::try_from(offset).map_err(|_| invalid_input("negative offset"))?,
                    ),
                    Whence::Current => SeekFrom::Current(i64::from(offset)),
                    Whence::End => SeekFrom::End(i64::from(offset)),
                };
                let position = file.seek(target)?;
                let position =
                    i32::try_from(position).map_err(|_| invalid_input("offset overflow"))?;
                Ok(IoOutcome::value(position))
            }
        }
    }

    fn is_stdin(&self, fd: i32) -> bool {
        matches!(self.descriptors.get(&fd), Some(Descriptor::Stdin))
    }

    fn descriptor(&mut self, fd: i32) -> io::Result<&mut Descriptor> {
        self.descriptors
            .get_mut(&fd)
            .ok_or_else(|| bad_descriptor(fd))
    }
}

fn open_options(flags: OpenFlags, mode: u32) -> OpenOptions {
    let mut options = OpenOptions::new();
    options
        .read(flags.contains(OpenFlags::READ))
        .write(flags.intersects(OpenFlags::WRITE | OpenFlags::TRUNCATE))
        .create(flags.contains(OpenFlags::CREATE))
        .truncate(flags.contains(OpenFlags::TRUNCATE))
        .append(flags.contains(OpenFlags::APPEND));
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    options
}

fn read_outcome(source: &mut dyn Read, len: usize) -> io::Result<IoOutcome> {
    let mut data = vec![0u8; len];
    let count = source.read(&mut data)?;
    data.truncate(count);
    Ok(IoOutcome {
        result: to_result(count)?,
        data,
    })
}

fn to_result(count: usize) -> io::Result<i32> {
    i32::try_from(count).map_err(|_| invalid_input("transfer too large"))
}

fn bad_descriptor(fd: i32) -> io::Error {
    invalid_input(&format!("bad file descriptor {fd}"))
}

fn invalid_input(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.to_string())
}

type Job = (FileOp, IoCompletion);

/// A pending read of descriptor `0`: the byte count and its token.
type InputJob = (usize, IoCompletion);

/// Default backend: executes operations in order on one worker thread over `std::fs`.
///
/// Reads of descriptor `0` are forwarded to a second worker, named
/// `<name>-stdin`, that owns the input stream.
pub struct ThreadedFileBackend {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
}

impl ThreadedFileBackend {
    /// Spawns the workers, reading descriptor `0` from the host's standard input.
    ///
    /// # Errors
    ///
    /// [`Error::InsufficientResources`] if a worker cannot be spawned.
    pub fn new(name: &str) -> Result<Self> {
        Self::with_input(name, Box::new(io::stdin()))
    }

    /// Spawns the workers, reading descriptor `0` from `input`.
    ///
    /// # Errors
    ///
    /// [`Error::InsufficientResources`] if a worker cannot be spawned.
    pub fn with_input(name: &str, input: Box<dyn Read + Send>) -> Result<Self> {
        let (input_sender, input_receiver) = mpsc::channel::<InputJob>();
        spawn_worker(format!("{name}-stdin"), move || {
            serve_input(input, &input_receiver);
        })?;

        let (sender, receiver) = mpsc::channel::<Job>();
        spawn_worker(name.to_string(), move || {
            let mut table = FileTable::new();
            for (op, completion) in receiver {
                trace!("executing {op:?}");
                match op {
                    FileOp::Read { fd, len } if table.is_stdin(fd) => {
                        // A failed send drops the token, which reports failure.
                        let _ = input_sender.send((len, completion));
                    }
                    op => {
                        let outcome = table.execute(op).unwrap_or_else(|error| {
                            debug!("file operation failed: {error}");
                            IoOutcome::failed()
                        });
                        completion.complete(outcome);
                    }
                }
            }
            debug!("file worker exiting");
        })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
        })
    }
}

fn spawn_worker<F>(name: String, body: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(body)
        .map(|_| ())
        .map_err(|error| {
            warn!("failed to spawn file worker: {error}");
            Error::InsufficientResources
        })
}

fn serve_input(mut input: Box<dyn Read + Send>, jobs: &mpsc::Receiver<InputJob>) {
    for (len, completion) in jobs {
        let outcome = read_outcome(&mut *input, len).unwrap_or_else(|error| {
            debug!("standard input read failed: {error}");
            IoOutcome::failed()
        });
        completion.complete(outcome);
    }
    debug!("input worker exiting");
}

impl FileBackend for ThreadedFileBackend {
    fn submit(&self, op: FileOp, completion: IoCompletion) {
        let Ok(sender) = self.sender.lock() else {
            return;
        };
        match sender.as_ref() {
            // A failed send hands the job back; dropping it fails the token.
            Some(sender) => {
                let _ = sender.send((op, completion));
            }
            None => drop(completion),
        }
    }

    fn shutdown(&self) {
        // The workers are detached: the main one exits once the queue drains, the
        // input one after that, unless it is blocked on a read right now.
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

impl Drop for ThreadedFileBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc::Receiver, time::Duration};

    use super::*;

    fn run(backend: &ThreadedFileBackend, op: FileOp) -> IoOutcome {
        let (tx, rx) = mpsc::channel();
        backend.submit(
            op,
            IoCompletion::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        wait(&rx)
    }

    fn wait(rx: &Receiver<IoOutcome>) -> IoOutcome {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    /// Input stream fed chunk by chunk from the test; end of input once the sender is gone.
    struct Pipe(Receiver<Vec<u8>>);

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Ok(chunk) = self.0.recv() else {
                return Ok(0);
            };
            let count = chunk.len().min(buf.len());
            buf[..count].copy_from_slice(&chunk[..count]);
            Ok(count)
        }
    }

    #[test]
    fn test_pending_stdin_read_does_not_stall_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt").to_string_lossy().into_owned();
        let (feed, pipe) = mpsc::channel();
        let backend = ThreadedFileBackend::with_input("file-test", Box::new(Pipe(pipe))).unwrap();

        let (tx, typed) = mpsc::channel();
        backend.submit(
            FileOp::Read { fd: 0, len: 16 },
            IoCompletion::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );

        let fd = run(
            &backend,
            FileOp::Open {
                path: path.clone(),
                flags: OpenFlags::WRITE | OpenFlags::CREATE,
                mode: 0o644,
            },
        )
        .result;
        assert_eq!(fd, 3);
        let data = b"while waiting".to_vec();
        assert_eq!(run(&backend, FileOp::Write { fd, data }).result, 13);
        assert_eq!(run(&backend, FileOp::Close { fd }).result, 0);
        assert!(typed.try_recv().is_err());

        feed.send(b"typed".to_vec()).unwrap();
        let read = wait(&typed);
        assert_eq!(read.result, 5);
        assert_eq!(read.data, b"typed");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "while waiting");

        // End of input reads as zero bytes.
        drop(feed);
        assert_eq!(run(&backend, FileOp::Read { fd: 0, len: 4 }).result, 0);
    }

    #[test]
    fn test_closed_stdin_is_not_readable() {
        let (_feed, pipe) = mpsc::channel();
        let backend = ThreadedFileBackend::with_input("file-test", Box::new(Pipe(pipe))).unwrap();
        assert_eq!(run(&backend, FileOp::Close { fd: 0 }).result, 0);
        assert_eq!(run(&backend, FileOp::Read { fd: 0, len: 4 }).result, IO_FAILURE);
        assert_eq!(run(&backend, FileOp::Read { fd: 1, len: 4 }).result, IO_FAILURE);
    }

    #[test]
    fn test_open_write_seek_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt").to_string_lossy().into_owned();
        let backend = ThreadedFileBackend::new("file-test").unwrap();

        let fd = run(
            &backend,
            FileOp::Open {
                path: path.clone(),
                flags: OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
                mode: 0o644,
            },
        )
        .result;
        assert_eq!(fd, 3);

        let written = run(
            &backend,
            FileOp::Write {
                fd,
                data: b"hello world".to_vec(),
            },
        );
        assert_eq!(written.result, 11);

        let offset = run(
            &backend,
            FileOp::Seek {
                fd,
                offset: 6,
                whence: Whence::Start,
            },
        );
        assert_eq!(offset.result, 6);

        let read = run(&backend, FileOp::Read { fd, len: 64 });
        assert_eq!(read.result, 5);
        assert_eq!(read.data, b"world");

        assert_eq!(run(&backend, FileOp::Close { fd }).result, 0);
        assert_eq!(run(&backend, FileOp::Close { fd }).result, IO_FAILURE);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello world");
    }

    #[test]
    fn test_descriptors_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").to_string_lossy().into_owned();
        let backend = ThreadedFileBackend::new("file-test").unwrap();
        let open = || FileOp::Open {
            path: path.clone(),
            flags: OpenFlags::WRITE | OpenFlags::CREATE,
            mode: 0o600,
        };

        let first = run(&backend, open()).result;
        run(&backend, FileOp::Close { fd: first });
        let second = run(&backend, open()).result;
        assert_eq!((first, second), (3, 4));
    }

    #[test]
    fn test_failures() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing").to_string_lossy().into_owned();
        let backend = ThreadedFileBackend::new("file-test").unwrap();

        let open = FileOp::Open {
            path: missing,
            flags: OpenFlags::READ,
            mode: 0,
        };
        assert_eq!(run(&backend, open).result, IO_FAILURE);
        assert_eq!(run(&backend, FileOp::Read { fd: 42, len: 1 }).result, IO_FAILURE);
        assert_eq!(
            run(
                &backend,
                FileOp::Seek {
                    fd: 1,
                    offset: 0,
                    whence: Whence::End
                }
            )
            .result,
            IO_FAILURE
        );
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let backend = ThreadedFileBackend::new("file-test").unwrap();
        backend.shutdown();
        assert_eq!(run(&backend, FileOp::Close { fd: 1 }).result, IO_FAILURE);
    }

    #[test]
    fn test_dropped_completion_reports_failure() {
        let (tx, rx) = mpsc::channel();
        let completion = IoCompletion::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        drop(completion);
        assert_eq!(wait(&rx), IoOutcome::failed());
    }
}
