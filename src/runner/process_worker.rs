use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProcessTaskError;

/// Runs one item per child process.
///
/// For every item the child is started with piped stdio, receives the item as
/// a single JSON document on stdin (followed by EOF), and must print its
/// result as a single JSON document on stdout and exit with status 0. Anything
/// written to stderr is kept for the error report.
///
/// Because each child is a separate process, state that lives in the parent
/// (a [`RateLimiter`](crate::RateLimiter), a cache, a client) is not visible
/// to it. Rate limiting across children needs a limiter the children share
/// outside this process.
///
/// # Example
///
/// ```rust,no_run
/// use rate_guard_runner::{ProcessWorker, TaskRunner};
///
/// // `cat` echoes its input, so every item comes back unchanged
/// let worker: ProcessWorker<String> = ProcessWorker::new("cat");
/// let report = TaskRunner::new(2)
///     .unwrap()
///     .run_processes(vec!["a".to_string(), "b".to_string()], &worker)
///     .unwrap();
///
/// assert_eq!(report.outcomes[1].value().map(String::as_str), Some("b"));
/// ```
pub struct ProcessWorker<R> {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    _output: PhantomData<fn() -> R>,
}

impl<R> fmt::Debug for ProcessWorker<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessWorker")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("envs", &self.envs)
            .field("current_dir", &self.current_dir)
            .finish()
    }
}

impl<R> Clone for ProcessWorker<R> {
    fn clone(&self) -> Self {
        ProcessWorker {
            program: self.program.clone(),
            args: self.args.clone(),
            envs: self.envs.clone(),
            current_dir: self.current_dir.clone(),
            _output: PhantomData,
        }
    }
}

impl<R> ProcessWorker<R> {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        ProcessWorker {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            _output: PhantomData,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl<R: DeserializeOwned> ProcessWorker<R> {
    /// Runs a single item in a fresh child and decodes its output.
    ///
    /// # Errors
    ///
    /// See [`ProcessTaskError`] for the per-stage failures.
    pub fn run_item<T: Serialize + ?Sized>(&self, item: &T) -> Result<R, ProcessTaskError> {
        let input = serde_json::to_vec(item).map_err(ProcessTaskError::Encode)?;

        let mut child = self
            .command()
            .spawn()
            .map_err(|source| ProcessTaskError::Spawn {
                program: self.program.to_string_lossy().into_owned(),
                source,
            })?;
        tracing::trace!(pid = child.id(), "child process started");

        // Feed stdin from its own thread so a child that writes before it
        // finishes reading cannot deadlock against a full pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            thread::spawn(move || -> io::Result<()> {
                stdin.write_all(&input)?;
                stdin.flush()
            })
        });

        let output = child.wait_with_output()?;

        let write_result = match writer.map(thread::JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(io::Error::new(io::ErrorKind::Other, "stdin writer panicked")),
            None => Ok(()),
        };

        if !output.status.success() {
            return Err(ProcessTaskError::ExitStatus {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        match write_result {
            // The child may legitimately exit without reading all of its input
            Err(e) if e.kind() != io::ErrorKind::BrokenPipe => return Err(e.into()),
            _ => {}
        }

        serde_json::from_slice(&output.stdout).map_err(ProcessTaskError::Decode)
    }
}
