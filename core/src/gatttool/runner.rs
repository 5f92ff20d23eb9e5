//! Subprocess execution with a hard deadline.
//!
//! `gatttool` can hang forever on radio errors and in listen mode never exits
//! on its own, so every invocation runs as the leader of its own process
//! group. When the deadline passes the whole group gets a single SIGINT and
//! whatever it printed so far is collected.

use std::fmt;
use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Program plus arguments, spawned without a shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// The deadline passed and the process group was interrupted.
    pub timed_out: bool,
}

/// Runs external commands for the `gatttool` backend.
pub trait CommandRunner: Send {
    fn run(&mut self, invocation: &Invocation, timeout: Duration) -> io::Result<CommandOutput>;

    /// Pause between two attempts of the same operation.
    fn backoff(&mut self, delay: Duration) {
        thread::sleep(delay);
    }
}

/// [`CommandRunner`] spawning real processes.
#[derive(Clone, Debug)]
pub struct SystemRunner {
    /// How long to wait for output after the interrupt before killing the
    /// child outright.
    pub drain_grace: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_secs(5),
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&mut self, invocation: &Invocation, timeout: Duration) -> io::Result<CommandOutput> {
        debug!(%invocation, ?timeout, "spawning");
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let (stdout, timed_out) = match stdout.recv_timeout(timeout) {
            Ok(bytes) => (bytes, false),
            Err(RecvTimeoutError::Disconnected) => (Vec::new(), false),
            Err(RecvTimeoutError::Timeout) => {
                interrupt_group(&child)?;
                let bytes = match stdout.recv_timeout(self.drain_grace) {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        warn!(
                            program = %invocation.program,
                            "process ignored interrupt, killing it"
                        );
                        let _ = child.kill();
                        stdout.recv_timeout(self.drain_grace).unwrap_or_default()
                    }
                };
                (bytes, true)
            }
        };

        reap(&mut child, self.drain_grace)?;
        let stderr = stderr.recv_timeout(self.drain_grace).unwrap_or_default();

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            timed_out,
        })
    }
}

fn drain<R>(pipe: Option<R>) -> Receiver<Vec<u8>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        thread::spawn(move || {
            let mut buf = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut buf) {
                debug!(error = %e, "pipe read ended with error");
            }
            let _ = tx.send(buf);
        });
    }
    rx
}

/// Send SIGINT to the process group led by `child`.
fn interrupt_group(child: &Child) -> io::Result<()> {
    let pgid = Pid::from_raw(child.id() as i32);
    match killpg(pgid, Signal::SIGINT) {
        Ok(()) => {
            debug!(pgid = child.id(), "interrupted hanging process group");
            Ok(())
        }
        // exited between the deadline and the signal
        Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

fn reap(child: &mut Child, grace: Duration) -> io::Result<()> {
    let deadline = Instant::now() + grace;
    loop {
        if let Some(status) = child.try_wait()? {
            debug!(%status, "process finished");
            return Ok(());
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            child.wait()?;
            return Ok(());
        }
        thread::sleep(Duration::from_millis(10));
    }
}
