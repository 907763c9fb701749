//! Scoped subprocess pipes with guaranteed reap.
//!
//! Children are spawned with a fixed argv, never through a shell. Two
//! usage shapes:
//!
//! - [`run_command`]: one-shot: spawn, read stdout to EOF, reap, surface
//!   the exit status.
//! - [`SubprocessPipe`]: long-lived: a worker pins one child, repeatedly
//!   writes argument records to its stdin and reads responses back. On
//!   release the write end is closed, the read end drained to EOF, and the
//!   child reaped; dropping the pipe performs the same teardown best
//!   effort so a child process is never leaked.

use std::ffi::OsStr;
use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};

/// Errors from spawning or talking to a child process.
#[derive(Debug)]
#[non_exhaustive]
pub enum ProcessError {
    /// The child could not be spawned.
    Spawn { command: String, source: io::Error },
    /// A pipe read or write failed.
    Io {
        context: &'static str,
        source: io::Error,
    },
    /// The child exited with a non-zero status.
    NonZeroExit { command: String, code: Option<i32> },
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { command, source } => {
                write!(f, "failed to spawn `{command}`: {source}")
            }
            Self::Io { context, source } => write!(f, "{context}: {source}"),
            Self::NonZeroExit { command, code } => match code {
                Some(code) => write!(f, "`{command}` exited with status {code}"),
                None => write!(f, "`{command}` was terminated by a signal"),
            },
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } | Self::Io { source, .. } => Some(source),
            Self::NonZeroExit { .. } => None,
        }
    }
}

fn command_line(program: &Path, args: &[&str]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

fn base_command(program: &Path, args: &[&str], envs: &[(&str, &OsStr)]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd
}

/// Runs a command to completion and returns its stdout, lossily decoded.
///
/// Stderr is inherited from the parent.
///
/// # Errors
/// [`ProcessError::Spawn`] if the child cannot start,
/// [`ProcessError::NonZeroExit`] if it exits unsuccessfully.
pub fn run_command(
    program: &Path,
    args: &[&str],
    envs: &[(&str, &OsStr)],
) -> Result<String, ProcessError> {
    let child = base_command(program, args, envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            command: command_line(program, args),
            source,
        })?;

    let output = child.wait_with_output().map_err(|source| ProcessError::Io {
        context: "waiting for child",
        source,
    })?;
    if !output.status.success() {
        return Err(ProcessError::NonZeroExit {
            command: command_line(program, args),
            code: output.status.code(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// A bidirectional pipe to a long-lived child process.
pub struct SubprocessPipe {
    child: Child,
    command: String,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl SubprocessPipe {
    /// Spawns a child with piped stdin and stdout. Stderr is inherited.
    pub fn spawn(
        program: &Path,
        args: &[&str],
        envs: &[(&str, &OsStr)],
    ) -> Result<Self, ProcessError> {
        let command = command_line(program, args);
        let mut child = base_command(program, args, envs)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = match child.stdout.take() {
            Some(stdout) => BufReader::new(stdout),
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProcessError::Spawn {
                    command,
                    source: io::Error::other("child stdout was not captured"),
                });
            }
        };
        Ok(Self {
            child,
            command,
            stdin,
            stdout,
        })
    }

    /// Writes bytes to the child's stdin and flushes.
    ///
    /// # Errors
    /// `Io` if the write end is already closed or the write fails (a dead
    /// child surfaces here as a broken pipe).
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), ProcessError> {
        let stdin = self.stdin.as_mut().ok_or(ProcessError::Io {
            context: "writing to child stdin",
            source: io::Error::new(io::ErrorKind::BrokenPipe, "write end closed"),
        })?;
        stdin
            .write_all(bytes)
            .and_then(|()| stdin.flush())
            .map_err(|source| ProcessError::Io {
                context: "writing to child stdin",
                source,
            })
    }

    /// Closes the write end so the child sees EOF on its stdin.
    pub fn close_write(&mut self) {
        self.stdin = None;
    }

    /// Buffered reader over the child's stdout.
    pub fn reader(&mut self) -> &mut dyn BufRead {
        &mut self.stdout
    }

    /// Closes the pipe: drops the write end, drains stdout to EOF, reaps
    /// the child, and returns its exit status.
    pub fn close(mut self) -> Result<ExitStatus, ProcessError> {
        self.shutdown().map_err(|source| ProcessError::Io {
            context: "reaping child",
            source,
        })
    }

    /// Like [`close`](Self::close), but also fails on a non-zero exit.
    pub fn close_checked(self) -> Result<(), ProcessError> {
        let command = self.command.clone();
        let status = self.close()?;
        if !status.success() {
            return Err(ProcessError::NonZeroExit {
                command,
                code: status.code(),
            });
        }
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<ExitStatus> {
        self.stdin = None;
        let _ = io::copy(&mut self.stdout, &mut io::sink());
        self.child.wait()
    }
}

impl Drop for SubprocessPipe {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl fmt::Debug for SubprocessPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubprocessPipe")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn bin(name: &str) -> Option<PathBuf> {
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    #[test]
    fn one_shot_captures_stdout() {
        let Some(echo) = bin("echo") else { return };
        let out = run_command(&echo, &["hello"], &[]).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        let Some(false_bin) = bin("false") else {
            return;
        };
        let err = run_command(&false_bin, &[], &[]).unwrap_err();
        assert!(matches!(err, ProcessError::NonZeroExit { .. }));
    }

    #[test]
    fn long_lived_pipe_echoes_lines() {
        let Some(cat) = bin("cat") else { return };
        let mut pipe = SubprocessPipe::spawn(&cat, &[], &[]).unwrap();
        pipe.send(b"first\n").unwrap();
        let mut line = String::new();
        pipe.reader().read_line(&mut line).unwrap();
        assert_eq!(line, "first\n");

        pipe.send(b"second\n").unwrap();
        line.clear();
        pipe.reader().read_line(&mut line).unwrap();
        assert_eq!(line, "second\n");

        pipe.close_checked().unwrap();
    }

    #[test]
    fn close_reaps_after_write_half_shutdown() {
        let Some(cat) = bin("cat") else { return };
        let mut pipe = SubprocessPipe::spawn(&cat, &[], &[]).unwrap();
        pipe.send(b"tail\n").unwrap();
        pipe.close_write();
        let status = pipe.close().unwrap();
        assert!(status.success());
    }
}
