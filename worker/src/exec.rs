// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

//! Subprocess execution for the script-side `exec` call.
//!
//! Deliberately synchronous, like the rest of the script surface: the
//! calling worker thread blocks until the child exits, while two plain
//! threads drain the output pipes so neither side can deadlock on a full
//! pipe.

use buffer::{Builder, Data};
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use tracing::warn;

/// Invoked when the child exits: the exit code, plus the captured stderr
/// unless the caller handles stderr itself.
pub type OnExit = Box<dyn FnOnce(i32, Option<&Data>)>;

/// Options for [`exec`].
#[derive(Default)]
pub struct ExecOptions {
    /// Bytes fed to the child's stdin.
    pub stdin: Option<Data>,
    /// When true there is no separate stderr capture: the child's stderr
    /// shares the stdout pipe, its bytes land in [`ExecResult::out`], and
    /// [`ExecResult::err`] stays unset.
    pub stderr: bool,
    /// Exit notification.
    pub on_exit: Option<OnExit>,
}

/// What [`exec`] returns.
pub struct ExecResult {
    /// Captured stdout.
    pub out: Data,
    /// Captured stderr, unless the caller opted out.
    pub err: Option<Data>,
    /// Child exit code: on POSIX the low-8-bit exit status.
    pub exit_code: i32,
}

/// Subprocess failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExecError {
    /// `exec` was called with nothing to run.
    #[error("exec() with no arguments")]
    NoArguments,
    /// The pipes to the child could not be created.
    #[error("unable to create pipes: {0}")]
    Pipe(#[source] std::io::Error),
    /// The child could not be spawned.
    #[error("unable to spawn '{command}': {source}")]
    Spawn {
        /// The program that failed to spawn.
        command: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Waiting for the child failed.
    #[error("error waiting for child: {0}")]
    Wait(#[from] std::io::Error),
}

/// Runs a command line, splitting it on whitespace with shell-style quote
/// handling.
///
/// # Errors
///
/// Returns [`ExecError`] when there is nothing to run, the pipes cannot be
/// created, or the child cannot be spawned or awaited.
pub fn exec(cmd: &str, options: ExecOptions) -> Result<ExecResult, ExecError> {
    exec_argv(&split_argv(cmd), options)
}

/// Runs an argument vector.
///
/// # Errors
///
/// Returns [`ExecError`] when there is nothing to run, the pipes cannot be
/// created, or the child cannot be spawned or awaited.
pub fn exec_argv(argv: &[String], mut options: ExecOptions) -> Result<ExecResult, ExecError> {
    let on_exit = options.on_exit.take();
    let Some((program, args)) = argv.split_first() else {
        return Err(ExecError::NoArguments);
    };

    let mut command = Command::new(program);
    command.args(args).stdin(if options.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    // Without a separate stderr capture, stdout and stderr share one pipe
    // and the stderr bytes end up in the captured output.
    let merged = if options.stderr {
        let (reader, writer) = std::io::pipe().map_err(ExecError::Pipe)?;
        let writer_clone = writer.try_clone().map_err(ExecError::Pipe)?;
        command.stdout(writer_clone).stderr(writer);
        Some(reader)
    } else {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        None
    };

    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        command: program.clone(),
        source,
    })?;
    // The command still holds the parent's write ends; drop them or the
    // reader never sees EOF.
    drop(command);

    let t_stdout = match merged {
        Some(reader) => Some(thread::spawn(move || read_pipe(reader))),
        None => child.stdout.take().map(|pipe| thread::spawn(|| read_pipe(pipe))),
    };
    let t_stderr = child.stderr.take().map(|pipe| thread::spawn(|| read_pipe(pipe)));

    if let (Some(data), Some(mut stdin)) = (&options.stdin, child.stdin.take()) {
        for chunk in data.chunks() {
            if let Err(e) = stdin.write_all(chunk) {
                warn!("error feeding child stdin: {e}");
                break;
            }
        }
        // Dropping the handle closes the pipe so the child sees EOF.
    }

    let status = child.wait()?;
    let exit_code = status.code().unwrap_or(-1);

    let out = t_stdout.and_then(|t| t.join().ok()).unwrap_or_default();
    let err = t_stderr.and_then(|t| t.join().ok());

    if let Some(on_exit) = on_exit {
        if options.stderr {
            on_exit(exit_code, None);
        } else {
            on_exit(exit_code, err.as_ref());
        }
    }

    Ok(ExecResult {
        out,
        err,
        exit_code,
    })
}

fn read_pipe(mut pipe: impl Read) -> Data {
    let mut builder = Builder::new();
    let mut buf = [0u8; buffer::CHUNK_SIZE];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => builder.push_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    builder.build()
}

/// Splits a command line on whitespace, honoring single and double quotes.
fn split_argv(cmd: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut pending = false;
    for c in cmd.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                pending = true;
            }
            None if c.is_whitespace() => {
                if pending || !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            None => current.push(c),
        }
    }
    if pending || !current.is_empty() {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_argv_honors_quotes() {
        assert_eq!(split_argv("echo hello world"), ["echo", "hello", "world"]);
        assert_eq!(split_argv("sh -c 'echo  two  spaces'"), [
            "sh",
            "-c",
            "echo  two  spaces"
        ]);
        assert_eq!(split_argv(r#"printf "%s" """#), ["printf", "%s", ""]);
        assert!(split_argv("   ").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout_and_exit_code() {
        let result = exec("sh -c 'echo out; echo err >&2; exit 3'", ExecOptions::default())
            .unwrap();
        assert_eq!(result.out.to_vec(), b"out\n");
        assert_eq!(result.err.map(|d| d.to_vec()), Some(b"err\n".to_vec()));
        assert_eq!(result.exit_code, 3);
    }

    #[cfg(unix)]
    #[test]
    fn merges_stderr_into_stdout_when_requested() {
        let options = ExecOptions {
            stderr: true,
            ..ExecOptions::default()
        };
        let result = exec("sh -c 'echo out; echo err >&2'", options).unwrap();
        // Both streams share one pipe; the child wrote them in order.
        assert_eq!(result.out.to_vec(), b"out\nerr\n");
        assert!(result.err.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn feeds_stdin_from_a_buffer() {
        let options = ExecOptions {
            stdin: Some(Data::from_slice(b"tr me")),
            ..ExecOptions::default()
        };
        let result = exec("tr a-z A-Z", options).unwrap();
        assert_eq!(result.out.to_vec(), b"TR ME");
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn rejects_empty_argv() {
        assert!(matches!(
            exec("", ExecOptions::default()),
            Err(ExecError::NoArguments)
        ));
    }
}
