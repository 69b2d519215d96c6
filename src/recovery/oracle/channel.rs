//! Transports between an oracle session and its helper.

use std::{
    io::BufReader,
    path::Path,
    process::{Child, ChildStdin, Command, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    recovery::oracle::protocol::{read_frame, write_frame, Request, Response},
    Error, Result,
};

/// How long [`ProcessChannel::shutdown`] waits for the reader thread after the helper is reaped.
const READER_GRACE: Duration = Duration::from_millis(500);

/// A bidirectional, ordered message channel to a helper.
pub trait OracleChannel {
    /// Send one request.
    ///
    /// # Errors
    /// Returns an error if the request cannot be delivered.
    fn send(&mut self, request: &Request) -> Result<()>;

    /// Wait up to `timeout` for the next response.
    ///
    /// # Errors
    /// Returns [`Error::OracleTimeout`] when nothing arrives in time and
    /// [`Error::OracleProtocol`] if the helper closed the channel or sent garbage.
    fn receive(&mut self, timeout: Duration) -> Result<Response>;

    /// Close the channel and release the helper. Calling it again has no effect.
    fn shutdown(&mut self);
}

/// A helper child process speaking the framed protocol over its stdin and stdout.
///
/// Responses are read on a background thread so that [`OracleChannel::receive`] can time out.
/// Dropping the channel kills and reaps the child. A reader still blocked after that, because a
/// process the helper started holds its stdout open, is detached rather than joined.
#[derive(Debug)]
pub struct ProcessChannel {
    child: Child,
    stdin: Option<ChildStdin>,
    responses: Receiver<Result<Response>>,
    reader: Option<JoinHandle<()>>,
    max_message_size: usize,
    closed: bool,
}

impl ProcessChannel {
    /// Start `helper` with `args`.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the process or its reader thread cannot be started.
    pub fn spawn(helper: &Path, args: &[String], max_message_size: usize) -> Result<Self> {
        let mut child = Command::new(helper)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            reap(&mut child);
            return Err(Error::OracleProtocol {
                stage: "connect",
                message: "Helper has no stdout".to_string(),
            });
        };

        let (sender, responses) = mpsc::channel();
        let reader = thread::Builder::new()
            .name("oracle-reader".to_string())
            .spawn(move || {
                let mut stdout = BufReader::new(stdout);
                loop {
                    let frame = read_frame::<_, Response>(&mut stdout, max_message_size);
                    let failed = frame.is_err();
                    if sender.send(frame).is_err() || failed {
                        break;
                    }
                }
            });
        let reader = match reader {
            Ok(reader) => reader,
            Err(error) => {
                reap(&mut child);
                return Err(error.into());
            }
        };

        log::debug!("Started oracle helper {} (pid {})", helper.display(), child.id());
        Ok(ProcessChannel {
            child,
            stdin,
            responses,
            reader: Some(reader),
            max_message_size,
            closed: false,
        })
    }

    /// OS process id of the helper.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

fn reap(child: &mut Child) {
    // Either call fails only if the child is already gone
    let _ = child.kill();
    let _ = child.wait();
}

impl OracleChannel for ProcessChannel {
    fn send(&mut self, request: &Request) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| Error::OracleProtocol {
            stage: "send",
            message: "Channel is closed".to_string(),
        })?;
        write_frame(stdin, request, self.max_message_size)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Response> {
        match self.responses.recv_timeout(timeout) {
            Ok(response) => response.map_err(|error| match error {
                Error::OracleProtocol { .. } => error,
                other => Error::OracleProtocol {
                    stage: "receive",
                    message: other.to_string(),
                },
            }),
            Err(RecvTimeoutError::Timeout) => Err(Error::OracleTimeout { stage: "receive" }),
            Err(RecvTimeoutError::Disconnected) => Err(Error::OracleProtocol {
                stage: "receive",
                message: "Helper closed the channel".to_string(),
            }),
        }
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stdin = None;
        reap(&mut self.child);
        if let Some(reader) = self.reader.take() {
            let deadline = Instant::now() + READER_GRACE;
            while !reader.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if reader.is_finished() {
                let _ = reader.join();
            } else {
                log::warn!(
                    "Oracle helper {} left its output open, detaching the reader",
                    self.child.id()
                );
            }
        }
        log::debug!("Oracle helper {} stopped", self.child.id());
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn silent_helper_times_out() {
        let mut channel =
            ProcessChannel::spawn(Path::new("sleep"), &["30".to_string()], 1024).unwrap();
        assert!(matches!(
            channel.receive(Duration::from_millis(100)),
            Err(Error::OracleTimeout { .. })
        ));
        channel.shutdown();
        channel.shutdown();
    }

    #[test]
    fn exited_helper_closes_the_channel() {
        let mut channel = ProcessChannel::spawn(Path::new("true"), &[], 1024).unwrap();
        assert!(matches!(
            channel.receive(Duration::from_secs(10)),
            Err(Error::OracleProtocol { .. })
        ));
    }

    #[test]
    fn inherited_stdout_does_not_block_shutdown() {
        let script = "sleep 5 & wait".to_string();
        let mut channel =
            ProcessChannel::spawn(Path::new("sh"), &["-c".to_string(), script], 1024).unwrap();

        let started = Instant::now();
        channel.shutdown();
        assert!(started.elapsed() < Duration::from_secs(3));
        drop(channel);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn missing_helper_fails_to_spawn() {
        assert!(matches!(
            ProcessChannel::spawn(Path::new("/nonexistent/oracle-helper"), &[], 1024),
            Err(Error::FileError(_))
        ));
    }
}
