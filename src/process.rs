use std::{
    collections::BTreeMap,
    io::{self, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread,
    time::{Duration, Instant},
};

use log::{debug, trace, warn};

use crate::{
    channel::{find_first, Chunk, EngineChannel, Marker},
    config::EngineConfig,
    Error, Result,
};

/// How to start the engine and talk to it.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub args: Vec<String>,
    /// Overrides on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub prompt: String,
    pub quit_command: String,
    pub grace_period: Duration,
    /// Append whatever the engine wrote to stderr to the response text.
    pub merge_stderr: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            args: vec![],
            env: BTreeMap::new(),
            working_dir: None,
            prompt: "nuXmv > ".into(),
            quit_command: "quit".into(),
            grace_period: Duration::from_millis(500),
            merge_stderr: true,
        }
    }
}

impl From<&EngineConfig> for ProcessOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            args: config.args.clone(),
            env: config.env.clone(),
            working_dir: config.working_dir.clone(),
            prompt: config.prompt.clone(),
            grace_period: config.grace_period(),
            merge_stderr: config.merge_stderr,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

enum Event {
    Data(Stream, Vec<u8>),
    Eof(Stream),
}

/// An engine subprocess driven over its standard streams.
///
/// Both output streams are drained by background threads into a channel, so a
/// read can give up after a deadline without leaving a thread blocked on the
/// pipe.
pub struct ProcessChannel {
    executable: PathBuf,
    child: Child,
    stdin: Option<ChildStdin>,
    events: Receiver<Event>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_open: bool,
    prompt: Marker,
    quit_command: String,
    grace_period: Duration,
    merge_stderr: bool,
    /// Responses requested but not read yet.
    owed: usize,
    closed: bool,
}

impl ProcessChannel {
    pub fn open(executable: impl AsRef<Path>, args: &[String]) -> Result<Self> {
        Self::spawn(
            executable,
            &ProcessOptions {
                args: args.to_vec(),
                ..Default::default()
            },
        )
    }

    pub fn spawn(executable: impl AsRef<Path>, options: &ProcessOptions) -> Result<Self> {
        let executable = executable.as_ref().to_path_buf();
        let mut command = Command::new(&executable);
        command
            .args(&options.args)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &options.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| Error::Launch {
            executable: executable.clone(),
            source,
        })?;
        debug!(
            "spawned {} {} (pid {})",
            executable.display(),
            options.args.join(" "),
            child.id()
        );

        let missing = |stream: &str| Error::Launch {
            executable: executable.clone(),
            source: io::Error::new(ErrorKind::BrokenPipe, format!("no {stream} pipe")),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (tx, events) = mpsc::channel();
        pump(stdout, Stream::Stdout, tx.clone());
        pump(stderr, Stream::Stderr, tx);

        Ok(Self {
            executable,
            child,
            stdin: Some(stdin),
            events,
            stdout: vec![],
            stderr: vec![],
            stdout_open: true,
            prompt: Marker::literal(options.prompt.clone()),
            quit_command: options.quit_command.clone(),
            grace_period: options.grace_period,
            merge_stderr: options.merge_stderr,
            owed: 0,
            closed: false,
        })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    fn exit_code(&mut self) -> Option<i32> {
        self.child.try_wait().ok().flatten().and_then(|s| s.code())
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Data(Stream::Stdout, bytes) => {
                trace!("stdout: {}", String::from_utf8_lossy(&bytes));
                self.stdout.extend_from_slice(&bytes);
            }
            Event::Data(Stream::Stderr, bytes) => {
                trace!("stderr: {}", String::from_utf8_lossy(&bytes));
                self.stderr.extend_from_slice(&bytes);
            }
            Event::Eof(Stream::Stdout) => self.stdout_open = false,
            Event::Eof(Stream::Stderr) => {}
        }
    }

    /// Picks up output that already arrived without blocking.
    fn drain_pending(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle(event);
        }
    }

    fn take_stderr(&mut self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr).into_owned();
        self.stderr.clear();
        stderr
    }

    fn wait_for_exit(&mut self, grace: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + grace;
        loop {
            if self.child.try_wait()?.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

fn pump<R: Read + Send + 'static>(mut reader: R, stream: Stream, tx: Sender<Event>) {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Event::Data(stream, buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = tx.send(Event::Eof(stream));
    });
}

impl EngineChannel for ProcessChannel {
    fn send(&mut self, line: &str) -> Result<()> {
        if self.closed || self.child.try_wait()?.is_some() {
            return Err(Error::ChannelClosed);
        }
        let stdin = self.stdin.as_mut().ok_or(Error::ChannelClosed)?;
        debug!("-> {line}");
        let written = writeln!(stdin, "{line}").and_then(|_| stdin.flush());
        match written {
            Ok(()) => {
                self.owed += 1;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Err(Error::ChannelClosed),
            Err(e) => Err(e.into()),
        }
    }

    fn read_until(&mut self, markers: &[Marker], timeout: Option<Duration>) -> Result<Chunk> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        loop {
            if self.owed > 1 {
                if let Some((_, end)) = self.prompt.find(&self.stdout) {
                    let stale = self.stdout.drain(..end).count();
                    self.stderr.clear();
                    self.owed -= 1;
                    debug!("discarded {stale} bytes owed to an abandoned command");
                    continue;
                }
            } else if let Some((marker, start, end)) = find_first(markers, &self.stdout) {
                let mut text = String::from_utf8_lossy(&self.stdout[..start]).into_owned();
                self.stdout.drain(..end);
                self.owed = self.owed.saturating_sub(1);
                self.drain_pending();
                let stderr = self.take_stderr();
                if self.merge_stderr && !stderr.trim().is_empty() {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                return Ok(Chunk { text, marker });
            }

            if !self.stdout_open {
                thread::sleep(Duration::from_millis(10));
                self.drain_pending();
                let partial = String::from_utf8_lossy(&self.stdout).into_owned();
                let stderr = self.take_stderr();
                return Err(Error::EngineCrashed {
                    status: self.exit_code(),
                    partial,
                    stderr,
                });
            }

            let event = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        Err(RecvTimeoutError::Timeout)
                    } else {
                        self.events.recv_timeout(deadline - now)
                    }
                }
                None => self
                    .events
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match event {
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "no marker from {} after {}ms",
                        self.executable.display(),
                        started.elapsed().as_millis()
                    );
                    return Err(Error::ChannelTimeout {
                        elapsed: started.elapsed(),
                        partial: String::from_utf8_lossy(&self.stdout).into_owned(),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => self.stdout_open = false,
            }
        }
    }

    fn prompt(&self) -> &Marker {
        &self.prompt
    }

    fn is_alive(&mut self) -> bool {
        !self.closed && matches!(self.child.try_wait(), Ok(None))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.is_alive() {
            if let Some(stdin) = self.stdin.as_mut() {
                let quit = self.quit_command.clone();
                if let Err(e) = writeln!(stdin, "{quit}").and_then(|_| stdin.flush()) {
                    debug!("could not send `{quit}`: {e}");
                }
            }
        }
        // closing stdin lets engines that ignore the quit command see EOF
        self.stdin = None;
        let exited = self.wait_for_exit(self.grace_period).unwrap_or(false);
        self.closed = true;
        if !exited {
            warn!(
                "{} did not exit within {}ms, killing it",
                self.executable.display(),
                self.grace_period.as_millis()
            );
            match self.child.kill() {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::InvalidInput => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.child.wait()?;
        debug!("{} closed", self.executable.display());
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.stdin = None;
        if !self.closed {
            self.closed = true;
            match self.child.kill() {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::InvalidInput => {}
                Err(e) => return Err(e.into()),
            }
            self.child.wait()?;
        }
        Ok(())
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close {}: {e}", self.executable.display());
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn init() {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Debug)
            .try_init();
    }

    fn cat() -> ProcessChannel {
        ProcessChannel::spawn(
            "cat",
            &ProcessOptions {
                prompt: "PROMPT> ".into(),
                grace_period: Duration::from_millis(100),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_missing_executable() {
        init();
        let err = ProcessChannel::open("/definitely/not/an/engine", &[])
            .err()
            .unwrap();
        assert!(matches!(err, Error::Launch { .. }));
    }

    #[test]
    fn test_read_until_strips_marker() {
        init();
        let mut channel = cat();
        channel.send("hello\nPROMPT> ").unwrap();
        let text = channel
            .read_response(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(text, "hello\n");
    }

    #[test]
    fn test_timeout_then_abandon() {
        init();
        let mut channel = cat();
        channel.send("slow").unwrap();
        let err = channel
            .read_response(Some(Duration::from_millis(100)))
            .unwrap_err();
        match err {
            Error::ChannelTimeout { partial, .. } => assert_eq!(partial, "slow\n"),
            other => panic!("unexpected {other}"),
        }
        assert!(channel.is_alive());

        // the late answer to `slow` is skipped, the fresh one is returned
        channel.send("PROMPT> \nfresh\nPROMPT> ").unwrap();
        let text = channel
            .read_response(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(text, "\nfresh\n");
    }

    #[test]
    fn test_crash_before_marker() {
        init();
        let mut channel = ProcessChannel::spawn(
            "sh",
            &ProcessOptions {
                args: vec!["-c".into(), "echo partial; exit 3".into()],
                ..Default::default()
            },
        )
        .unwrap();
        let err = channel
            .read_response(Some(Duration::from_secs(5)))
            .unwrap_err();
        match err {
            Error::EngineCrashed { partial, .. } => assert_eq!(partial, "partial\n"),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_send_after_close() {
        init();
        let mut channel = cat();
        channel.close().unwrap();
        assert!(!channel.is_alive());
        assert!(matches!(channel.send("x"), Err(Error::ChannelClosed)));
        // closing twice is fine
        channel.close().unwrap();
    }

    #[test]
    fn test_close_kills_engine_ignoring_quit() {
        use std::os::unix::process::ExitStatusExt;

        init();
        let mut channel = ProcessChannel::spawn(
            "sh",
            &ProcessOptions {
                args: vec![
                    "-c".into(),
                    "trap '' HUP TERM; while :; do sleep 1; done </dev/null".into(),
                ],
                grace_period: Duration::from_millis(100),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(channel.is_alive());

        let started = Instant::now();
        channel.close().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!channel.is_alive());
        let status = channel.child.try_wait().unwrap().unwrap();
        assert_eq!(status.signal(), Some(9));
    }
}
