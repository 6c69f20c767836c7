use std::{
    collections::{BTreeMap, HashSet},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info, warn};
use tempfile::NamedTempFile;

use crate::{
    channel::EngineChannel,
    command::{Backend, Command, Lifecycle},
    config::EngineConfig,
    demarcator::{Classifier, Response, Status},
    outcome::Outcome,
    process::{ProcessChannel, ProcessOptions},
    trace::Trace,
    Error, Result,
};

/// One line of the session's command log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub command: String,
    /// `None` while no response has been classified for it.
    pub status: Option<Status>,
}

/// What a scripted run got through before it stopped.
#[derive(Debug)]
pub struct ScriptOutcome {
    /// Every response in order, auto-inserted prerequisites included.
    pub responses: Vec<Response>,
    /// Set when the run stopped on an error rather than an Error response.
    pub failure: Option<Error>,
}

impl ScriptOutcome {
    /// True when every command ran and none answered with an error.
    pub fn completed(&self) -> bool {
        self.failure.is_none() && self.responses.iter().all(|r| !r.is_error())
    }

    pub fn last(&self) -> Option<&Response> {
        self.responses.last()
    }

    pub fn into_result(self) -> Result<Vec<Response>> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(self.responses),
        }
    }
}

/// One engine process bound to one model file.
///
/// The engine is closed when the session is closed or dropped, so a script
/// failing halfway never leaks the process.
pub struct Session<C: EngineChannel = ProcessChannel> {
    pub(crate) channel: C,
    pub(crate) state: Lifecycle,
    pub(crate) relations: HashSet<Backend>,
    pub(crate) model: PathBuf,
    pub(crate) working_dir: PathBuf,
    pub(crate) log: Vec<LogEntry>,
    pub(crate) classifier: Classifier,
    pub(crate) timeout: Option<Duration>,
    pub(crate) default_backend: Backend,
    /// Command whose response timed out and may still arrive.
    pub(crate) pending: Option<Command>,
    pub(crate) dead: bool,
    pub(crate) closed: bool,
    _source: Option<NamedTempFile>,
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

impl Session<ProcessChannel> {
    pub fn open(model: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(model, &EngineConfig::default())
    }

    /// Starts the engine configured by `config` for `model`.
    pub fn open_with(model: impl AsRef<Path>, config: &EngineConfig) -> Result<Self> {
        let model = absolute(model.as_ref())?;
        let working_dir = match &config.working_dir {
            Some(dir) => dir.clone(),
            None => model
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or(std::env::current_dir()?),
        };
        let options = ProcessOptions {
            working_dir: Some(working_dir),
            ..ProcessOptions::from(config)
        };
        let channel = ProcessChannel::spawn(&config.executable, &options)?;
        Self::with_channel(channel, model, config)
    }

    /// Opens a session on a model given as source text.
    pub fn open_source(source: &str, config: &EngineConfig) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("rxmv-")
            .suffix(".smv")
            .tempfile()?;
        file.write_all(source.as_bytes())?;
        file.flush()?;
        info!("model source written to {}", file.path().display());
        let mut session = Self::open_with(file.path(), config)?;
        session._source = Some(file);
        Ok(session)
    }
}

impl<C: EngineChannel> Session<C> {
    /// Wraps an already started engine: waits for its first prompt and applies
    /// the configured options. The engine is released if any of that fails.
    pub fn with_channel(mut channel: C, model: impl AsRef<Path>, config: &EngineConfig) -> Result<Self> {
        let classifier = match config.classifier() {
            Ok(classifier) => classifier,
            Err(e) => {
                let _ = channel.kill();
                return Err(e.into());
            }
        };
        if let Err(e) = channel.read_response(Some(config.startup_timeout())) {
            warn!("engine did not start: {e}");
            let _ = channel.kill();
            return Err(e);
        }

        let model = model.as_ref().to_path_buf();
        let working_dir = config
            .working_dir
            .clone()
            .or_else(|| model.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        let mut session = Session {
            channel,
            state: Lifecycle::Idle,
            relations: HashSet::new(),
            model,
            working_dir,
            log: vec![],
            classifier,
            timeout: config.timeout(),
            default_backend: config.backend,
            pending: None,
            dead: false,
            closed: false,
            _source: None,
        };
        info!("session opened for {}", session.model.display());

        if let Some(n) = config.shown_states {
            let response = session.apply(&Command::set("shown_states", Some(&n.to_string())))?;
            if response.is_error() {
                return Err(Error::CommandFailed {
                    response: Box::new(response),
                });
            }
        }
        Ok(session)
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn has_relation(&self, backend: Backend) -> bool {
        self.relations.contains(&backend)
    }

    pub fn model(&self) -> &Path {
        &self.model
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn history(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn is_alive(&mut self) -> bool {
        !self.dead && self.channel.is_alive()
    }

    /// Applies `commands` in order and stops at the first response classified
    /// as an error, or at the first failure. Whatever was gathered up to that
    /// point is returned either way.
    pub fn run(&mut self, commands: &[Command]) -> ScriptOutcome {
        let mut responses = vec![];
        for command in commands {
            match self.apply_collecting(command, &mut responses) {
                Ok(response) if response.is_error() => {
                    info!("script stopped at `{command}`: {}", response.summary());
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    info!("script stopped at `{command}`: {err}");
                    return ScriptOutcome {
                        responses,
                        failure: Some(err),
                    };
                }
            }
        }
        ScriptOutcome {
            responses,
            failure: None,
        }
    }

    /// Runs `command` and parses its answer as a trace.
    pub fn get_trace(&mut self, command: &Command) -> Result<Trace> {
        let response = self.apply_checked(command)?;
        Trace::parse(&response.text)
    }

    /// Runs a check command and splits its answer into per-property outcomes.
    pub fn verify(&mut self, command: &Command) -> Result<Vec<Outcome>> {
        let response = self.apply_checked(command)?;
        let outcomes = Outcome::parse(&response.text)?;
        for outcome in &outcomes {
            info!("{}", outcome.message());
        }
        Ok(outcomes)
    }

    /// Random BDD simulation of `steps` steps from a random initial state.
    pub fn random_simulation(&mut self, steps: u32) -> Result<Trace> {
        self.apply_checked(&Command::pick_random_state())?;
        self.apply_checked(&Command::simulate_random(steps))?;
        self.get_trace(&Command::show_traces())
    }

    /// The engine's options, `None` for unset ones.
    pub fn env(&mut self) -> Result<BTreeMap<String, Option<String>>> {
        let response = self.apply_checked(&Command::show_options())?;
        Ok(parse_options(&response.text))
    }

    pub fn set_option(&mut self, name: &str, value: Option<&str>) -> Result<Response> {
        self.apply_checked(&Command::set(name, value))
    }

    /// Keeps waiting for the command that last timed out.
    pub fn resume(&mut self, timeout: Option<Duration>) -> Result<Response> {
        let command = self.pending.take().ok_or(Error::NothingPending)?;
        debug!("resuming `{command}`");
        match self.channel.read_response(timeout) {
            Ok(raw) => {
                let response = self.classifier.classify(&raw, &command);
                self.record_status(&command, response.status);
                if !response.is_error() {
                    self.advance(&command);
                }
                Ok(response)
            }
            Err(err) => {
                if matches!(err, Error::ChannelTimeout { .. }) {
                    self.pending = Some(command);
                }
                Err(self.fail(err))
            }
        }
    }

    /// Terminates the engine without asking it to quit. This is the only way to
    /// stop a computation in progress.
    pub fn abort(&mut self) -> Result<()> {
        warn!("aborting engine for {}", self.model.display());
        self.dead = true;
        self.closed = true;
        self.channel.kill()
    }

    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!("closing session for {}", self.model.display());
        self.channel.close()
    }

    pub(crate) fn apply_checked(&mut self, command: &Command) -> Result<Response> {
        let response = self.apply(command)?;
        if response.is_error() {
            return Err(Error::CommandFailed {
                response: Box::new(response),
            });
        }
        Ok(response)
    }

    /// Marks the most recent log entry for `command` as answered.
    pub(crate) fn record_status(&mut self, command: &Command, status: Status) {
        if let Some(entry) = self
            .log
            .iter_mut()
            .rev()
            .find(|entry| entry.command == command.text())
        {
            entry.status = Some(status);
        }
    }

    pub(crate) fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            warn!("engine for {} is gone: {err}", self.model.display());
            self.dead = true;
        }
        err
    }
}

impl<C: EngineChannel> Drop for Session<C> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("failed to close session: {e}");
        }
    }
}

/// Parses the output of `set`: one `name value` pair per line.
fn parse_options(text: &str) -> BTreeMap<String, Option<String>> {
    text.lines()
        .filter_map(|line| line.trim().split_once(char::is_whitespace))
        .map(|(name, value)| {
            let value = value.trim();
            let value = match value {
                "NULL" => None,
                v if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') => {
                    Some(v[1..v.len() - 1].to_string())
                }
                v => Some(v.to_string()),
            };
            (name.to_string(), value)
        })
        .collect()
}
