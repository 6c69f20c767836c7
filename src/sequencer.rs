//! Keeping the engine's lifecycle in order.
//!
//! Commands declare the state they need; the sequencer inserts the missing
//! `read_model`/`go`/`go_msat` steps in front of them and refuses to send a
//! command whose prerequisite failed.

use std::{collections::HashSet, path::Path};

use log::{debug, info, trace, warn};

use crate::{
    channel::{EngineChannel, Marker},
    command::{Backend, Command, Lifecycle},
    demarcator::{DiagnosticKind, Prerequisite, Response, Status},
    session::{LogEntry, Session},
    Error, Result,
};

/// Steps that bring a session in `state` with `relations` built up to `target`.
/// `None` when `target` cannot be reached by setup steps alone.
pub(crate) fn prerequisites(
    state: Lifecycle,
    relations: &HashSet<Backend>,
    target: Lifecycle,
    backend: Option<Backend>,
    default_backend: Backend,
    model: &Path,
) -> Option<Vec<Command>> {
    if target == Lifecycle::ResultAvailable && state < Lifecycle::ResultAvailable {
        return None;
    }
    let mut steps = vec![];
    if target >= Lifecycle::ModelLoaded && state < Lifecycle::ModelLoaded {
        steps.push(Command::load_model(model));
    }
    if target >= Lifecycle::RelationBuilt {
        let missing = match backend {
            Some(backend) => !relations.contains(&backend),
            None => state < Lifecycle::RelationBuilt,
        };
        if missing {
            steps.push(Command::build(backend.unwrap_or(default_backend)));
        }
    }
    Some(steps)
}

impl<C: EngineChannel> Session<C> {
    /// Brings the session to `target`, building the default relation if needed.
    pub fn require(&mut self, target: Lifecycle) -> Result<()> {
        self.satisfy(target, None, &target.to_string(), &mut vec![])
    }

    /// Like [`Session::require`] but makes sure `backend`'s relation exists.
    pub fn require_on(&mut self, target: Lifecycle, backend: Backend) -> Result<()> {
        self.satisfy(target, Some(backend), &target.to_string(), &mut vec![])
    }

    /// Sends `command` once the session has reached the state it requires.
    ///
    /// An error response to the command itself is returned as a response; only
    /// a failed prerequisite or a channel problem is an `Err`.
    pub fn apply(&mut self, command: &Command) -> Result<Response> {
        self.apply_collecting(command, &mut vec![])
    }

    pub(crate) fn apply_collecting(
        &mut self,
        command: &Command,
        sink: &mut Vec<Response>,
    ) -> Result<Response> {
        let prompt = self.channel.prompt().clone();
        self.dispatch(command, &[prompt], sink)
            .map(|(response, _)| response)
    }

    /// Sends `command` and reads until one of `markers`, returning the index of
    /// the marker that ended the response. Every response read along the way,
    /// prerequisites included, is pushed to `sink`.
    pub(crate) fn dispatch(
        &mut self,
        command: &Command,
        markers: &[Marker],
        sink: &mut Vec<Response>,
    ) -> Result<(Response, usize)> {
        if self.dead || self.closed {
            return Err(Error::ChannelClosed);
        }
        self.satisfy(command.required_state(), command.backend(), command.text(), sink)?;

        let (mut response, mut marker) = self.exchange(command, markers)?;
        if response.has(DiagnosticKind::MissingPrerequisite(Prerequisite::BooleanModel)) {
            info!("`{command}` needs the boolean model, building it");
            let prompt = self.channel.prompt().clone();
            let (built, _) = self.exchange(&Command::build_boolean_model(), &[prompt])?;
            sink.push(built.clone());
            if built.is_error() {
                return Err(Error::PrerequisiteFailed {
                    response: Box::new(built),
                });
            }
            (response, marker) = self.exchange(command, markers)?;
        }

        // a command stopped at a question only completes once it is answered
        if !response.is_error() && marker == 0 {
            self.advance(command);
        }
        sink.push(response.clone());
        Ok((response, marker))
    }

    fn satisfy(
        &mut self,
        target: Lifecycle,
        backend: Option<Backend>,
        requested_by: &str,
        sink: &mut Vec<Response>,
    ) -> Result<()> {
        let steps = prerequisites(
            self.state,
            &self.relations,
            target,
            backend,
            self.default_backend,
            &self.model,
        )
        .ok_or_else(|| Error::NoResult {
            command: requested_by.to_string(),
        })?;

        for step in steps {
            debug!("`{requested_by}` needs `{step}` first");
            let prompt = self.channel.prompt().clone();
            let (response, _) = self.exchange(&step, &[prompt])?;
            sink.push(response.clone());
            if response.is_error() {
                warn!("prerequisite `{step}` failed: {}", response.summary());
                return Err(Error::PrerequisiteFailed {
                    response: Box::new(response),
                });
            }
            self.advance(&step);
        }
        Ok(())
    }

    /// Moves the lifecycle forward after `command` succeeded.
    pub(crate) fn advance(&mut self, command: &Command) {
        let Some(target) = command.target_state() else {
            return;
        };
        if target == Lifecycle::RelationBuilt {
            self.relations
                .insert(command.backend().unwrap_or(self.default_backend));
        }
        let next = self.state.max(target);
        if next != self.state {
            info!("{} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// One round trip: send, read, classify, log.
    fn exchange(&mut self, command: &Command, markers: &[Marker]) -> Result<(Response, usize)> {
        if self.dead {
            return Err(Error::ChannelClosed);
        }
        // whatever a timed out command still owes is dropped by the channel
        if let Some(abandoned) = self.pending.take() {
            debug!("abandoning `{abandoned}`");
        }

        debug!("> {command}");
        if let Err(err) = self.channel.send(command.text()) {
            return Err(self.fail(err));
        }
        self.log.push(LogEntry {
            command: command.text().to_string(),
            status: None,
        });

        let timeout = command.timeout().or(self.timeout);
        let chunk = match self.channel.read_until(markers, timeout) {
            Ok(chunk) => chunk,
            Err(err) => {
                if matches!(err, Error::ChannelTimeout { .. }) {
                    warn!("`{command}` timed out");
                    self.pending = Some(command.clone());
                }
                return Err(self.fail(err));
            }
        };
        trace!("< {:?}", chunk.text);

        let response = self.classifier.classify(&chunk.text, command);
        match response.status {
            Status::Success => debug!("`{command}` succeeded"),
            Status::Warning => warn!("`{command}`: {}", response.text.trim()),
            Status::Error => debug!("`{command}` failed: {}", response.summary()),
        }
        if !command.expects_multiline() && response.text.trim().lines().count() > 1 {
            trace!("multi-line answer to `{command}`");
        }
        self.record_status(command, response.status);
        Ok((response, chunk.marker))
    }
}
