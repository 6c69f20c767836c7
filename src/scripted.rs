//! In-memory engine for unit tests.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use crate::{
    channel::{Chunk, EngineChannel, Marker},
    Error, Result,
};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Text ended by the prompt.
    Text(String),
    /// Text ended by the marker at this index of the read.
    Marked(usize, String),
    Timeout,
    Crash,
}

/// Replays canned replies keyed by the exact command text and records
/// everything sent. Commands without a scripted reply get an empty success.
pub(crate) struct ScriptedChannel {
    pub sent: Vec<String>,
    replies: HashMap<String, VecDeque<Reply>>,
    queue: VecDeque<Reply>,
    late: Option<String>,
    owed: Option<String>,
    prompt: Marker,
    alive: bool,
    closed: bool,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self {
            sent: vec![],
            replies: HashMap::new(),
            queue: VecDeque::from([Reply::Text("*** This is nuXmv\n".into())]),
            late: None,
            owed: None,
            prompt: Marker::literal("nuXmv > "),
            alive: true,
            closed: false,
        }
    }

    pub fn banner(mut self, reply: Reply) -> Self {
        self.queue = VecDeque::from([reply]);
        self
    }

    pub fn reply(self, command: &str, text: &str) -> Self {
        self.reply_with(command, Reply::Text(text.to_string()))
    }

    /// Replies are used in the order they were scripted for the same command.
    pub fn reply_with(mut self, command: &str, reply: Reply) -> Self {
        self.replies
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Output that shows up after the next timeout, if it is waited for.
    pub fn late(mut self, text: &str) -> Self {
        self.late = Some(text.to_string());
        self
    }
}

impl EngineChannel for ScriptedChannel {
    fn send(&mut self, line: &str) -> Result<()> {
        if !self.alive || self.closed {
            return Err(Error::ChannelClosed);
        }
        self.owed = None;
        self.sent.push(line.to_string());
        let reply = self
            .replies
            .get_mut(line)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Reply::Text(String::new()));
        self.queue.push_back(reply);
        Ok(())
    }

    fn read_until(&mut self, _markers: &[Marker], timeout: Option<Duration>) -> Result<Chunk> {
        if !self.alive {
            return Err(Error::ChannelClosed);
        }
        let timed_out = Error::ChannelTimeout {
            elapsed: timeout.unwrap_or_default(),
            partial: String::new(),
        };
        match self.queue.pop_front() {
            Some(Reply::Text(text)) => Ok(Chunk { text, marker: 0 }),
            Some(Reply::Marked(marker, text)) => Ok(Chunk { text, marker }),
            Some(Reply::Timeout) => {
                self.owed = self.late.take();
                Err(timed_out)
            }
            Some(Reply::Crash) => {
                self.alive = false;
                Err(Error::EngineCrashed {
                    status: Some(1),
                    partial: String::new(),
                    stderr: "Segmentation fault".into(),
                })
            }
            None => match self.owed.take() {
                Some(text) => Ok(Chunk { text, marker: 0 }),
                None => Err(timed_out),
            },
        }
    }

    fn prompt(&self) -> &Marker {
        &self.prompt
    }

    fn is_alive(&mut self) -> bool {
        self.alive && !self.closed
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed && self.alive {
            self.sent.push("quit".into());
        }
        self.closed = true;
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.alive = false;
        self.closed = true;
        Ok(())
    }
}
