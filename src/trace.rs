use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
    sync::OnceLock,
};

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A variable's value as printed by the engine. Booleans and decimal integers
/// are typed, everything else (enum literals, words, reals) is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Symbol(String),
}

impl Value {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        match text {
            "TRUE" => Value::Bool(true),
            "FALSE" => Value::Bool(false),
            _ => match text.parse::<i64>() {
                // keep spellings like `+3` or `007` verbatim so they print back unchanged
                Ok(n) if n.to_string() == text => Value::Int(n),
                _ => Value::Symbol(text.to_string()),
            },
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(true) => f.write_str("TRUE"),
            Value::Bool(false) => f.write_str("FALSE"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Symbol(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::parse(s)
    }
}

/// One point of a trace. Variables the engine did not print for this step are
/// absent, not filled in.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub index: u32,
    pub values: BTreeMap<String, Value>,
    /// The lasso of a looping counterexample starts here.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub loop_start: bool,
}

impl StateSnapshot {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A simulation run or counterexample path.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Trace {
    pub description: Option<String>,
    pub kind: Option<String>,
    /// The engine numbers the traces of a session; `1.3` is state 3 of trace 1.
    pub trace_number: Option<u32>,
    pub snapshots: Vec<StateSnapshot>,
    /// Variables that came from input blocks.
    #[serde(default)]
    pub input_names: BTreeSet<String>,
}

impl Trace {
    pub fn parse(text: &str) -> Result<Self> {
        parse(text)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Every variable name that shows up somewhere in the trace.
    pub fn variables(&self) -> BTreeSet<&str> {
        self.snapshots
            .iter()
            .flat_map(|s| s.values.keys().map(String::as_str))
            .collect()
    }

    pub fn loop_indices(&self) -> Vec<u32> {
        self.snapshots
            .iter()
            .filter(|s| s.loop_start)
            .map(|s| s.index)
            .collect()
    }

    /// Snapshots with each missing variable carried forward from the last step
    /// that printed it. `parse` never does this on its own.
    pub fn full_states(&self) -> Vec<StateSnapshot> {
        let mut accum: BTreeMap<String, Value> = BTreeMap::new();
        self.snapshots
            .iter()
            .map(|snapshot| {
                accum.extend(snapshot.values.clone());
                StateSnapshot {
                    index: snapshot.index,
                    values: accum.clone(),
                    loop_start: snapshot.loop_start,
                }
            })
            .collect()
    }
}

impl FromStr for Trace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse(s)
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(description) = &self.description {
            writeln!(f, "Trace Description: {description}")?;
        }
        if let Some(kind) = &self.kind {
            writeln!(f, "Trace Type: {kind}")?;
        }
        let number = self.trace_number.unwrap_or(1);
        for snapshot in &self.snapshots {
            let (inputs, state): (Vec<_>, Vec<_>) = snapshot
                .values
                .iter()
                .partition(|(name, _)| self.input_names.contains(*name));
            if snapshot.loop_start {
                writeln!(f, "  -- Loop starts here")?;
            }
            if !inputs.is_empty() {
                writeln!(f, "  -> Input: {number}.{} <-", snapshot.index)?;
                for (name, value) in inputs {
                    writeln!(f, "    {name} = {value}")?;
                }
            }
            writeln!(f, "  -> State: {number}.{} <-", snapshot.index)?;
            for (name, value) in state {
                writeln!(f, "    {name} = {value}")?;
            }
        }
        Ok(())
    }
}

fn header() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(r"^->\s*(State|Input):\s*(\d+)\.(\d+)\s*<-$").unwrap_or_else(|e| panic!("{e}"))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    State,
    Input,
}

#[derive(Debug)]
struct Block {
    kind: BlockKind,
    trace_number: u32,
    index: u32,
    line: usize,
    loop_start: bool,
    values: BTreeMap<String, Value>,
}

/// Splits `name = value` at the first `=`.
pub(crate) fn assignment(line: &str, line_no: usize) -> Result<(String, Value)> {
    let (name, value) = line
        .split_once('=')
        .ok_or_else(|| Error::malformed_trace(line_no, format!("expected `name = value`, got `{line}`")))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::malformed_trace(line_no, "assignment without a name"));
    }
    Ok((name.to_string(), Value::parse(value)))
}

fn insert_unique(
    values: &mut BTreeMap<String, Value>,
    name: String,
    value: Value,
    line_no: usize,
) -> Result<()> {
    if values.contains_key(&name) {
        return Err(Error::malformed_trace(
            line_no,
            format!("`{name}` assigned twice in one state"),
        ));
    }
    values.insert(name, value);
    Ok(())
}

#[derive(Default)]
struct TraceBuilder {
    trace: Trace,
    pending_input: Option<Block>,
}

impl TraceBuilder {
    fn finish_block(&mut self, block: Block) -> Result<()> {
        match block.kind {
            BlockKind::Input => {
                if let Some(previous) = &self.pending_input {
                    return Err(Error::malformed_trace(
                        block.line,
                        format!("input block {} has no state", previous.index),
                    ));
                }
                self.pending_input = Some(block);
                Ok(())
            }
            BlockKind::State => {
                self.check_position(&block)?;
                let mut values = block.values;
                if let Some(input) = self.pending_input.take() {
                    if input.index != block.index || input.trace_number != block.trace_number {
                        return Err(Error::malformed_trace(
                            block.line,
                            format!(
                                "input {}.{} followed by state {}.{}",
                                input.trace_number, input.index, block.trace_number, block.index
                            ),
                        ));
                    }
                    for (name, value) in input.values {
                        self.trace.input_names.insert(name.clone());
                        insert_unique(&mut values, name, value, block.line)?;
                    }
                }
                self.trace.trace_number.get_or_insert(block.trace_number);
                self.trace.snapshots.push(StateSnapshot {
                    index: block.index,
                    values,
                    loop_start: block.loop_start,
                });
                Ok(())
            }
        }
    }

    fn check_position(&self, block: &Block) -> Result<()> {
        match self.trace.snapshots.last() {
            None if block.index > 1 => Err(Error::malformed_trace(
                block.line,
                format!("trace starts at state {}", block.index),
            )),
            None => Ok(()),
            Some(_) if self.trace.trace_number != Some(block.trace_number) => {
                Err(Error::malformed_trace(
                    block.line,
                    format!("state of trace {} inside another trace", block.trace_number),
                ))
            }
            Some(last) if block.index != last.index + 1 => Err(Error::malformed_trace(
                block.line,
                format!("state {} follows state {}", block.index, last.index),
            )),
            Some(_) => Ok(()),
        }
    }
}

/// Parses a trace as printed by `show_traces -v` or a failed check.
///
/// Lines before the first `-> State: t.i <-` header are a prelude; only the
/// `Trace Description:` and `Trace Type:` lines are kept from it. Input blocks
/// are folded into the state with the same index. A text without any state
/// header is rejected: an engine answer without a trace is reported through
/// the response's classification, never as an empty trace.
pub fn parse(text: &str) -> Result<Trace> {
    let mut builder = TraceBuilder::default();
    let mut current: Option<Block> = None;
    let mut loop_next = false;
    let mut last_line = None;

    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        last_line = Some(line_no);
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = header().captures(line) {
            if let Some(block) = current.take() {
                builder.finish_block(block)?;
            }
            let number = |i: usize| {
                caps[i]
                    .parse::<u32>()
                    .map_err(|e| Error::malformed_trace(line_no, format!("bad index: {e}")))
            };
            let kind = if &caps[1] == "State" {
                BlockKind::State
            } else {
                BlockKind::Input
            };
            let loop_start = kind == BlockKind::State && std::mem::take(&mut loop_next);
            current = Some(Block {
                kind,
                trace_number: number(2)?,
                index: number(3)?,
                line: line_no,
                loop_start,
                values: BTreeMap::new(),
            });
            continue;
        }
        if line.starts_with("--") {
            if line.contains("Loop starts here") {
                loop_next = true;
            }
            continue;
        }
        match current.as_mut() {
            None => {
                if let Some(description) = line.strip_prefix("Trace Description:") {
                    builder.trace.description = Some(description.trim().to_string());
                } else if let Some(kind) = line.strip_prefix("Trace Type:") {
                    builder.trace.kind = Some(kind.trim().to_string());
                }
            }
            Some(block) => {
                let (name, value) = assignment(line, line_no)?;
                insert_unique(&mut block.values, name, value, line_no)?;
            }
        }
    }

    if let Some(block) = current.take() {
        builder.finish_block(block)?;
    }
    if let Some(input) = builder.pending_input {
        return Err(Error::malformed_trace(
            input.line,
            "input block at the end of the trace",
        ));
    }
    if builder.trace.snapshots.is_empty() {
        return Err(Error::malformed_trace(last_line, "no state headers found"));
    }
    debug!(
        "parsed trace with {} states over {} variables",
        builder.trace.len(),
        builder.trace.variables().len()
    );
    Ok(builder.trace)
}

/// Separates the candidate states listed by `msat_pick_state -i` and
/// `msat_simulate -i`.
pub const STATE_SEPARATOR: &str = "================= State =================";

fn choice_header() -> &'static Regex {
    static CHOICE: OnceLock<Regex> = OnceLock::new();
    CHOICE.get_or_init(|| Regex::new(r"^\d+\) -+$").unwrap_or_else(|e| panic!("{e}")))
}

/// Parses the candidate states the engine offers during an interactive
/// simulation. Snapshot `i` is the state to answer with `i`.
pub fn parse_available_states(text: &str) -> Result<Vec<StateSnapshot>> {
    let mut states: Vec<StateSnapshot> = vec![];
    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line == STATE_SEPARATOR {
            states.push(StateSnapshot::new(states.len() as u32));
            continue;
        }
        let Some(state) = states.last_mut() else {
            continue;
        };
        if line.is_empty() || choice_header().is_match(line) || line.starts_with("->") {
            continue;
        }
        let (name, value) = assignment(line, i + 1)?;
        insert_unique(&mut state.values, name, value, i + 1)?;
    }
    Ok(states)
}
