use std::fmt;

use clap::ValueEnum;
use dialoguer::{theme::SimpleTheme, Select};
use itertools::Itertools;
use log::{debug, info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;

use crate::{
    channel::{EngineChannel, Marker},
    command::Command,
    demarcator::Response,
    session::Session,
    trace::{parse_available_states, StateSnapshot},
    Error, Result,
};

const CHOOSE_STATE: &str = r"Choose a state from the above \(0-[0-9]+\): ";
const ONLY_ONE_STATE: &str = "There's only one available state. Press Return to Proceed.";
const SAT: &str = "Simulation is SAT";

/// Decides which of the offered states an interactive simulation continues from.
pub trait SimulationHeuristic {
    /// `states` is never empty; the result must index into it.
    fn choose_from(&mut self, states: &[StateSnapshot]) -> Result<usize>;
}

pub struct RandomChoice {
    rng: StdRng,
}

impl RandomChoice {
    /// Seeds from the OS when no seed is given.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl SimulationHeuristic for RandomChoice {
    fn choose_from(&mut self, states: &[StateSnapshot]) -> Result<usize> {
        Ok(self.rng.gen_range(0..states.len()))
    }
}

/// Asks on the terminal.
pub struct UserChoice;

impl SimulationHeuristic for UserChoice {
    fn choose_from(&mut self, states: &[StateSnapshot]) -> Result<usize> {
        let items = states
            .iter()
            .map(|state| {
                state
                    .values
                    .iter()
                    .map(|(name, value)| format!("{name} = {value}"))
                    .join(", ")
            })
            .collect::<Vec<_>>();
        Select::with_theme(&SimpleTheme)
            .with_prompt(format!("Choose a state (0-{})", states.len() - 1))
            .items(&items)
            .default(0)
            .interact()
            .map_err(|e| Error::Io(std::io::Error::other(e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Heuristic {
    User,
    #[default]
    Random,
}

impl Heuristic {
    pub fn build(self, seed: Option<u64>) -> Box<dyn SimulationHeuristic> {
        match self {
            Heuristic::User => Box::new(UserChoice),
            Heuristic::Random => Box::new(RandomChoice::new(seed)),
        }
    }
}

impl fmt::Display for Heuristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Heuristic::User => write!(f, "user"),
            Heuristic::Random => write!(f, "random"),
        }
    }
}

/// The states chosen along an interactive simulation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulationRun {
    pub states: Vec<StateSnapshot>,
    /// Whether the engine could still extend the run after the last step.
    pub sat: bool,
}

impl<C: EngineChannel> Session<C> {
    /// Picks the initial state of an SMT based simulation among those
    /// satisfying `constraint`.
    pub fn init_simulation(
        &mut self,
        constraint: &str,
        heuristic: &mut dyn SimulationHeuristic,
    ) -> Result<StateSnapshot> {
        let command = Command::msat_pick_state(constraint);
        match self.pick(&command, heuristic)? {
            Some((state, _)) => Ok(state),
            None => Err(Error::MalformedOutput(format!(
                "`{command}` offered no initial state"
            ))),
        }
    }

    /// Extends the current simulation by up to `steps` steps, 0 meaning until
    /// the engine cannot go on.
    pub fn simulate(
        &mut self,
        steps: usize,
        constraint: &str,
        heuristic: &mut dyn SimulationHeuristic,
    ) -> Result<SimulationRun> {
        let mut run = SimulationRun::default();
        while steps == 0 || run.states.len() < steps {
            let command = Command::msat_simulate_step(constraint);
            let Some((mut state, answer)) = self.pick(&command, heuristic)? else {
                run.sat = false;
                break;
            };
            state.index = run.states.len() as u32 + 1;
            run.states.push(state);
            run.sat = answer.text.contains(SAT);
            if !run.sat {
                break;
            }
        }
        info!(
            "simulation stopped after {} steps ({})",
            run.states.len(),
            if run.sat { "SAT" } else { "not SAT" }
        );
        Ok(run)
    }

    /// Sends `command`, answers the state-choice question it raises and
    /// returns the chosen state with the engine's answer to the choice.
    /// `None` when the engine went back to the prompt without asking.
    ///
    /// The engine is never left waiting at the question: if no valid choice
    /// can be made, the first state is taken so that the console returns to
    /// its prompt, and the lifecycle is left where it was.
    fn pick(
        &mut self,
        command: &Command,
        heuristic: &mut dyn SimulationHeuristic,
    ) -> Result<Option<(StateSnapshot, Response)>> {
        let markers = [
            self.channel.prompt().clone(),
            Marker::pattern(CHOOSE_STATE)?,
            Marker::literal(ONLY_ONE_STATE),
        ];
        let (response, marker) = self.dispatch(command, &markers, &mut vec![])?;
        if marker == 0 {
            if response.is_error() {
                return Err(Error::CommandFailed {
                    response: Box::new(response),
                });
            }
            debug!("`{command}` returned without offering states");
            return Ok(None);
        }

        let (choice, state) = match choose(command, &response, marker, heuristic) {
            Ok(chosen) => chosen,
            Err(err) => {
                self.dismiss_question(command);
                return Err(err);
            }
        };
        debug!("choosing state {choice} for `{command}`");

        let answer = self.apply(&Command::choose(choice))?;
        if answer.is_error() {
            return Err(Error::CommandFailed {
                response: Box::new(answer),
            });
        }
        self.advance(command);
        Ok(Some((state, answer)))
    }

    /// Answers a pending state-choice question with the first state, or kills
    /// the engine if even that fails.
    fn dismiss_question(&mut self, command: &Command) {
        warn!("answering the open question of `{command}` with state 0");
        if let Err(err) = self.apply(&Command::choose(0)) {
            warn!("engine did not take the answer, aborting it: {err}");
            if let Err(err) = self.abort() {
                warn!("failed to abort engine: {err}");
            }
        }
    }
}

/// The state to continue from, out of those listed in `response`.
fn choose(
    command: &Command,
    response: &Response,
    marker: usize,
    heuristic: &mut dyn SimulationHeuristic,
) -> Result<(usize, StateSnapshot)> {
    if response.is_error() {
        return Err(Error::CommandFailed {
            response: Box::new(response.clone()),
        });
    }
    let states = parse_available_states(&response.text)?;
    if states.is_empty() {
        return Err(Error::MalformedOutput(format!(
            "`{command}` asked for a choice but listed no states"
        )));
    }
    let choice = if marker == 2 {
        0
    } else {
        heuristic.choose_from(&states)?
    };
    match states.get(choice) {
        Some(state) => Ok((choice, state.clone())),
        None => Err(Error::MalformedOutput(format!(
            "choice {choice} out of {} states",
            states.len()
        ))),
    }
}
