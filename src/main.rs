use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use rxmv::{
    logger, read_script, Command, Diagnostic, EngineConfig, Error, Outcome, RxmvOptions, Session,
    Status, Task, Verdict,
};
use serde::Serialize;

/// Exit codes follow the CPROVER conventions; 1 and 2 are left to panics and
/// usage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Success = 0,
    Inconclusive = 5,
    InternalError = 6,
    VerificationFailed = 10,
    Timeout = 124,
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        ExitCode::from(exit as u8)
    }
}

#[derive(Serialize)]
struct ResponseReport<'a> {
    command: &'a str,
    status: Status,
    text: &'a str,
    diagnostics: &'a [Diagnostic],
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn verdict_exit(outcomes: &[Outcome]) -> Exit {
    if outcomes.iter().any(|o| o.verdict == Verdict::False) {
        Exit::VerificationFailed
    } else if outcomes.is_empty() || outcomes.iter().any(|o| o.verdict == Verdict::Unknown) {
        Exit::Inconclusive
    } else {
        Exit::Success
    }
}

fn verify(session: &mut Session, command: Command, json: bool) -> anyhow::Result<Exit> {
    let outcomes = session.verify(&command)?;
    if json {
        print_json(&outcomes)?;
    } else {
        for outcome in &outcomes {
            println!("{}", outcome.message());
            if let Some(trace) = &outcome.trace {
                print!("{trace}");
            }
        }
        if outcomes.is_empty() {
            println!("VERIFICATION INCONCLUSIVE");
        }
    }
    Ok(verdict_exit(&outcomes))
}

fn execute(options: &RxmvOptions, config: &EngineConfig) -> anyhow::Result<Exit> {
    let mut session = Session::open_with(options.task.model(), config)?;
    let json = options.json;

    let exit = match &options.task {
        Task::Simulate {
            heuristic,
            seed,
            steps,
            constraint,
            ..
        } => {
            let mut heuristic = heuristic.build(*seed);
            let initial = session.init_simulation(constraint, heuristic.as_mut())?;
            let mut run = session.simulate(*steps, constraint, heuristic.as_mut())?;
            run.states.insert(0, initial);
            if json {
                print_json(&run)?;
            } else {
                for state in &run.states {
                    println!("-> State {} <-", state.index);
                    for (name, value) in &state.values {
                        println!("    {name} = {value}");
                    }
                }
            }
            Exit::Success
        }
        Task::Ic3 {
            bound, property, ..
        } => verify(
            &mut session,
            Command::check_ltlspec_ic3(*bound, property.as_deref()),
            json,
        )?,
        Task::Ic3Invar {
            bound, property, ..
        } => verify(
            &mut session,
            Command::check_property_as_invar_ic3(*bound, property.as_deref()),
            json,
        )?,
        Task::Bmc {
            bound, property, ..
        } => verify(
            &mut session,
            Command::msat_check_ltlspec_bmc(*bound, property.as_deref()),
            json,
        )?,
        Task::CheckLtl { property, .. } => verify(
            &mut session,
            Command::check_ltlspec(property.as_deref()),
            json,
        )?,
        Task::Run { script, .. } => {
            let commands = read_script(script)?;
            let outcome = session.run(&commands);
            if json {
                let reports = outcome
                    .responses
                    .iter()
                    .map(|r| ResponseReport {
                        command: r.command.text(),
                        status: r.status,
                        text: &r.text,
                        diagnostics: &r.diagnostics,
                    })
                    .collect::<Vec<_>>();
                print_json(&reports)?;
            } else {
                for response in &outcome.responses {
                    println!("{response}");
                }
            }
            if outcome.completed() {
                Exit::Success
            } else {
                match outcome.failure {
                    Some(err) => return Err(err.into()),
                    None => Exit::InternalError,
                }
            }
        }
        Task::Trace { commands, .. } => {
            let commands = commands
                .iter()
                .filter_map(|c| c.parse::<Command>().ok())
                .collect::<Vec<_>>();
            let Some((last, setup)) = commands.split_last() else {
                return Ok(Exit::InternalError);
            };
            let responses = session.run(setup).into_result()?;
            if let Some(failed) = responses.iter().find(|r| r.is_error()) {
                anyhow::bail!("`{}` failed: {}", failed.command, failed.summary());
            }
            let trace = session.get_trace(last)?;
            if json {
                print_json(&trace)?;
            } else {
                print!("{trace}");
            }
            Exit::Success
        }
    };
    session.close()?;
    Ok(exit)
}

fn main() -> ExitCode {
    let options = RxmvOptions::parse();
    logger::init_logger(logger::level_for(options.verbose), options.line_numbers);

    let result = options
        .engine_config()
        .and_then(|config| execute(&options, &config));
    let exit = match result {
        Ok(exit) => exit,
        Err(err) => {
            error!("{err:#}");
            match err.downcast_ref::<Error>() {
                Some(Error::ChannelTimeout { .. }) => Exit::Timeout,
                _ => Exit::InternalError,
            }
        }
    };
    info!("exit code {}", exit as u8);
    exit.into()
}
