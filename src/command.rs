use std::{convert::Infallible, fmt, path::Path, str::FromStr, time::Duration};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// The engine's coarse internal progression. Ordering follows the order in which
/// the states are reached, so `a < b` means `a` comes before `b`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Lifecycle {
    #[default]
    Idle,
    ModelLoaded,
    RelationBuilt,
    ResultAvailable,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Idle => "idle",
            Lifecycle::ModelLoaded => "model loaded",
            Lifecycle::RelationBuilt => "relation built",
            Lifecycle::ResultAvailable => "result available",
        };
        f.write_str(name)
    }
}

/// Which transition relation a command works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "kebab_case")]
pub enum Backend {
    /// BDD based relation, built with `go`.
    Bdd,
    /// SMT based relation, built with `go_msat`.
    #[default]
    Msat,
}

/// One instruction for the engine together with what it needs and what it does
/// to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
    requires: Lifecycle,
    advances_to: Option<Lifecycle>,
    backend: Option<Backend>,
    multiline: bool,
    timeout: Option<Duration>,
}

impl Command {
    /// A command with no prerequisites that does not move the lifecycle.
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            text: text.into().trim().to_string(),
            requires: Lifecycle::Idle,
            advances_to: None,
            backend: None,
            multiline: false,
            timeout: None,
        }
    }

    pub fn requires(mut self, state: Lifecycle) -> Self {
        self.requires = state;
        self
    }

    pub fn advances_to(mut self, state: Lifecycle) -> Self {
        self.advances_to = Some(state);
        self
    }

    pub fn on_backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn multiline(mut self) -> Self {
        self.multiline = true;
        self
    }

    /// Bounds the wait for this command's response, overriding the session default.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        if timeout.is_some() {
            self.timeout = timeout;
        }
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn required_state(&self) -> Lifecycle {
        self.requires
    }

    pub fn target_state(&self) -> Option<Lifecycle> {
        self.advances_to
    }

    pub fn backend(&self) -> Option<Backend> {
        self.backend
    }

    pub fn expects_multiline(&self) -> bool {
        self.multiline
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_transition(&self) -> bool {
        self.advances_to.is_some()
    }

    pub fn load_model(path: &Path) -> Self {
        Self::raw(format!("read_model -i \"{}\"", path.display())).advances_to(Lifecycle::ModelLoaded)
    }

    pub fn build(backend: Backend) -> Self {
        let text = match backend {
            Backend::Bdd => "go",
            Backend::Msat => "go_msat",
        };
        Self::raw(text)
            .requires(Lifecycle::ModelLoaded)
            .advances_to(Lifecycle::RelationBuilt)
            .on_backend(backend)
    }

    pub fn build_boolean_model() -> Self {
        Self::raw("build_boolean_model").requires(Lifecycle::ModelLoaded)
    }

    pub fn set(name: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => Self::raw(format!("set {name} \"{value}\"")),
            None => Self::raw(format!("unset {name}")),
        }
    }

    /// Lists all engine options.
    pub fn show_options() -> Self {
        Self::raw("set").multiline()
    }

    pub fn pick_random_state() -> Self {
        Self::raw("pick_state -r")
            .requires(Lifecycle::RelationBuilt)
            .advances_to(Lifecycle::ResultAvailable)
            .on_backend(Backend::Bdd)
    }

    pub fn simulate_random(steps: u32) -> Self {
        Self::raw(format!("simulate -r -k {steps}"))
            .requires(Lifecycle::ResultAvailable)
            .on_backend(Backend::Bdd)
    }

    pub fn show_traces() -> Self {
        Self::raw("show_traces -v")
            .requires(Lifecycle::ResultAvailable)
            .multiline()
    }

    pub fn check_ltlspec(ltlspec: Option<&str>) -> Self {
        Self::check(
            words(&["check_ltlspec", &quoted_flag("-p", ltlspec)]),
            Backend::Bdd,
        )
    }

    pub fn check_invar(invar: Option<&str>) -> Self {
        Self::check(
            words(&["check_invar", &quoted_flag("-p", invar)]),
            Backend::Bdd,
        )
    }

    pub fn check_ltlspec_ic3(bound: Option<u32>, ltlspec: Option<&str>) -> Self {
        Self::check(
            words(&[
                "check_ltlspec_ic3",
                &bound_flag(bound),
                &quoted_flag("-p", ltlspec),
            ]),
            Backend::Msat,
        )
    }

    pub fn check_property_as_invar_ic3(bound: Option<u32>, ltlspec: Option<&str>) -> Self {
        Self::check(
            words(&[
                "check_property_as_invar_ic3",
                &bound_flag(bound),
                &quoted_flag("-L", ltlspec),
            ]),
            Backend::Msat,
        )
    }

    pub fn msat_check_ltlspec_bmc(bound: u32, ltlspec: Option<&str>) -> Self {
        Self::check(
            words(&[
                "msat_check_ltlspec_bmc",
                &format!("-k {bound}"),
                &quoted_flag("-p", ltlspec),
            ]),
            Backend::Msat,
        )
    }

    /// Asks for the initial states satisfying `constraint`; answered with a
    /// state-choice prompt rather than the console prompt.
    pub fn msat_pick_state(constraint: &str) -> Self {
        Self::raw(format!("msat_pick_state -c \"{constraint}\" -v -i"))
            .requires(Lifecycle::RelationBuilt)
            .advances_to(Lifecycle::ResultAvailable)
            .on_backend(Backend::Msat)
            .multiline()
    }

    pub fn msat_simulate_step(constraint: &str) -> Self {
        Self::raw(format!("msat_simulate -i -a -k 1 -c \"{constraint}\""))
            .requires(Lifecycle::ResultAvailable)
            .on_backend(Backend::Msat)
            .multiline()
    }

    /// Answer to a state-choice prompt.
    pub fn choose(index: usize) -> Self {
        Self::raw(index.to_string()).multiline()
    }

    pub fn quit() -> Self {
        Self::raw("quit")
    }

    fn with_text(mut self, text: String) -> Self {
        self.text = text;
        self
    }

    fn check(text: String, backend: Backend) -> Self {
        Self::raw(text)
            .requires(Lifecycle::RelationBuilt)
            .advances_to(Lifecycle::ResultAvailable)
            .on_backend(backend)
            .multiline()
    }
}

/// Reads one line of a command script, recognising the engine commands whose
/// prerequisites are known. Anything else is sent as is.
impl FromStr for Command {
    type Err = Infallible;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let command = Self::raw(line);
        let verb = command
            .text
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        let command = match verb.as_str() {
            "read_model" => command.advances_to(Lifecycle::ModelLoaded),
            "go" => Self::build(Backend::Bdd).with_text(command.text),
            "go_msat" => Self::build(Backend::Msat).with_text(command.text),
            "build_boolean_model" => command.requires(Lifecycle::ModelLoaded),
            "check_ltlspec" | "check_ctlspec" | "check_invar" | "check_pslspec" => {
                Self::check(command.text, Backend::Bdd)
            }
            "check_ltlspec_ic3"
            | "check_property_as_invar_ic3"
            | "check_invar_ic3"
            | "msat_check_ltlspec_bmc"
            | "msat_check_invar_bmc" => Self::check(command.text, Backend::Msat),
            "pick_state" => command
                .requires(Lifecycle::RelationBuilt)
                .advances_to(Lifecycle::ResultAvailable)
                .on_backend(Backend::Bdd),
            "simulate" => command
                .requires(Lifecycle::ResultAvailable)
                .on_backend(Backend::Bdd),
            "msat_simulate" => command
                .requires(Lifecycle::ResultAvailable)
                .on_backend(Backend::Msat)
                .multiline(),
            "show_traces" => command.requires(Lifecycle::ResultAvailable).multiline(),
            "set" if command.text == "set" => command.multiline(),
            _ => command,
        };
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn words(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

fn quoted_flag(flag: &str, value: Option<&str>) -> String {
    value
        .map(|v| format!("{flag} \"{v}\""))
        .unwrap_or_default()
}

fn bound_flag(bound: Option<u32>) -> String {
    bound.map(|k| format!("-k {k}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_order() {
        assert!(Lifecycle::Idle < Lifecycle::ModelLoaded);
        assert!(Lifecycle::ModelLoaded < Lifecycle::RelationBuilt);
        assert!(Lifecycle::RelationBuilt < Lifecycle::ResultAvailable);
    }

    #[test]
    fn test_raw_command_has_no_prerequisite() {
        let cmd = Command::raw("  echo  ");
        assert_eq!(cmd.text(), "echo");
        assert_eq!(cmd.required_state(), Lifecycle::Idle);
        assert!(!cmd.is_transition());
    }

    #[test]
    fn test_check_command_text() {
        let cmd = Command::check_ltlspec_ic3(Some(10), Some("G x"));
        assert_eq!(cmd.text(), "check_ltlspec_ic3 -k 10 -p \"G x\"");
        assert_eq!(cmd.required_state(), Lifecycle::RelationBuilt);
        assert_eq!(cmd.target_state(), Some(Lifecycle::ResultAvailable));
        assert_eq!(cmd.backend(), Some(Backend::Msat));

        let cmd = Command::check_ltlspec(None);
        assert_eq!(cmd.text(), "check_ltlspec");

        let cmd = Command::check_property_as_invar_ic3(None, Some("x < 3"));
        assert_eq!(cmd.text(), "check_property_as_invar_ic3 -L \"x < 3\"");
        assert_eq!(cmd.backend(), Some(Backend::Msat));
    }

    #[test]
    fn test_set_and_unset() {
        assert_eq!(
            Command::set("shown_states", Some("10")).text(),
            "set shown_states \"10\""
        );
        assert_eq!(Command::set("input_file", None).text(), "unset input_file");
    }

    #[test]
    fn test_build_per_backend() {
        assert_eq!(Command::build(Backend::Bdd).text(), "go");
        assert_eq!(Command::build(Backend::Msat).text(), "go_msat");
        assert_eq!(
            Command::build(Backend::Bdd).target_state(),
            Some(Lifecycle::RelationBuilt)
        );
    }

    #[test]
    fn test_timeout_override_keeps_existing() {
        let cmd = Command::raw("x").with_timeout(Some(Duration::from_secs(3)));
        assert_eq!(cmd.with_timeout(None).timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_script_lines() {
        let cmd: Command = "check_ltlspec_ic3 -k 3".parse().unwrap();
        assert_eq!(cmd.required_state(), Lifecycle::RelationBuilt);
        assert_eq!(cmd.backend(), Some(Backend::Msat));
        assert_eq!(cmd.text(), "check_ltlspec_ic3 -k 3");

        let cmd: Command = "  go ".parse().unwrap();
        assert_eq!(cmd, Command::build(Backend::Bdd));

        let cmd: Command = "show_traces -v 2".parse().unwrap();
        assert_eq!(cmd.required_state(), Lifecycle::ResultAvailable);

        let cmd: Command = "echo hello".parse().unwrap();
        assert_eq!(cmd, Command::raw("echo hello"));
        assert!(!"set shown_states 3".parse::<Command>().unwrap().expects_multiline());
    }
}
