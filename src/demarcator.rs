//! Turning raw console text into classified responses.
//!
//! The engine only reports problems as free-form text, so classification is a
//! table of line patterns. The table below follows the nuXmv 2.x message
//! catalogue and has to be revisited when the engine's messages change.

use std::{fmt, sync::OnceLock};

use regex::Regex;
use serde::Serialize;

use crate::command::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Status {
    Success,
    Warning,
    Error,
}

/// Engine state a failed command was missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Prerequisite {
    InputFile,
    ModelRead,
    BooleanModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiagnosticKind {
    Parse,
    Type,
    Semantic,
    MissingPrerequisite(Prerequisite),
    Internal,
    Warning,
}

impl DiagnosticKind {
    pub fn severity(self) -> Status {
        match self {
            DiagnosticKind::Warning => Status::Warning,
            _ => Status::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub line: String,
}

#[derive(Debug, Clone)]
struct Rule {
    kind: DiagnosticKind,
    pattern: Regex,
}

/// Ordered pattern table; the first rule matching a line decides its kind.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<Rule>,
}

const NUXMV_RULES: &[(DiagnosticKind, &str)] = &[
    (
        DiagnosticKind::MissingPrerequisite(Prerequisite::BooleanModel),
        r"The boolean model must be built before",
    ),
    (
        DiagnosticKind::MissingPrerequisite(Prerequisite::InputFile),
        r"You must set the input file before",
    ),
    (
        DiagnosticKind::MissingPrerequisite(Prerequisite::ModelRead),
        r"A model must be read before",
    ),
    (DiagnosticKind::Parse, r"(?i)\bparse error"),
    (DiagnosticKind::Parse, r"(?i)\bsyntax error"),
    (
        DiagnosticKind::Parse,
        r"unexpected expression encountered during parsing",
    ),
    (DiagnosticKind::Type, r"TYPE ERROR"),
    (DiagnosticKind::Type, r"not well typed"),
    (DiagnosticKind::Type, r"illegal operand types"),
    (DiagnosticKind::Type, r"Type System Violation detected"),
    (DiagnosticKind::Semantic, r"Nested next operator"),
    (
        DiagnosticKind::Semantic,
        r"No trace: constraint and initial state are inconsistent",
    ),
    (
        DiagnosticKind::Semantic,
        r"Impossible to build a BDD FSM with infinite precision variables",
    ),
    (DiagnosticKind::Semantic, r"(?i)cannot open input file"),
    (DiagnosticKind::Semantic, r"\bis undefined\b"),
    (DiagnosticKind::Internal, r"(?i)internal error"),
    (DiagnosticKind::Internal, r"^\s*(\*\*\* )?ERROR\b"),
    (DiagnosticKind::Warning, r"^\s*(\*\*\* )?WARNING\b"),
    (DiagnosticKind::Warning, r"^\s*[Ww]arning:"),
];

impl Default for Classifier {
    fn default() -> Self {
        Self::nuxmv()
    }
}

impl Classifier {
    pub fn nuxmv() -> Self {
        let rules = NUXMV_RULES
            .iter()
            .map(|&(kind, pattern)| Rule {
                kind,
                // the table is fixed, a bad entry is a programming error
                pattern: Regex::new(pattern).unwrap_or_else(|e| panic!("bad rule {pattern}: {e}")),
            })
            .collect();
        Self { rules }
    }

    /// Adds a rule after the existing ones.
    pub fn with_rule(mut self, kind: DiagnosticKind, pattern: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(pattern)?;
        // warnings stay last so an added error rule still wins over them
        let at = if kind == DiagnosticKind::Warning {
            self.rules.len()
        } else {
            self.rules
                .iter()
                .position(|r| r.kind == DiagnosticKind::Warning)
                .unwrap_or(self.rules.len())
        };
        self.rules.insert(at, Rule { kind, pattern });
        Ok(self)
    }

    pub fn diagnose(&self, text: &str) -> Vec<Diagnostic> {
        text.lines()
            .filter_map(|line| {
                self.rules
                    .iter()
                    .find(|rule| rule.pattern.is_match(line))
                    .map(|rule| Diagnostic {
                        kind: rule.kind,
                        line: line.trim().to_string(),
                    })
            })
            .collect()
    }

    pub fn classify(&self, raw: &str, command: &Command) -> Response {
        let text = strip_echo(raw, command.text()).to_string();
        let diagnostics = self.diagnose(&text);
        let status = diagnostics
            .iter()
            .map(|d| d.kind.severity())
            .max()
            .unwrap_or(Status::Success);
        Response {
            command: command.clone(),
            text,
            status,
            diagnostics,
        }
    }
}

/// Classifies with the default nuXmv table.
pub fn classify(raw: &str, command: &Command) -> Response {
    static DEFAULT: OnceLock<Classifier> = OnceLock::new();
    DEFAULT.get_or_init(Classifier::nuxmv).classify(raw, command)
}

/// Drops the engine's echo of `command` when it leads the response.
pub fn strip_echo<'a>(raw: &'a str, command: &str) -> &'a str {
    let trimmed = raw.trim_start_matches(['\r', '\n']);
    let (first, rest) = match trimmed.find('\n') {
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => (trimmed, ""),
    };
    if !command.is_empty() && first.trim() == command.trim() {
        rest
    } else {
        raw
    }
}

/// Splits a captured console transcript into the text between prompts. The
/// banner before the first prompt comes first; text after the last prompt is
/// dropped since its response is incomplete.
pub fn split_transcript<'a>(transcript: &'a str, prompt: &str) -> Vec<&'a str> {
    let mut chunks: Vec<&str> = transcript.split(prompt).collect();
    chunks.pop();
    chunks
}

/// The engine's answer to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub command: Command,
    pub text: String,
    pub status: Status,
    pub diagnostics: Vec<Diagnostic>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }

    pub fn has(&self, kind: DiagnosticKind) -> bool {
        self.diagnostics.iter().any(|d| d.kind == kind)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.kind.severity() == Status::Error)
    }

    /// The error lines, or the status when there are none.
    pub fn summary(&self) -> String {
        let lines = self.errors().map(|d| d.line.as_str()).collect::<Vec<_>>();
        if lines.is_empty() {
            format!("{:?}", self.status)
        } else {
            lines.join("; ")
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.status, self.command)?;
        if !self.text.trim().is_empty() {
            write!(f, "\n{}", self.text.trim_end())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd() -> Command {
        Command::raw("go")
    }

    #[test]
    fn test_success_when_nothing_matches() {
        let response = classify("  -> State: 1.1 <-\n    x = 0\n", &cmd());
        assert_eq!(response.status, Status::Success);
        assert!(response.diagnostics.is_empty());
    }

    #[test]
    fn test_parse_error() {
        let response = classify("file m.smv: line 3: parse error at token X\n", &cmd());
        assert_eq!(response.status, Status::Error);
        assert!(response.has(DiagnosticKind::Parse));
        assert_eq!(
            response.summary(),
            "file m.smv: line 3: parse error at token X"
        );
    }

    #[test]
    fn test_type_error() {
        let response = classify("illegal operand types of \"+\" : boolean and integer", &cmd());
        assert!(response.has(DiagnosticKind::Type));
        assert!(response.is_error());
    }

    #[test]
    fn test_warning_only() {
        let response = classify("*** WARNING: Game addon does not support properties\ndone\n", &cmd());
        assert_eq!(response.status, Status::Warning);
        assert!(!response.is_error());
    }

    #[test]
    fn test_error_wins_over_warning() {
        let text = "WARNING: something odd\nTYPE ERROR: x is boolean\n";
        let response = classify(text, &cmd());
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.diagnostics.len(), 2);
    }

    #[test]
    fn test_missing_boolean_model() {
        let response = classify("The boolean model must be built before.\n", &cmd());
        assert!(response.has(DiagnosticKind::MissingPrerequisite(
            Prerequisite::BooleanModel
        )));
    }

    #[test]
    fn test_variable_named_error_is_not_an_error() {
        let response = classify("    error = TRUE\n    warning_count = 2\n", &cmd());
        assert_eq!(response.status, Status::Success);
    }

    #[test]
    fn test_extra_rule() {
        let classifier = Classifier::nuxmv()
            .with_rule(DiagnosticKind::Internal, "out of memory")
            .unwrap();
        assert!(classifier.classify("out of memory", &cmd()).is_error());
        assert!(Classifier::nuxmv().with_rule(DiagnosticKind::Internal, "(").is_err());
    }

    #[test]
    fn test_strip_echo() {
        assert_eq!(strip_echo("go\nok\n", "go"), "ok\n");
        assert_eq!(strip_echo("\ngo \nok\n", "go"), "ok\n");
        assert_eq!(strip_echo("gone\n", "go"), "gone\n");
        assert_eq!(strip_echo("go", "go"), "");
    }

    #[test]
    fn test_split_transcript() {
        let transcript = "banner\nnuXmv > first\nnuXmv > second\nnuXmv > partial";
        assert_eq!(
            split_transcript(transcript, "nuXmv > "),
            vec!["banner\n", "first\n", "second\n"]
        );
    }
}
