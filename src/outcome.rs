use std::{fmt, sync::OnceLock};

use regex::Regex;
use serde::Serialize;

use crate::{trace::Trace, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Verdict {
    True,
    False,
    Unknown,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::True => "SUCCESSFUL",
            Verdict::False => "FAILED",
            Verdict::Unknown => "INCONCLUSIVE",
        })
    }
}

/// The result of checking one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    /// `LTL`, `invariant`, ... whatever the engine put in front of the property.
    pub logic: String,
    pub specification: String,
    pub verdict: Verdict,
    /// Present for false verdicts.
    pub trace: Option<Trace>,
    #[serde(skip)]
    pub unparsed: String,
}

fn header() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(
            r"^--\s+(.*?)\b(specification|invariant|property)\s+(.*?)\s+is\s+(true|false|unknown)\s*$",
        )
        .unwrap_or_else(|e| panic!("{e}"))
    })
}

impl Outcome {
    /// Splits the output of a check command into one outcome per property.
    /// Each false verdict must come with a counterexample.
    pub fn parse(text: &str) -> Result<Vec<Outcome>> {
        let lines: Vec<&str> = text.lines().collect();
        let starts: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| header().is_match(line.trim()))
            .map(|(i, _)| i)
            .collect();

        let mut outcomes = vec![];
        for (n, &start) in starts.iter().enumerate() {
            let end = starts.get(n + 1).copied().unwrap_or(lines.len());
            let head = lines[start].trim();
            let Some(caps) = header().captures(head) else {
                continue;
            };
            let prefix = caps[1].trim();
            let logic = if prefix.is_empty() { &caps[2] } else { prefix };
            let verdict = match &caps[4] {
                "true" => Verdict::True,
                "false" => Verdict::False,
                _ => Verdict::Unknown,
            };
            let body = lines[start + 1..end].join("\n");
            let trace = match verdict {
                Verdict::False => Some(Trace::parse(&body)?),
                _ => None,
            };
            outcomes.push(Outcome {
                logic: logic.to_string(),
                specification: caps[3].trim().to_string(),
                verdict,
                trace,
                unparsed: lines[start..end].join("\n"),
            });
        }
        Ok(outcomes)
    }

    pub fn message(&self) -> String {
        format!(
            "VERIFICATION {} for {} ({})",
            self.verdict, self.specification, self.logic
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK_OUTPUT: &str = "\
-- specification F done  is true
-- specification G !(x = 2)  is false
-- as demonstrated by the following execution sequence
Trace Description: LTL Counterexample
Trace Type: Counterexample
  -> State: 1.1 <-
    x = 0
  -> State: 1.2 <-
    x = 2
-- invariant x < 10  is unknown
";

    #[test]
    fn test_parse_outcomes() {
        let outcomes = Outcome::parse(CHECK_OUTPUT).unwrap();
        assert_eq!(outcomes.len(), 3);

        assert_eq!(outcomes[0].verdict, Verdict::True);
        assert_eq!(outcomes[0].specification, "F done");
        assert!(outcomes[0].trace.is_none());

        assert_eq!(outcomes[1].verdict, Verdict::False);
        let trace = outcomes[1].trace.as_ref().unwrap();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.kind.as_deref(), Some("Counterexample"));

        assert_eq!(outcomes[2].verdict, Verdict::Unknown);
        assert_eq!(outcomes[2].logic, "invariant");
    }

    #[test]
    fn test_prefixed_logic() {
        let outcomes = Outcome::parse("-- LTL specification G p  is true\n").unwrap();
        assert_eq!(outcomes[0].logic, "LTL");
        assert_eq!(outcomes[0].specification, "G p");
    }

    #[test]
    fn test_false_without_trace_is_an_error() {
        assert!(Outcome::parse("-- specification G p  is false\n").is_err());
    }

    #[test]
    fn test_no_outcomes() {
        let outcomes = Outcome::parse("-- no counterexample found with bound 10\n").unwrap();
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_message() {
        let outcomes = Outcome::parse(CHECK_OUTPUT).unwrap();
        insta::assert_snapshot!(
            outcomes.iter().map(Outcome::message).collect::<Vec<_>>().join("\n"),
            @r"
        VERIFICATION SUCCESSFUL for F done (specification)
        VERIFICATION FAILED for G !(x = 2) (specification)
        VERIFICATION INCONCLUSIVE for x < 10 (invariant)
        "
        );
    }
}
