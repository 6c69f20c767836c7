#![cfg(unix)]

use std::{path::PathBuf, time::Duration};

use rxmv::{
    Command, EngineConfig, Error, Lifecycle, Outcome, Session, SimulationHeuristic, StateSnapshot,
    Status, Value, Verdict,
};

fn fake_engine() -> EngineConfig {
    let script = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/fake_nuxmv.sh");
    EngineConfig {
        executable: "sh".into(),
        args: vec![script.display().to_string()],
        startup_timeout_seconds: 10,
        timeout_seconds: Some(10),
        grace_period_millis: 200,
        ..Default::default()
    }
}

fn open(model: &str) -> Session {
    let _ = env_logger::builder().is_test(true).try_init();
    Session::open_with(std::env::temp_dir().join(model), &fake_engine()).unwrap()
}

macro_rules! create_verification_test {
    ($test_name:ident, $command:expr, $verdict:expr, $trace_len:expr) => {
        #[test]
        fn $test_name() {
            let mut session = open("counter.smv");
            let outcomes: Vec<Outcome> = session.verify(&$command).unwrap();
            assert_eq!(outcomes.len(), 1);
            assert_eq!(outcomes[0].verdict, $verdict);
            assert_eq!(
                outcomes[0].trace.as_ref().map(|t| t.len()),
                $trace_len,
                "{}",
                outcomes[0].unparsed
            );
            assert_eq!(session.state(), Lifecycle::ResultAvailable);
            session.close().unwrap();
        }
    };
}

create_verification_test!(
    test_check_ltlspec,
    Command::check_ltlspec(None),
    Verdict::False,
    Some(3)
);
create_verification_test!(
    test_check_ltlspec_ic3,
    Command::check_ltlspec_ic3(Some(10), Some("G !(x = 2)")),
    Verdict::False,
    Some(3)
);
create_verification_test!(
    test_check_invar,
    Command::check_invar(Some("x < 3")),
    Verdict::False,
    Some(3)
);

#[test]
fn test_loop_marker_survives_the_pipe() {
    let mut session = open("counter.smv");
    let outcomes = session.verify(&Command::check_ltlspec(None)).unwrap();
    let trace = outcomes[0].trace.as_ref().unwrap();
    assert_eq!(trace.loop_indices(), vec![3]);
}

#[test]
fn test_launch_error() {
    let config = EngineConfig {
        executable: "/no/such/nuxmv".into(),
        ..Default::default()
    };
    let err = Session::open_with("/tmp/m.smv", &config).err().unwrap();
    assert!(matches!(err, Error::Launch { .. }));
    assert!(err.is_fatal());
}

#[test]
fn test_run_stops_at_failed_build() {
    let mut session = open("broken.smv");
    let outcome = session.run(&[Command::check_ltlspec_ic3(None, None), Command::raw("echo never")]);
    assert_eq!(outcome.responses.len(), 2);
    assert_eq!(outcome.responses[0].status, Status::Success);
    assert_eq!(outcome.responses[1].status, Status::Error);
    assert!(outcome.responses[1].text.contains("parse error at token X"));
    assert!(matches!(outcome.failure, Some(Error::PrerequisiteFailed { .. })));
    assert_eq!(session.state(), Lifecycle::ModelLoaded);

    let response = session.apply(&Command::raw("echo still here")).unwrap();
    assert_eq!(response.text.trim(), "still here");
}

#[test]
fn test_timeout_leaves_session_usable() {
    let mut session = open("counter.smv");
    let slow = Command::raw("slow").with_timeout(Some(Duration::from_millis(100)));
    let err = session.apply(&slow).unwrap_err();
    assert!(matches!(err, Error::ChannelTimeout { .. }));
    assert!(session.is_alive());

    // the late answer to `slow` must not be taken for this one
    let response = session.apply(&Command::raw("echo fresh")).unwrap();
    assert_eq!(response.text.trim(), "fresh");
    session.close().unwrap();
}

#[test]
fn test_resume_after_timeout() {
    let mut session = open("counter.smv");
    let slow = Command::raw("slow").with_timeout(Some(Duration::from_millis(100)));
    assert!(session.apply(&slow).is_err());
    let response = session.resume(Some(Duration::from_secs(10))).unwrap();
    assert_eq!(response.text.trim(), "slow done");
}

#[test]
fn test_crash_is_fatal() {
    let mut session = open("counter.smv");
    let err = session.apply(&Command::raw("crash")).unwrap_err();
    match &err {
        Error::EngineCrashed { stderr, .. } => assert!(stderr.contains("going down")),
        other => panic!("unexpected {other}"),
    }
    assert!(!session.is_alive());
    assert!(matches!(
        session.apply(&Command::raw("echo hi")),
        Err(Error::ChannelClosed)
    ));
}

#[test]
fn test_error_response() {
    let mut session = open("counter.smv");
    let response = session.apply(&Command::raw("bad")).unwrap();
    assert!(response.is_error());
    assert_eq!(response.summary(), "TYPE ERROR: illegal operand types of \"+\"");
}

#[test]
fn test_random_simulation_trace() {
    let mut session = open("counter.smv");
    let trace = session.random_simulation(1).unwrap();
    assert_eq!(trace.len(), 2);
    assert_eq!(trace.snapshots[1].get("x").and_then(|v| v.as_int()), Some(1));
}

#[test]
fn test_env() {
    let mut session = open("counter.smv");
    let env = session.env().unwrap();
    assert_eq!(env["shown_states"].as_deref(), Some("65535"));
    assert_eq!(env["input_order_file"], None);
}

#[test]
fn test_open_source_keeps_model_file() {
    let _ = env_logger::builder().is_test(true).try_init();
    let session =
        Session::open_source("MODULE main\nVAR x : 0..3;\n", &fake_engine()).unwrap();
    let model = session.model().to_path_buf();
    assert!(model.exists());
    assert!(session.history()[0].command.starts_with("set shown_states"));
    session.close().unwrap();
    assert!(!model.exists());
}

#[test]
fn test_abort_kills_engine() {
    let mut session = open("counter.smv");
    assert!(session.is_alive());
    let pid = session.channel().pid();
    assert!(pid > 0);
    session.abort().unwrap();
    assert!(!session.is_alive());
    assert!(matches!(
        session.apply(&Command::raw("echo hi")),
        Err(Error::ChannelClosed)
    ));
}

struct Pick(usize);

impl SimulationHeuristic for Pick {
    fn choose_from(&mut self, _states: &[StateSnapshot]) -> rxmv::Result<usize> {
        Ok(self.0)
    }
}

#[test]
fn test_simulation_over_the_pipe() {
    let mut session = open("counter.smv");
    let state = session.init_simulation("TRUE", &mut Pick(1)).unwrap();
    assert_eq!(state.get("x"), Some(&Value::Int(1)));
    assert_eq!(session.state(), Lifecycle::ResultAvailable);

    let run = session.simulate(2, "TRUE", &mut Pick(0)).unwrap();
    assert!(run.sat);
    assert_eq!(run.states.len(), 2);
    assert_eq!(run.states[1].get("x"), Some(&Value::Int(0)));
    session.close().unwrap();
}

#[test]
fn test_bad_choice_leaves_console_at_prompt() {
    let mut session = open("counter.smv");
    let err = session.init_simulation("TRUE", &mut Pick(7)).unwrap_err();
    assert!(matches!(err, Error::MalformedOutput(_)));
    assert_eq!(session.state(), Lifecycle::RelationBuilt);
    assert!(session.is_alive());

    let response = session.apply(&Command::raw("echo hi")).unwrap();
    assert_eq!(response.text.trim(), "hi");
    session.close().unwrap();
}
