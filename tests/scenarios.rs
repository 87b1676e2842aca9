//! End-to-end behavior across hooks, reconciler, sweepers, locks and bridge.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use tether::bridge::{Bridge, BridgeError, BridgeSettings};
use tether::hooks::{HookKind, HookOutcome, HookPayload, HookReceiver, HookReport};
use tether::lifecycle::Transition;
use tether::lock::{LockKey, LockManager, LockSettings};
use tether::model::{Actor, AgentId, CommandState, Intent, NewAgent};
use tether::reconciler::Reconciler;
use tether::store::Store;
use tether::sweeper::{SweepSettings, Sweeper};
use tether::tmux::Multiplexer;

const WINDOW_SECS: i64 = 120;

struct World {
    tmp: tempfile::TempDir,
    db: PathBuf,
    store: Store,
    locks: LockManager,
}

impl World {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("tether.db");
        let store = Store::open(&db).unwrap();
        let locks = LockManager::open(&db, LockSettings::default()).unwrap();
        Self {
            tmp,
            db,
            store,
            locks,
        }
    }

    fn window() -> chrono::Duration {
        chrono::Duration::seconds(WINDOW_SECS)
    }

    fn receiver(&self) -> HookReceiver<'_> {
        HookReceiver::new(
            &self.store,
            &self.locks,
            Duration::from_secs(5),
            Self::window(),
        )
    }

    fn hook(&self, kind: HookKind, payload: serde_json::Value) -> HookReport {
        let payload = HookPayload::parse(kind, &payload.to_string(), Some("%1".into())).unwrap();
        self.receiver().process(&payload).unwrap()
    }

    fn transcript(&self) -> PathBuf {
        self.tmp.path().join("session.jsonl")
    }

    fn open_commands(&self, agent: AgentId) -> usize {
        self.store
            .commands_for_agent(agent)
            .unwrap()
            .iter()
            .filter(|c| !c.state.is_terminal())
            .count()
    }
}

fn base(session: &str, cwd: &str) -> serde_json::Value {
    json!({ "session_id": session, "cwd": cwd })
}

fn with(mut value: serde_json::Value, key: &str, field: serde_json::Value) -> serde_json::Value {
    value[key] = field;
    value
}

fn recorded(report: &HookReport) -> &tether::lifecycle::TurnOutcome {
    match &report.outcome {
        HookOutcome::Recorded(outcome) => outcome,
        other => panic!("expected a recorded turn, got {other:?}"),
    }
}

fn append(path: &Path, lines: &[serde_json::Value]) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
}

fn entry(kind: &str, text: &str, at: chrono::DateTime<Utc>) -> serde_json::Value {
    json!({
        "type": kind,
        "timestamp": at.to_rfc3339(),
        "message": { "role": if kind == "user" { "user" } else { "assistant" }, "content": text },
    })
}

#[test]
fn scenario_a_prompt_to_idle_agent_starts_processing() {
    let world = World::new();
    let report = world.hook(
        HookKind::UserPromptSubmit,
        with(base("s-a", "/repo"), "prompt", json!("fix the bug")),
    );
    let outcome = recorded(&report);

    assert_eq!(
        outcome.transition,
        Transition::Applied {
            path: vec![
                CommandState::Idle,
                CommandState::Commanded,
                CommandState::Processing
            ]
        }
    );
    assert_eq!(outcome.command.state, CommandState::Processing);

    let turns = world.store.turns_for_command(outcome.command.id).unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].actor, Actor::Operator);
    assert_eq!(turns[0].intent, Intent::Command);
    assert_eq!(turns[0].text, "fix the bug");
}

#[test]
fn scenario_b_stop_while_processing_completes_command() {
    let world = World::new();
    world.hook(
        HookKind::UserPromptSubmit,
        with(base("s-b", "/repo"), "prompt", json!("fix the bug")),
    );
    let report = world.hook(
        HookKind::Stop,
        with(
            base("s-b", "/repo"),
            "last_assistant_message",
            json!("I fixed the off-by-one in the pager. All tests pass."),
        ),
    );
    let outcome = recorded(&report);

    assert_eq!(outcome.turn.actor, Actor::Agent);
    assert_eq!(outcome.turn.intent, Intent::Completion);
    assert_eq!(outcome.command.state, CommandState::Complete);
    assert!(outcome.command.completed_at.is_some());
    assert_eq!(world.open_commands(report.agent_id), 0);
}

#[test]
fn scenario_c_rejected_transition_keeps_turn_and_state() {
    let world = World::new();
    world.hook(
        HookKind::UserPromptSubmit,
        with(base("s-c", "/repo"), "prompt", json!("clean up the config loader")),
    );
    let asked = world.hook(
        HookKind::Stop,
        with(
            base("s-c", "/repo"),
            "last_assistant_message",
            json!("Should I also remove the legacy YAML support?"),
        ),
    );
    assert_eq!(recorded(&asked).command.state, CommandState::AwaitingInput);

    let mut payload = base("s-c", "/repo");
    payload["tool_name"] = json!("AskUserQuestion");
    payload["tool_input"] = json!({ "questions": [{ "question": "Keep YAML?" }] });
    let report = world.hook(HookKind::PreToolUse, payload);
    let outcome = recorded(&report);

    assert!(outcome.transition.is_rejected());
    assert_eq!(outcome.turn.intent, Intent::Question);
    assert_eq!(outcome.command.state, CommandState::AwaitingInput);

    let turns = world.store.turns_for_command(outcome.command.id).unwrap();
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[2].id, outcome.turn.id);
}

/// Screens never change, whatever is sent.
#[derive(Default)]
struct FrozenPane {
    enters: RefCell<usize>,
    keys: RefCell<VecDeque<String>>,
}

impl Multiplexer for FrozenPane {
    fn send_literal(&self, _pane: &str, text: &str) -> Result<(), BridgeError> {
        self.keys.borrow_mut().push_back(format!("literal:{text}"));
        Ok(())
    }

    fn send_key(&self, _pane: &str, key: &str) -> Result<(), BridgeError> {
        if key == "Enter" {
            *self.enters.borrow_mut() += 1;
        }
        self.keys.borrow_mut().push_back(key.to_string());
        Ok(())
    }

    fn capture(&self, _pane: &str, _styled: bool) -> Result<String, BridgeError> {
        Ok("> yes please\n".to_string())
    }

    fn pane_exists(&self, _pane: &str) -> Result<bool, BridgeError> {
        Ok(true)
    }

    fn session_exists(&self, _session: &str) -> Result<bool, BridgeError> {
        Ok(true)
    }
}

#[test]
fn scenario_d_unregistered_submission_retries_enter_once() {
    let settings = BridgeSettings {
        ghost_wait: Duration::ZERO,
        enter_delay: Duration::ZERO,
        verify_delay: Duration::ZERO,
        key_delay: Duration::ZERO,
        ..BridgeSettings::default()
    };
    let bridge = Bridge::new(FrozenPane::default(), settings);

    let err = bridge.send_text("%1", "yes please").unwrap_err();
    assert!(matches!(
        err,
        BridgeError::SubmissionNotRegistered { attempts: 2, .. }
    ));
    assert_eq!(*bridge.multiplexer().enters.borrow(), 2);

    let keys: Vec<String> = bridge.multiplexer().keys.borrow().iter().cloned().collect();
    assert_eq!(keys, vec!["literal:yes please", "Enter", "Enter"]);
}

#[test]
fn scenario_e_reaper_skips_agent_held_by_reconciler() {
    let world = World::new();
    let long_ago = Utc::now() - chrono::Duration::hours(12);
    let transcript = world.transcript();
    append(&transcript, &[entry("user", "tidy the readme", long_ago)]);
    let agent = world
        .store
        .register_agent(
            &NewAgent {
                cwd: "/repo".into(),
                session_id: Some("s-e".into()),
                pane_id: Some("%1".into()),
                transcript_path: Some(transcript.display().to_string()),
            },
            long_ago,
        )
        .unwrap();

    // The reconciler side takes the lock first and holds it.
    let (held_tx, held_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let db = world.db.clone();
    let reconciler_side = thread::spawn(move || {
        let store = Store::open(&db).unwrap();
        let locks = LockManager::open(&db, LockSettings::default()).unwrap();
        let guard = locks.try_acquire(LockKey::agent(agent.id)).unwrap().unwrap();
        held_tx.send(()).unwrap();
        go_rx.recv().unwrap();
        let reconciler = Reconciler::new(&store, &locks, World::window());
        let report = reconciler.reconcile_agent(agent.id).unwrap();
        drop(guard);
        report
    });
    held_rx.recv().unwrap();

    let mux = FrozenPane::default();
    let sweeper = Sweeper::new(&world.store, &world.locks, &mux, SweepSettings::default());
    let busy = sweeper.reap_inactive(Utc::now()).unwrap();
    assert_eq!(busy.busy, 1);
    assert_eq!(busy.ended, 0);
    assert!(world.store.agent(agent.id).unwrap().unwrap().is_active());
    assert!(world.store.turns_for_agent(agent.id).unwrap().is_empty());

    go_tx.send(()).unwrap();
    let reconciled = reconciler_side.join().unwrap();
    assert_eq!(reconciled.created, 1);

    // Next cycle: the lock is free and the agent is still stale.
    let next = sweeper.reap_inactive(Utc::now()).unwrap();
    assert_eq!(next.busy, 0);
    assert_eq!(next.ended, 1);
    assert!(!world.store.agent(agent.id).unwrap().unwrap().is_active());
}

#[test]
fn reconciling_twice_creates_no_duplicates() {
    let world = World::new();
    let transcript = world.transcript();
    let t0 = Utc::now() - chrono::Duration::minutes(10);
    append(
        &transcript,
        &[
            entry("user", "add a --json flag to status", t0),
            entry("assistant", "Looking at the status command now.", t0 + chrono::Duration::seconds(5)),
            entry(
                "assistant",
                "I have implemented the --json flag and updated the tests.",
                t0 + chrono::Duration::seconds(40),
            ),
        ],
    );
    let agent = world
        .store
        .register_agent(
            &NewAgent {
                cwd: "/repo".into(),
                transcript_path: Some(transcript.display().to_string()),
                ..NewAgent::default()
            },
            t0,
        )
        .unwrap();

    let reconciler = Reconciler::new(&world.store, &world.locks, World::window());
    let first = reconciler.run_pass().unwrap();
    assert_eq!(first.created, 3);
    let after_first = world.store.turns_for_agent(agent.id).unwrap();

    let second = reconciler.run_pass().unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(world.store.turns_for_agent(agent.id).unwrap(), after_first);

    // A full re-read (offset reset) still adds nothing.
    world.store.set_transcript_offset(agent.id, 0).unwrap();
    let third = reconciler.run_pass().unwrap();
    assert_eq!(third.created, 0);
    assert_eq!(third.duplicates, 3);
    assert_eq!(world.store.turns_for_agent(agent.id).unwrap().len(), 3);

    let command = world.store.latest_command(agent.id).unwrap().unwrap();
    assert_eq!(command.state, CommandState::Complete);
}

#[test]
fn hook_turn_is_matched_not_duplicated_by_transcript() {
    let world = World::new();
    let transcript = world.transcript();
    std::fs::write(&transcript, "").unwrap();
    let payload = with(
        with(base("s-m", "/repo"), "prompt", json!("rename the crate")),
        "transcript_path",
        json!(transcript.display().to_string()),
    );
    let report = world.hook(HookKind::UserPromptSubmit, payload);
    let hook_turn = recorded(&report).turn.clone();

    let logged_at = hook_turn.timestamp - chrono::Duration::seconds(2);
    append(&transcript, &[entry("user", "  rename   the crate ", logged_at)]);

    let reconciler = Reconciler::new(&world.store, &world.locks, World::window());
    let pass = reconciler.run_pass().unwrap();
    assert_eq!(pass.matched, 1);
    assert_eq!(pass.created, 0);

    let turns = world.store.turns_for_agent(report.agent_id).unwrap();
    assert_eq!(turns.len(), 1);
    assert!(turns[0].reconciled);
    assert_eq!(turns[0].timestamp.timestamp_millis(), logged_at.timestamp_millis());
}

fn prompt_with_transcript(world: &World, session: &str, prompt: &str) -> (AgentId, PathBuf) {
    let transcript = world.transcript();
    std::fs::write(&transcript, "").unwrap();
    let payload = with(
        with(base(session, "/repo"), "prompt", json!(prompt)),
        "transcript_path",
        json!(transcript.display().to_string()),
    );
    let report = world.hook(HookKind::UserPromptSubmit, payload);
    (report.agent_id, transcript)
}

#[test]
fn stop_hook_after_reconciler_pairs_with_recovered_turn() {
    let world = World::new();
    let (agent, transcript) = prompt_with_transcript(&world, "s-r", "fix the null check");
    let now = Utc::now();
    append(
        &transcript,
        &[
            entry("user", "fix the null check", now),
            entry("assistant", "Fixed the null check.", now + chrono::Duration::seconds(1)),
        ],
    );

    let reconciler = Reconciler::new(&world.store, &world.locks, World::window());
    let pass = reconciler.run_pass().unwrap();
    assert_eq!((pass.matched, pass.created), (1, 1));
    // Read from the transcript alone this is narration, not a finish.
    let command = world.store.latest_command(agent).unwrap().unwrap();
    assert_eq!(command.state, CommandState::Processing);

    let report = world.hook(
        HookKind::Stop,
        with(base("s-r", "/repo"), "last_assistant_message", json!("Fixed the null check.")),
    );
    let outcome = recorded(&report);
    assert!(matches!(outcome.transition, Transition::Applied { .. }));
    assert_eq!(outcome.command.state, CommandState::Complete);

    let turns = world.store.turns_for_agent(agent).unwrap();
    assert_eq!(turns.len(), 2);
    let agent_turn = &turns[1];
    assert_eq!(agent_turn.id, outcome.turn.id);
    assert_eq!(agent_turn.intent, Intent::Completion);
    assert!(agent_turn.reconciled);

    // Re-reading the transcript still finds nothing new.
    world.store.set_transcript_offset(agent, 0).unwrap();
    assert_eq!(reconciler.run_pass().unwrap().created, 0);
    assert_eq!(world.store.turns_for_agent(agent).unwrap().len(), 2);
}

#[test]
fn stop_hook_for_already_completed_command_writes_nothing() {
    let world = World::new();
    let (agent, transcript) = prompt_with_transcript(&world, "s-q", "bump the version");
    let now = Utc::now();
    append(
        &transcript,
        &[entry("assistant", "I've updated the version to 0.5.0.", now)],
    );
    Reconciler::new(&world.store, &world.locks, World::window())
        .run_pass()
        .unwrap();
    let command = world.store.latest_command(agent).unwrap().unwrap();
    assert_eq!(command.state, CommandState::Complete);

    let report = world.hook(
        HookKind::Stop,
        with(
            base("s-q", "/repo"),
            "last_assistant_message",
            json!("I've updated the version to 0.5.0."),
        ),
    );
    let outcome = recorded(&report);
    assert_eq!(outcome.transition, Transition::AlreadyRecorded);
    assert_eq!(outcome.command.id, command.id);
    assert_eq!(world.store.turns_for_agent(agent).unwrap().len(), 2);
    assert_eq!(world.store.commands_for_agent(agent).unwrap().len(), 1);
}

#[test]
fn at_most_one_open_command_through_a_session() {
    let world = World::new();
    let s = || base("s-1", "/repo");
    let steps: Vec<(HookKind, serde_json::Value)> = vec![
        (HookKind::SessionStart, with(s(), "source", json!("startup"))),
        (HookKind::UserPromptSubmit, with(s(), "prompt", json!("first task"))),
        (HookKind::UserPromptSubmit, with(s(), "prompt", json!("also this"))),
        (HookKind::Stop, with(s(), "last_assistant_message", json!("Which option do you prefer?"))),
        (HookKind::UserPromptSubmit, with(s(), "prompt", json!("the second"))),
        (HookKind::Stop, with(s(), "last_assistant_message", json!("Done. Task is complete."))),
        (HookKind::Stop, with(s(), "last_assistant_message", json!("Done. Task is complete."))),
        (HookKind::UserPromptSubmit, with(s(), "prompt", json!("next task"))),
        (HookKind::SessionEnd, with(s(), "reason", json!("exit"))),
    ];

    let mut agent = None;
    for (kind, payload) in steps {
        let report = world.hook(kind, payload);
        agent = Some(report.agent_id);
        assert!(world.open_commands(report.agent_id) <= 1, "after {kind}");
    }
    let agent = agent.unwrap();
    assert_eq!(world.open_commands(agent), 0);
    assert!(!world.store.agent(agent).unwrap().unwrap().is_active());
    assert_eq!(world.store.commands_for_agent(agent).unwrap().len(), 2);
}

#[test]
fn concurrent_hooks_on_two_agents_stay_separate() {
    let world = World::new();
    let rounds = 15;
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = ["alpha", "beta"]
        .into_iter()
        .map(|name| {
            let db = world.db.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = Store::open(&db).unwrap();
                let locks = LockManager::open(&db, LockSettings::default()).unwrap();
                let receiver =
                    HookReceiver::new(&store, &locks, Duration::from_secs(10), World::window());
                let session = format!("s-{name}");
                let cwd = format!("/work/{name}");
                barrier.wait();
                let mut agent = 0;
                for i in 0..rounds {
                    let prompt = with(
                        base(&session, &cwd),
                        "prompt",
                        json!(format!("{name} task {i}")),
                    );
                    let payload = HookPayload::parse(
                        HookKind::UserPromptSubmit,
                        &prompt.to_string(),
                        None,
                    )
                    .unwrap();
                    agent = receiver.process(&payload).unwrap().agent_id;

                    let stop = with(
                        base(&session, &cwd),
                        "last_assistant_message",
                        json!(format!("{name} task {i} is complete.")),
                    );
                    let payload =
                        HookPayload::parse(HookKind::Stop, &stop.to_string(), None).unwrap();
                    receiver.process(&payload).unwrap();
                }
                (name, agent)
            })
        })
        .collect();

    for handle in handles {
        let (name, agent) = handle.join().unwrap();
        let record = world.store.agent(agent).unwrap().unwrap();
        assert_eq!(record.cwd, format!("/work/{name}"));

        let turns = world.store.turns_for_agent(agent).unwrap();
        assert_eq!(turns.len(), rounds * 2);
        assert!(turns.iter().all(|t| t.text.starts_with(name)), "{name} saw foreign turns");

        let commands = world.store.commands_for_agent(agent).unwrap();
        assert_eq!(commands.len(), rounds);
        assert!(commands.iter().all(|c| c.state == CommandState::Complete));
        for command in commands {
            let turns = world.store.turns_for_command(command.id).unwrap();
            assert_eq!(turns.len(), 2);
            assert!(turns.iter().all(|t| t.agent_id == agent));
        }
    }
}

#[test]
fn same_agent_lock_admits_one_holder_at_a_time() {
    let world = World::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let entered = Arc::new(AtomicUsize::new(0));
    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let db = world.db.clone();
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            let entered = Arc::clone(&entered);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let locks = LockManager::open(&db, LockSettings::default()).unwrap();
                barrier.wait();
                for _ in 0..5 {
                    let guard = locks
                        .acquire(LockKey::agent(1), Duration::from_secs(20))
                        .unwrap();
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(2));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    entered.fetch_add(1, Ordering::SeqCst);
                    drop(guard);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(entered.load(Ordering::SeqCst), threads * 5);
}

#[test]
fn non_blocking_attempts_never_both_succeed() {
    let world = World::new();
    let barrier = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let db = world.db.clone();
            let barrier = Arc::clone(&barrier);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                let locks = LockManager::open(&db, LockSettings::default()).unwrap();
                barrier.wait();
                let guard = locks.try_acquire(LockKey::agent(9)).unwrap();
                let won = guard.is_some();
                // Hold until both attempts are in.
                release.wait();
                drop(guard);
                won
            })
        })
        .collect();

    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(wins, 1);
}
