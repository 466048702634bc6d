use super::*;
use crate::orchestrations::{fan_out_fan_in, ActivityResult};
use crate::runtime::FnOrchestration;
use crate::{AppErrorKind, ConfigErrorKind, Step};

const ACTIVITY: &str = "Fetch";

fn inputs() -> Vec<String> {
    ["A", "B", "C", "D", "E"].iter().map(|s| s.to_string()).collect()
}

fn batch_handler(k: i64) -> Arc<dyn OrchestrationHandler> {
    Arc::new(FnOrchestration(move |ctx: &mut OrchestrationContext, _input: &str| -> Step<String> {
        let results = fan_out_fan_in(ctx, ACTIVITY, &inputs(), k)?;
        Ok(results.iter().map(ActivityResult::render).collect::<Vec<_>>().join(", "))
    }))
}

fn completion(seq: u64, result: &str) -> WorkItem {
    WorkItem::ActivityCompleted {
        instance: "inst".to_string(),
        sequence_id: seq,
        result: result.to_string(),
    }
}

/// One orchestration turn the way the dispatcher drives it.
fn turn(
    history: &[Event],
    messages: Vec<WorkItem>,
    handler: Arc<dyn OrchestrationHandler>,
) -> (TurnResult, ReplayEngine) {
    let mut engine = ReplayEngine::new("inst", history.to_vec());
    engine.start("batch", "", 1_000);
    engine.prep_completions(messages);
    let result = engine.execute_orchestration(handler, "");
    engine.record_terminal(&result);
    (result, engine)
}

fn scheduled_ids(events: &[Event]) -> Vec<u64> {
    events
        .iter()
        .filter(|e| matches!(e, Event::ActivityScheduled { .. }))
        .filter_map(Event::sequence_id)
        .collect()
}

#[test]
fn first_turn_schedules_only_the_first_batch() {
    let (result, engine) = turn(&[], vec![], batch_handler(3));
    assert_eq!(result, TurnResult::Continue);
    assert!(matches!(engine.history_delta()[0], Event::OrchestrationStarted { started_at_ms: 1_000, .. }));
    assert_eq!(scheduled_ids(engine.history_delta()), vec![1, 2, 3]);
    assert_eq!(engine.pending_actions().len(), 3);
    let items = engine.worker_items();
    assert!(matches!(&items[2], WorkItem::ActivityExecute { sequence_id: 3, input, .. } if input == "C"));
}

#[test]
fn second_batch_starts_only_after_first_resolves() {
    let (_, engine) = turn(&[], vec![], batch_handler(3));
    let history = engine.final_history();

    // Two of three resolved: no new dispatch.
    let (result, engine) = turn(&history, vec![completion(2, "b"), completion(1, "a")], batch_handler(3));
    assert_eq!(result, TurnResult::Continue);
    assert!(engine.pending_actions().is_empty());
    assert!(scheduled_ids(engine.history_delta()).is_empty());
    let history = engine.final_history();

    let (result, engine) = turn(&history, vec![completion(3, "c")], batch_handler(3));
    assert_eq!(result, TurnResult::Continue);
    assert_eq!(scheduled_ids(engine.history_delta()), vec![4, 5]);
    let history = engine.final_history();

    let (result, engine) = turn(&history, vec![completion(5, "e"), completion(4, "d")], batch_handler(3));
    assert_eq!(result, TurnResult::Completed("a, b, c, d, e".to_string()));
    assert!(matches!(engine.history_delta().last(), Some(Event::OrchestrationCompleted { .. })));
    assert!(engine.pending_actions().is_empty());
}

#[test]
fn replaying_a_complete_history_changes_nothing() {
    let mut history = Vec::new();
    let mut messages = Vec::new();
    loop {
        let (result, engine) = turn(&history, std::mem::take(&mut messages), batch_handler(2));
        history = engine.final_history();
        for item in engine.worker_items() {
            if let WorkItem::ActivityExecute { sequence_id, input, .. } = item {
                messages.push(completion(sequence_id, &input.to_lowercase()));
            }
        }
        if result != TurnResult::Continue {
            assert_eq!(result, TurnResult::Completed("a, b, c, d, e".to_string()));
            break;
        }
    }

    let mut engine = ReplayEngine::new("inst", history.clone());
    let again = engine.execute_orchestration(batch_handler(2), "");
    assert_eq!(again, TurnResult::Completed("a, b, c, d, e".to_string()));
    assert!(!engine.made_progress());
    assert!(engine.pending_actions().is_empty());
    assert_eq!(engine.final_history(), history);
}

#[test]
fn duplicate_completions_are_dropped() {
    let (_, engine) = turn(&[], vec![], batch_handler(3));
    let history = engine.final_history();
    let (_, engine) = turn(&history, vec![completion(1, "a"), completion(1, "a-again")], batch_handler(3));
    let history = engine.final_history();
    let resolutions = history.iter().filter(|e| e.is_activity_resolution()).count();
    assert_eq!(resolutions, 1);

    // Redelivered after it was persisted.
    let (result, engine) = turn(&history, vec![completion(1, "late")], batch_handler(3));
    assert_eq!(result, TurnResult::Continue);
    assert!(!engine.made_progress());
}

#[test]
fn completion_without_schedule_is_nondeterminism() {
    let (_, engine) = turn(&[], vec![], batch_handler(3));
    let history = engine.final_history();
    let (result, engine) = turn(&history, vec![completion(9, "ghost")], batch_handler(3));
    match result {
        TurnResult::Failed(ErrorDetails::Configuration { kind, .. }) => {
            assert_eq!(kind, ConfigErrorKind::Nondeterminism)
        }
        other => panic!("expected nondeterminism, got {other:?}"),
    }
    assert!(matches!(engine.history_delta().last(), Some(Event::OrchestrationFailed { .. })));
}

#[test]
fn fatal_activity_failure_aborts_the_turn() {
    let (_, engine) = turn(&[], vec![], batch_handler(3));
    let history = engine.final_history();
    let failure = WorkItem::ActivityFailed {
        instance: "inst".to_string(),
        sequence_id: 1,
        details: ErrorDetails::configuration(ConfigErrorKind::UnregisteredActivity, ACTIVITY, "not registered"),
    };
    let (result, engine) = turn(&history, vec![failure], batch_handler(3));
    assert!(matches!(result, TurnResult::Failed(ErrorDetails::Configuration { .. })));
    // The failure itself is kept for the record, followed by the terminal event.
    assert!(matches!(engine.history_delta()[0], Event::ActivityFailed { sequence_id: 1, .. }));
    assert!(engine.pending_actions().is_empty());
}

#[test]
fn application_failure_is_rendered_inline() {
    let (_, engine) = turn(&[], vec![], batch_handler(5));
    let history = engine.final_history();
    let timeout = WorkItem::ActivityFailed {
        instance: "inst".to_string(),
        sequence_id: 4,
        details: ErrorDetails::Application {
            kind: AppErrorKind::ActivityTimeout,
            message: "exceeded 1s".to_string(),
            retryable: false,
        },
    };
    let messages = vec![
        completion(1, "a"),
        completion(2, "b"),
        completion(3, "c"),
        timeout,
        completion(5, "e"),
    ];
    let (result, _) = turn(&history, messages, batch_handler(5));
    assert_eq!(
        result,
        TurnResult::Completed("a, b, c, Activity failed for D: timed out: exceeded 1s, e".to_string())
    );
}

#[test]
fn termination_stops_the_instance() {
    let (_, engine) = turn(&[], vec![], batch_handler(3));
    let history = engine.final_history();
    let terminate = WorkItem::TerminateInstance {
        instance: "inst".to_string(),
        reason: "operator".to_string(),
    };
    let (result, engine) = turn(&history, vec![completion(1, "a"), terminate], batch_handler(3));
    assert_eq!(result, TurnResult::Terminated("operator".to_string()));
    assert!(engine.pending_actions().is_empty());
    let terminal: Vec<_> = engine.history_delta().iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);

    // Later completions do not reopen it.
    let history = engine.final_history();
    let (result, engine) = turn(&history, vec![completion(2, "b")], batch_handler(3));
    assert_eq!(result, TurnResult::Terminated("operator".to_string()));
    assert!(!engine.made_progress());
}

#[test]
fn changed_orchestrator_code_is_nondeterminism() {
    let (_, engine) = turn(&[], vec![], batch_handler(3));
    let history = engine.final_history();
    let renamed: Arc<dyn OrchestrationHandler> = Arc::new(FnOrchestration(|ctx: &mut OrchestrationContext, _: &str| {
        let h = ctx.schedule_activity("Other", "A")?;
        ctx.join(&[h])?;
        Ok(String::new())
    }));
    let (result, _) = turn(&history, vec![], renamed);
    assert!(matches!(
        result,
        TurnResult::Failed(ErrorDetails::Configuration {
            kind: ConfigErrorKind::Nondeterminism,
            ..
        })
    ));
}

#[test]
fn dropping_recorded_schedules_is_nondeterminism() {
    let (_, engine) = turn(&[], vec![], batch_handler(3));
    let history = engine.final_history();
    let shortcut: Arc<dyn OrchestrationHandler> =
        Arc::new(FnOrchestration(|_ctx: &mut OrchestrationContext, _: &str| Ok("done".to_string())));
    let (result, _) = turn(&history, vec![], shortcut);
    match result {
        TurnResult::Failed(details) => assert!(details.display_message().contains("0 of 3")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn orchestrator_panic_fails_the_instance() {
    let panicking: Arc<dyn OrchestrationHandler> =
        Arc::new(FnOrchestration(|_ctx: &mut OrchestrationContext, _: &str| -> Step<String> { panic!("kaboom") }));
    let (result, engine) = turn(&[], vec![], panicking);
    match result {
        TurnResult::Failed(ErrorDetails::Application { kind, message, .. }) => {
            assert_eq!(kind, AppErrorKind::OrchestrationFailed);
            assert_eq!(message, "kaboom");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(matches!(engine.history_delta().last(), Some(Event::OrchestrationFailed { .. })));
}
