//! Evaluation driver tests: stepping, breakpoints, exceptions, inspection.

use pretty_assertions::assert_eq;

use kiln_dap::protocol::StoppedEventBody;
use kiln_dap::StepKind;

use super::*;

async fn stopped(fx: &mut ThreadFixture) -> StoppedEventBody {
    let event = wait_event(&mut fx.events, "stopped").await;
    body_of(&event)
}

#[tokio::test]
async fn test_step_over_advances_one_operation() {
    let (def, a, _b) = linear_build();
    let mut fx = start_thread(def, true);

    // stopOnEntry pauses at the head before anything is solved.
    let body = stopped(&mut fx).await;
    assert_eq!(body.reason, "step");
    assert_eq!(body.thread_id, 1);
    let stack = fx.thread.stack_trace();
    assert_eq!(stack[0].line, 2);
    assert_eq!(stack[0].name, "RUN make");
    assert!(fx.engine.solved_heads().is_empty());

    // Step-Over issues one solve for the parent and pauses there.
    assert!(fx.thread.resume(StepKind::Next).await);
    wait_event(&mut fx.events, "continued").await;
    let body = stopped(&mut fx).await;
    assert_eq!(body.reason, "step");
    assert_eq!(fx.thread.stack_trace()[0].line, 1);
    assert_eq!(fx.engine.solved_heads(), vec![a]);

    // Stepping off the end finishes the thread; the pause's result handle
    // was released on resume.
    assert!(fx.thread.resume(StepKind::Next).await);
    fx.task.await.unwrap();
    assert!(fx.thread.stack_trace().is_empty());
    assert!(fx.engine.released.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_launch_without_stop_runs_to_completion() {
    let (def, _a, b) = linear_build();
    let mut fx = start_thread(def, false);

    fx.task.await.unwrap();
    assert_eq!(fx.engine.solved_heads(), vec![b]);
    while let Ok(event) = fx.events.try_recv() {
        assert_ne!(event.event, "stopped");
    }
}

#[tokio::test]
async fn test_breakpoint_pauses_continue() {
    let (def, a, b) = linear_build();
    let engine = MockEngine::new();
    let mut fx = start_thread_with(engine, def, false, &[sbp(1, 5)]);

    let body = stopped(&mut fx).await;
    assert_eq!(body.reason, "breakpoint");
    assert_eq!(body.hit_breakpoint_ids, vec![1]);
    assert_eq!(fx.thread.stack_trace()[0].line, 1);
    assert_eq!(fx.engine.solved_heads(), vec![a]);

    assert!(fx.thread.resume(StepKind::Continue).await);
    fx.task.await.unwrap();
    assert_eq!(fx.engine.solved_heads().last(), Some(&b));
}

#[tokio::test]
async fn test_breakpoints_set_while_paused_apply_on_continue() {
    let (def, a, _b) = linear_build();
    let mut fx = start_thread(def, true);
    let body = stopped(&mut fx).await;
    assert_eq!(body.reason, "step");

    // The client re-sends breakpoints mid-pause; they arm on the next
    // continue.
    fx.breakpoints.set(BUILDFILE, &[sbp(1, 5)]);
    assert!(fx.thread.resume(StepKind::Continue).await);
    let body = stopped(&mut fx).await;
    assert_eq!(body.reason, "breakpoint");
    assert_eq!(fx.thread.stack_trace()[0].line, 1);
    assert_eq!(fx.engine.solved_heads(), vec![a]);

    fx.thread.resume(StepKind::Continue).await;
    fx.task.await.unwrap();
}

#[tokio::test]
async fn test_solve_error_parks_at_failing_step() {
    let (def, _a, b) = linear_build();
    let engine = MockEngine::new();
    engine.fail_at(&Op::generic(vec![]));
    let mut fx = start_thread_with(engine, def, false, &[]);

    let body = stopped(&mut fx).await;
    assert_eq!(body.reason, "exception");
    assert!(body.description.unwrap().contains("process exited"));
    let stack = fx.thread.stack_trace();
    assert!(!stack.is_empty());
    assert_eq!(stack[0].line, 1);

    // Continue re-solves and re-raises the same exception.
    assert!(fx.thread.resume(StepKind::Continue).await);
    let body = stopped(&mut fx).await;
    assert_eq!(body.reason, "exception");
    assert_eq!(fx.engine.solved_heads(), vec![b.clone(), b]);

    // Step-Out from the failing base step runs off the end.
    assert!(fx.thread.resume(StepKind::StepOut).await);
    fx.task.await.unwrap();
}

#[tokio::test]
async fn test_step_in_and_out_of_a_stage() {
    let (def, _a, _s, _c) = staged_build();
    let mut fx = start_thread(def, true);

    let body = stopped(&mut fx).await;
    assert_eq!(body.reason, "step");
    assert_eq!(fx.thread.stack_trace()[0].line, 4);

    // Step-In descends into the stage; the stack nests.
    fx.thread.resume(StepKind::StepIn).await;
    let body = stopped(&mut fx).await;
    assert_eq!(body.reason, "step");
    let stack = fx.thread.stack_trace();
    assert_eq!(stack.len(), 2);
    assert_eq!(stack[0].line, 3);
    assert_eq!(stack[1].line, 4);

    // Step-Over at the stage's last op pauses at the return point, which
    // shares the op's location but solves nothing.
    let solves = fx.engine.solved_heads().len();
    fx.thread.resume(StepKind::Next).await;
    let body = stopped(&mut fx).await;
    assert_eq!(body.reason, "step");
    assert_eq!(fx.thread.stack_trace()[0].line, 3);
    assert_eq!(fx.engine.solved_heads().len(), solves);

    // Step-Out from the return point rejoins the parent chain.
    fx.thread.resume(StepKind::StepOut).await;
    let body = stopped(&mut fx).await;
    assert_eq!(body.reason, "step");
    let stack = fx.thread.stack_trace();
    assert_eq!(stack.len(), 1);
    assert_eq!(stack[0].line, 1);

    fx.thread.resume(StepKind::Continue).await;
    fx.task.await.unwrap();
}

#[tokio::test]
async fn test_scopes_and_variables_while_paused() {
    let (def, _a, _b) = linear_build();
    let mut fx = start_thread(def, true);
    stopped(&mut fx).await;

    let frame_id = fx.thread.stack_trace()[0].id;
    let scopes = fx.thread.scopes(frame_id).unwrap();
    let names: Vec<&str> = scopes.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["Arguments", "Mounts"]);

    // Scopes are cached; variables are memoised per reference.
    let again = fx.thread.scopes(frame_id).unwrap();
    assert_eq!(scopes, again);

    let args = fx.thread.variables(scopes[0].variables_reference);
    let args_again = fx.thread.variables(scopes[0].variables_reference);
    assert_eq!(args, args_again);

    let find = |name: &str| {
        args.iter()
            .find(|v| v.name == name)
            .unwrap_or_else(|| panic!("missing variable {name}"))
            .value
            .clone()
    };
    assert_eq!(find("args"), "/bin/sh -c make");
    assert_eq!(find("PATH"), "/usr/bin");
    assert_eq!(find("workdir"), "/src");

    let mounts = fx.thread.variables(scopes[1].variables_reference);
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].name, "/");

    assert!(fx.thread.scopes(9999).is_err());

    fx.thread.resume(StepKind::Continue).await;
    fx.task.await.unwrap();

    // Not paused: scopes are empty, stale references resolve to nothing.
    assert!(fx.thread.scopes(frame_id).unwrap().is_empty());
    assert!(fx.thread.variables(scopes[0].variables_reference).is_empty());
}

#[tokio::test]
async fn test_cancellation_releases_the_pause() {
    let (def, _a, _b) = linear_build();
    let mut fx = start_thread(def, true);
    stopped(&mut fx).await;

    fx.thread.cancel();
    fx.task.await.unwrap();
    assert!(fx.thread.stack_trace().is_empty());
}

#[tokio::test]
async fn test_sources_published_on_run() {
    let (def, _a, _b) = linear_build();
    let mut fx = start_thread(def, true);
    let event = wait_event(&mut fx.events, "loadedSource").await;
    let body: kiln_dap::protocol::LoadedSourceEventBody = body_of(&event);
    assert_eq!(body.reason, "new");
    assert_eq!(body.source.path.as_deref(), Some(BUILDFILE));

    stopped(&mut fx).await;
    fx.thread.cancel();
    fx.task.await.unwrap();
}
