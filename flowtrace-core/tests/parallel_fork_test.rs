//! Forked threads record steps concurrently into one log.

mod common;

use common::*;
use flowtrace_core::interpreter::ThreadId;
use flowtrace_core::telemetry::{MemoryPersistence, SpanRecord, SpanStatus};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

const STEPS_PER_THREAD: usize = 50;

fn spans_named<'a>(spans: &'a [SpanRecord], prefix: &str) -> Vec<&'a SpanRecord> {
    spans.iter().filter(|s| s.name.starts_with(prefix)).collect()
}

#[test]
fn test_forked_threads_parent_to_enclosing_flow_call() {
    let h = Harness::new(Arc::new(MemoryPersistence::new()), Uuid::new_v4());
    let left = ThreadId(1);
    let right = ThreadId(2);

    h.start();
    h.call(MAIN, &flow_call("fanout"), "fanout");
    h.fork(MAIN, left);
    h.fork(MAIN, right);

    thread::scope(|scope| {
        let h = &h;
        scope.spawn(move || {
            for i in 0..STEPS_PER_THREAD {
                h.run(left, &task(&format!("left-{i}")));
            }
            // a nested call on one branch must not re-parent the other
            h.call(left, &flow_call("audit"), "audit");
            h.run(left, &task("audit-entry"));
            h.pop(left);
        });
        scope.spawn(move || {
            for i in 0..STEPS_PER_THREAD {
                h.run(right, &task(&format!("right-{i}")));
            }
        });
    });

    let log = h.collector.flow_steps().unwrap();
    assert_eq!(log.len(), 2 * STEPS_PER_THREAD + 3);
    assert_eq!(log.open_steps().len(), 1);

    h.pop(MAIN);
    h.end();

    let spans = h.exported();
    assert_eq!(spans.len(), 2 * STEPS_PER_THREAD + 4);
    assert!(spans.iter().all(|s| s.status == SpanStatus::Ok));

    let fanout = span(&spans, "Flow call: fanout");
    let audit = span(&spans, "Flow call: audit");
    assert_eq!(fanout.parent_span_id, Some(root(&spans).span_id));
    assert_eq!(audit.parent_span_id, Some(fanout.span_id));
    assert_eq!(span(&spans, "Task: audit-entry").parent_span_id, Some(audit.span_id));

    for prefix in ["Task: left-", "Task: right-"] {
        let branch = spans_named(&spans, prefix);
        assert_eq!(branch.len(), STEPS_PER_THREAD);
        assert!(branch.iter().all(|s| s.parent_span_id == Some(fanout.span_id)));
    }
}

#[test]
fn test_fork_outside_flow_call_parents_to_root() {
    let h = Harness::new(Arc::new(MemoryPersistence::new()), Uuid::new_v4());
    let worker = ThreadId(7);

    h.start();
    h.fork(MAIN, worker);
    assert!(h.collector.tracker().is_empty());

    h.run(worker, &task("background"));
    h.run(MAIN, &task("foreground"));
    h.end();

    let spans = h.exported();
    let root = root(&spans);
    assert_eq!(span(&spans, "Task: background").parent_span_id, Some(root.span_id));
    assert_eq!(span(&spans, "Task: foreground").parent_span_id, Some(root.span_id));
}

#[test]
fn test_fork_snapshot_is_frozen() {
    let h = Harness::new(Arc::new(MemoryPersistence::new()), Uuid::new_v4());
    let worker = ThreadId(3);

    h.start();
    h.call(MAIN, &flow_call("outer"), "outer");
    h.fork(MAIN, worker);

    // the parent moves on into another call after the fork
    h.call(MAIN, &flow_call("inner"), "inner");
    h.run(worker, &task("forked"));
    h.pop(MAIN);
    h.pop(MAIN);
    h.end();

    let spans = h.exported();
    assert_eq!(
        span(&spans, "Task: forked").parent_span_id,
        Some(span(&spans, "Flow call: outer").span_id)
    );
}
