use control_mapper::trace::TraceOutcome;
use control_mapper::validator::RejectionReason;
use control_mapper::{BatchTrace, JsonlTraceSink, TraceSink};
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct TraceRow {
    batch_index: usize,
    requirement_ids: Vec<String>,
    tier: Option<String>,
    attempt: usize,
    cached: bool,
    outcome: String,
    reasons: Vec<String>,
}

#[test]
fn jsonl_trace_sink_writes_events_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    sink.record(
        BatchTrace::new(0, vec!["1.1".into(), "1.2".into()], "k0", 3, TraceOutcome::Rejected)
            .tier("tier/cheap")
            .reasons(&[RejectionReason::UnknownExistingFunction {
                requirement_id: "1.2".into(),
                name: "iam_made_up_check".into(),
            }]),
    )
    .unwrap();
    sink.record(
        BatchTrace::new(0, vec!["1.1".into(), "1.2".into()], "k0", 3, TraceOutcome::Accepted)
            .tier("tier/strong")
            .attempt(1),
    )
    .unwrap();
    sink.record(BatchTrace::new(1, vec!["1.3".into()], "k1", 3, TraceOutcome::Accepted).cached())
        .unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<TraceRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 3);

    assert_eq!(rows[0].outcome, "rejected");
    assert_eq!(rows[0].requirement_ids, vec!["1.1", "1.2"]);
    assert_eq!(rows[0].reasons.len(), 1);
    assert!(rows[0].reasons[0].contains("iam_made_up_check"));

    assert_eq!(rows[1].tier.as_deref(), Some("tier/strong"));
    assert_eq!(rows[1].attempt, 1);

    assert_eq!(rows[2].batch_index, 1);
    assert!(rows[2].cached);
    assert!(rows[2].tier.is_none());
}
