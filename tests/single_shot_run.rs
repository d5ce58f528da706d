//! End-to-end runs through the single-shot driver.

mod helpers;

use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use helpers::{builder, workflow, FakeEngine, RunLinkProvisioner, SlowUrlProvisioner};
use runwarden::lifecycle::{terminal_signal, NewRun, OutputCollector, OutputProvisioningHandler};
use runwarden::priority::PrometheusPriority;
use runwarden::resource::{AlertInhibitor, InhibitReport, MaxInFlight};
use runwarden::signal::{AlertmanagerSource, PrometheusVectorSource, SignalCache};
use runwarden::single_shot::run_with_handlers;
use runwarden::{
    run_once, ActiveOperation, ActiveRun, ExternalId, NoTransaction, OperationStatus, Phase,
    Processor, ProvisionedOutput, RunFailure, RunRequest, RunStore, SingleShotStore, Target,
    TargetBuilder, Terminal,
};

const TTL: Duration = Duration::from_secs(30);
const TIMEOUT: Duration = Duration::from_secs(5);

fn hello() -> Arc<runwarden::WorkflowDefinition> {
    workflow(json!({
        "name": "hello",
        "version": "1.0",
        "source": "echo hello",
        "parameters": [{"name": "name", "type": "string"}],
        "outputs": [{"name": "result", "type": "url"}]
    }))
}

fn hello_request() -> RunRequest {
    RunRequest::new(
        json!({"name": "world"}),
        json!({"result": {"externalIds": [{"provider": "lims", "id": "S1"}]}}),
        Value::Null,
    )
}

fn hello_engine() -> FakeEngine {
    FakeEngine::producing(json!({"result": "https://example.org/hello"}))
}

async fn build(builder: TargetBuilder) -> Arc<Target> {
    Arc::new(builder.build().await.unwrap())
}

fn processor(target: Arc<Target>) -> Processor<SingleShotStore> {
    let handler: Arc<dyn OutputProvisioningHandler<NoTransaction>> = Arc::new(OutputCollector::new());
    Processor::new(target, Arc::new(SingleShotStore::new(handler)))
}

#[tokio::test]
async fn test_url_output_is_provisioned_once() {
    let engine = Arc::new(hello_engine());
    let target = build(builder(engine.clone())).await;

    let records = run_once(target, hello(), hello_request()).await.unwrap();

    assert_eq!(
        records,
        vec![ProvisionedOutput::Url {
            external_ids: BTreeSet::from([ExternalId::new("lims", "S1")]),
            url: "https://example.org/hello".into(),
            labels: Default::default(),
        }]
    );
    assert_eq!(engine.run_count(), 1);
    assert_eq!(engine.inputs.lock().unwrap()[0], json!({"name": "world"}));
}

#[tokio::test]
async fn test_missing_argument_is_rejected_before_any_run() {
    let engine = Arc::new(hello_engine());
    let target = build(builder(engine.clone())).await;
    let mut request = hello_request();
    request.arguments = json!({});

    let failure = run_once(target, hello(), request).await.unwrap_err();

    match &failure {
        RunFailure::BadArguments(violations) => {
            assert!(violations.iter().any(|v| v.contains("'name'")), "{violations:?}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(failure.exit_code(), 2);
    assert_eq!(engine.run_count(), 0);
}

fn align() -> Arc<runwarden::WorkflowDefinition> {
    workflow(json!({
        "name": "align",
        "version": "2.0",
        "parameters": [{"name": "reads", "type": "list", "of": {"type": "file"}}],
        "outputs": [{"name": "report", "type": "url"}]
    }))
}

fn align_request(paths: &[&str]) -> RunRequest {
    let reads: Vec<Value> = paths
        .iter()
        .enumerate()
        .map(|(i, p)| json!({"externalIds": [{"provider": "lims", "id": format!("S{i}")}], "path": p}))
        .collect();
    RunRequest::new(json!({"reads": reads}), json!({"report": {}}), Value::Null)
}

#[tokio::test]
async fn test_inputs_are_provisioned_before_the_engine_runs() {
    let engine = Arc::new(FakeEngine::producing(json!({"report": "https://example.org/r"})));
    let target = build(builder(engine.clone())).await;

    let records = run_once(target, align(), align_request(&["/data/r1.fq", "/data/r2.fq"]))
        .await
        .unwrap();

    assert_eq!(
        engine.inputs.lock().unwrap()[0],
        json!({"reads": ["/staged/data/r1.fq", "/staged/data/r2.fq"]})
    );
    // Without explicit external ids the output carries every id the inputs required.
    assert_eq!(
        records[0].external_ids(),
        &BTreeSet::from([ExternalId::new("lims", "S0"), ExternalId::new("lims", "S1")])
    );
}

#[tokio::test]
async fn test_preflight_failure_fails_the_run_without_running_it() {
    let engine = Arc::new(FakeEngine::producing(json!({"report": "https://example.org/r"})));
    let target = build(builder(engine.clone())).await;

    let failure = run_once(target, align(), align_request(&["/data/r1.fq", "/missing/r2.fq"]))
        .await
        .unwrap_err();

    assert_eq!(failure, RunFailure::Failed);
    assert_eq!(engine.run_count(), 0);
}

#[tokio::test]
async fn test_engine_failure_is_recorded_against_its_operation() {
    let engine = Arc::new(hello_engine().failing());
    let target = build(builder(engine.clone())).await;

    let handle = processor(target).submit(hello(), hello_request()).await.unwrap();
    let run = handle.run().clone();
    assert_eq!(handle.wait().await, Terminal::Failed);

    assert_eq!(run.phase(), Phase::Failed);
    let debug = run.debug_log(0);
    assert_eq!(debug.len(), 1);
    assert!(debug[0]["error"].as_str().unwrap().contains("status 3"));
}

#[tokio::test]
async fn test_engine_panic_is_an_internal_fault() {
    let engine = Arc::new(hello_engine().panicking());
    let target = build(builder(engine.clone())).await;

    let failure = run_once(target, hello(), hello_request()).await.unwrap_err();

    match &failure {
        RunFailure::InternalFault(reason) => assert!(reason.contains("engine bug"), "{reason}"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(failure.exit_code(), 4);
    assert_eq!(engine.run_count(), 1);
}

#[tokio::test]
async fn test_faulted_run_never_succeeds() {
    let engine = Arc::new(hello_engine().panicking());
    let slots = Arc::new(MaxInFlight::new(1));
    let target = build(builder(engine).resource("slots", slots.clone())).await;

    let handle = processor(target).submit(hello(), hello_request()).await.unwrap();
    let run = handle.run().clone();

    assert!(matches!(handle.wait().await, Terminal::Fault(_)));
    assert_eq!(run.phase(), Phase::Failed);
    assert_eq!(slots.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_last_concurrent_output_failure_fails_the_run() {
    let engine = Arc::new(FakeEngine::producing(json!({
        "a": "https://example.org/a",
        "b": "https://example.org/b",
        "c": "https://example.org/c",
        "d": "https://example.org/d"
    })));
    let provisioner = Arc::new(
        SlowUrlProvisioner::default()
            .delay("a", Duration::from_millis(10))
            .delay("b", Duration::from_millis(20))
            .delay("c", Duration::from_millis(30))
            .delay("d", Duration::from_millis(40))
            .fail("d"),
    );
    let target = build(TargetBuilder::new(engine).output_provisioner(provisioner.clone())).await;
    let definition = workflow(json!({
        "name": "fanout",
        "version": "1",
        "outputs": [
            {"name": "a", "type": "url"},
            {"name": "b", "type": "url"},
            {"name": "c", "type": "url"},
            {"name": "d", "type": "url"}
        ]
    }));
    let request = RunRequest::new(
        Value::Null,
        json!({"a": {}, "b": {}, "c": {}, "d": {}}),
        Value::Null,
    );
    let collector = Arc::new(OutputCollector::new());
    let handler: Arc<dyn OutputProvisioningHandler<NoTransaction>> = collector.clone();

    let failure = run_with_handlers(target, definition, request, vec![handler])
        .await
        .unwrap_err();

    assert_eq!(failure, RunFailure::Failed);
    assert_eq!(*provisioner.finished.lock().unwrap(), vec!["a", "b", "c", "d"]);
    // Nothing is handed out unless every output of the generation succeeded.
    assert!(collector.records().is_empty());
}

#[tokio::test]
async fn test_runtime_provisioner_and_cleanup() {
    let engine = Arc::new(
        hello_engine()
            .with_run_url("https://engine.example.org/runs/7")
            .with_cleanup(json!({"scratch": "/tmp/run-7"})),
    );
    let target = build(builder(engine.clone()).runtime_provisioner(Arc::new(RunLinkProvisioner))).await;

    let records = run_once(target, hello(), hello_request()).await.unwrap();

    assert_eq!(records.len(), 2);
    match &records[1] {
        ProvisionedOutput::Url { url, labels, .. } => {
            assert_eq!(url, "https://engine.example.org/runs/7");
            assert_eq!(labels["kind"], "run-link");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(*engine.cleanups.lock().unwrap(), vec![json!({"scratch": "/tmp/run-7"})]);
}

#[tokio::test]
async fn test_max_in_flight_denies_then_releases() {
    let engine = Arc::new(hello_engine().with_delay(Duration::from_millis(200)));
    let slots = Arc::new(MaxInFlight::new(1));
    let target = build(builder(engine.clone()).resource("slots", slots.clone())).await;
    let processor = processor(target);

    let first = processor.submit(hello(), hello_request()).await.unwrap();
    assert_eq!(slots.in_flight(), 1);

    match processor.submit(hello(), hello_request()).await {
        Err(runwarden::SubmitError::Denied(reasons)) => {
            assert_eq!(reasons, vec!["1 runs already in flight (limit 1)".to_string()]);
        }
        Err(other) => panic!("unexpected {other:?}"),
        Ok(_) => panic!("second run should have been denied"),
    }

    assert_eq!(first.wait().await, Terminal::Succeeded);
    assert_eq!(slots.in_flight(), 0);

    let third = processor.run(hello(), hello_request()).await.unwrap();
    assert_eq!(third, Terminal::Succeeded);
    assert_eq!(slots.in_flight(), 0);
    assert_eq!(engine.run_count(), 2);
}

async fn alertmanager(alerts: Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/alerts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "data": alerts
        })))
        .mount(&server)
        .await;
    server
}

fn inhibitor(server: &MockServer, labels: &[&str], report: InhibitReport) -> Arc<AlertInhibitor> {
    let base = Url::parse(&server.uri()).unwrap();
    let source = AlertmanagerSource::new(reqwest::Client::new(), &base).unwrap();
    Arc::new(AlertInhibitor::new(
        SignalCache::new(source, TTL, TIMEOUT),
        "AutoInhibit",
        "prod",
        labels.iter().map(|l| l.to_string()).collect(),
        Vec::new(),
        report,
    ))
}

#[tokio::test]
async fn test_denial_reasons_are_unioned_across_resources() {
    let server = alertmanager(json!([
        {"labels": {"alertname": "AutoInhibit", "environment": "prod", "job": "hello", "project": "HELLO_1_0"}},
        {"labels": {"alertname": "AutoInhibit", "environment": "prod", "job": "hello"}},
        {"labels": {"alertname": "AutoInhibit", "environment": "staging", "team": "hello"}},
        {"labels": {"alertname": "DiskFull", "job": "hello"}}
    ]))
    .await;
    let engine = Arc::new(hello_engine());
    let slots = Arc::new(MaxInFlight::new(4));
    let target = build(
        builder(engine.clone())
            .resource("a-label", inhibitor(&server, &["job", "project"], InhibitReport::Label))
            .resource("b-target", inhibitor(&server, &["job", "team"], InhibitReport::Target))
            .resource("c-slots", slots.clone()),
    )
    .await;

    let failure = run_once(target, hello(), hello_request()).await.unwrap_err();

    assert_eq!(
        failure,
        RunFailure::Denied(vec!["job".into(), "project".into(), "hello".into()])
    );
    assert_eq!(failure.exit_code(), 3);
    assert_eq!(engine.run_count(), 0);
    // The slot granted before the denial was handed back.
    assert_eq!(slots.in_flight(), 0);
}

#[tokio::test]
async fn test_quiet_alertmanager_admits_the_run() {
    let server = alertmanager(json!([
        {"labels": {"alertname": "AutoInhibit", "environment": "prod", "job": "other"}}
    ]))
    .await;
    let engine = Arc::new(hello_engine());
    let target = build(
        builder(engine.clone()).resource("pause", inhibitor(&server, &["job"], InhibitReport::Label)),
    )
    .await;

    assert!(run_once(target, hello(), hello_request()).await.is_ok());
    assert_eq!(engine.run_count(), 1);
}

#[tokio::test]
async fn test_priority_comes_from_prometheus() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/query"))
        .and(body_string_contains("query=workflow_priority"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"workflow": "other"}, "value": [1700000000.0, "99"]},
                    {"metric": {"workflow": "hello"}, "value": [1700000000.0, "42.7"]}
                ]
            }
        })))
        .mount(&server)
        .await;
    let base = Url::parse(&server.uri()).unwrap();
    let source = PrometheusVectorSource::new(reqwest::Client::new(), &base, "workflow_priority").unwrap();
    let scorer = PrometheusPriority::new(
        SignalCache::new(source, TTL, TIMEOUT),
        5,
        Some("workflow".into()),
        None,
    );
    let target = build(builder(Arc::new(hello_engine())).priority(Arc::new(scorer))).await;

    let handle = processor(target).submit(hello(), hello_request()).await.unwrap();

    assert_eq!(handle.run().priority(), 42);
    assert_eq!(handle.wait().await, Terminal::Succeeded);
}

#[tokio::test]
async fn test_priority_falls_back_when_prometheus_is_down() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let base = Url::parse(&server.uri()).unwrap();
    let source = PrometheusVectorSource::new(reqwest::Client::new(), &base, "workflow_priority").unwrap();
    let scorer = PrometheusPriority::new(SignalCache::new(source, TTL, TIMEOUT), 5, None, None);
    let target = build(builder(Arc::new(hello_engine())).priority(Arc::new(scorer))).await;

    let handle = processor(target).submit(hello(), hello_request()).await.unwrap();

    assert_eq!(handle.run().priority(), 5);
    assert_eq!(handle.wait().await, Terminal::Succeeded);
}

#[tokio::test]
async fn test_resume_reattaches_to_a_live_engine_operation() {
    let engine = Arc::new(hello_engine());
    let slots = Arc::new(MaxInFlight::new(1));
    let target = build(builder(engine.clone()).resource("slots", slots.clone())).await;
    let collector = Arc::new(OutputCollector::new());
    let store = Arc::new(SingleShotStore::new(collector.clone()));

    // A run left in RUNNING by a previous driver, its engine step still going.
    let (signal, waiter) = terminal_signal();
    let mut tx = NoTransaction;
    let run = store
        .create_run(
            NewRun {
                id: "run-resumed".into(),
                workflow: hello(),
                request: hello_request(),
                created: chrono::Utc::now(),
                priority: 0,
            },
            signal,
            &mut tx,
        )
        .unwrap();
    run.set_input_ids(BTreeSet::new(), BTreeSet::new(), &mut tx).unwrap();
    run.set_real_input(json!({"name": "world"}), &mut tx).unwrap();
    run.set_extra_input_ids_handled(&mut tx);
    let operations = run
        .transition(
            Phase::Running,
            vec![json!({"slot": null, "progress": {"jobId": "j-17"}})],
            &mut tx,
        )
        .unwrap();
    operations[0].set_type("engine:fake", &mut tx).unwrap();
    operations[0].set_status(OperationStatus::Running, &mut tx).unwrap();

    let processor = Processor::new(target, store);
    let terminal = processor.resume(run.clone(), waiter).await.wait().await;

    assert_eq!(terminal, Terminal::Succeeded);
    assert_eq!(engine.run_count(), 0);
    assert_eq!(*engine.recovered.lock().unwrap(), vec![json!({"jobId": "j-17"})]);
    assert_eq!(collector.records().len(), 1);
    assert_eq!(operations[0].op_type().as_deref(), Some("engine:fake"));
    assert_eq!(slots.in_flight(), 0);
}
