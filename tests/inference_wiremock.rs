use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use control_mapper::gateway::openrouter::OpenRouterAdapter;
use control_mapper::gateway::{GatewayConfig, NoopUsageSink, ProviderGateway};
use control_mapper::{
    map_requirements, AssessmentKind, BatchRequest, Catalog, Coverage, EscalationConfig,
    GatewayInferenceClient, InferenceClient, InferenceError, MapperConfig, ModelTier, Requirement,
    RunOptions, SharedCatalog,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const CHEAP: &str = "anthropic/claude-3-5-haiku";
const STRONG: &str = "anthropic/claude-3-5-sonnet";

fn client(server: &MockServer) -> GatewayInferenceClient<ProviderGateway<NoopUsageSink>> {
    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let gateway = ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 0,
            retry_base_delay: Duration::from_millis(0),
        },
    );
    GatewayInferenceClient::new(Arc::new(gateway))
}

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 500, "completion_tokens": 120 }
    }))
}

fn config() -> MapperConfig {
    MapperConfig {
        escalation: EscalationConfig {
            tiers: vec![ModelTier::new(CHEAP), ModelTier::new(STRONG)],
            retry_base_delay_ms: 0,
            retry_max_delay_ms: 0,
            ..EscalationConfig::default()
        },
        ..MapperConfig::default()
    }
}

fn requirements() -> Vec<Requirement> {
    vec![
        Requirement::new("A.1", "Maintain current contact details", AssessmentKind::Manual),
        Requirement::new("A.2", "Ensure the resource requirement holds", AssessmentKind::Automated),
    ]
}

const FENCED_ANSWER: &str = "Here you go:\n```json\n[\n  {\"requirement_id\": \"A.1\", \"existing_functions\": [], \"coverage\": \"manual_only\", \"new_functions\": [], \"notes\": \"process control\"},\n  {\"requirement_id\": \"A.2\", \"existing_functions\": [\"svc_res_req\"], \"coverage\": 9, \"new_functions\": [], \"notes\": \"\"}\n]\n```";

#[tokio::test]
async fn gateway_client_strips_fences_and_returns_payloads_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": CHEAP })))
        .respond_with(completion(FENCED_ANSWER))
        .mount(&server)
        .await;

    let request = BatchRequest {
        requirements: requirements(),
        catalog_names: vec!["svc_res_req".to_string()],
    };
    let response = client(&server)
        .map(&request, &ModelTier::new(CHEAP))
        .await
        .unwrap();

    assert_eq!(response.payloads.len(), 2);
    assert_eq!(response.payloads[0]["requirement_id"], "A.1");
    assert_eq!(response.payloads[1]["coverage"], 9);
}

#[tokio::test]
async fn gateway_client_reports_prose_only_answers_as_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(completion("These requirements look fine to me."))
        .mount(&server)
        .await;

    let request = BatchRequest {
        requirements: requirements(),
        catalog_names: Vec::new(),
    };
    let err = client(&server)
        .map(&request, &ModelTier::new(CHEAP))
        .await
        .unwrap_err();
    assert!(matches!(err, InferenceError::Malformed(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn full_run_over_http_maps_both_requirements() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(completion(FENCED_ANSWER))
        .mount(&server)
        .await;

    let catalog = SharedCatalog::new(Catalog::from_names(["svc_res_req"]).unwrap());
    let run = map_requirements(
        &client(&server),
        &catalog,
        &requirements(),
        &config(),
        RunOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(run.results.len(), 2);
    assert_eq!(run.results[0].coverage_score, Coverage::ManualOnly);
    assert!(!run.results[0].needs_review);
    assert_eq!(run.results[1].mapped_existing, vec!["svc_res_req"]);
    assert_eq!(run.results[1].coverage_score, Coverage::Score(9));
    assert_eq!(run.summary.inference_calls, 1);
    assert_eq!(catalog.snapshot().len(), 1);
}

struct Sequence {
    calls: Arc<AtomicUsize>,
    responses: Vec<ResponseTemplate>,
}

impl Respond for Sequence {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses[n.min(self.responses.len() - 1)].clone()
    }
}

#[tokio::test]
async fn transport_failures_are_retried_by_the_dispatcher_on_the_same_tier() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": CHEAP })))
        .respond_with(Sequence {
            calls: calls.clone(),
            responses: vec![
                ResponseTemplate::new(503).set_body_json(json!({
                    "error": { "message": "overloaded", "code": "unavailable" }
                })),
                completion(FENCED_ANSWER),
            ],
        })
        .mount(&server)
        .await;

    let catalog = SharedCatalog::new(Catalog::from_names(["svc_res_req"]).unwrap());
    let run = map_requirements(
        &client(&server),
        &catalog,
        &requirements(),
        &config(),
        RunOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(run.summary.inference_calls, 2);
    assert_eq!(run.summary.escalations, 0);
    assert!(run.results.iter().all(|r| !r.needs_review));
}
