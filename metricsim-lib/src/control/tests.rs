use rama::http::{Body, BodyExtractExt as _};
use rand::{SeedableRng as _, rngs::SmallRng};

use super::*;
use crate::{
    instance::{Instance, InstanceDefaults},
    metrics::{Outcome, SummaryConfig},
    simulation::{SimulationMode, Simulator, Tunables},
};

fn new_service() -> ControlService {
    new_service_with_sink().0
}

fn new_service_with_sink() -> (ControlService, Arc<MetricsSink>) {
    let state = SimulationState::new(
        SimulationMode::Instances,
        InstanceDefaults {
            latency_min_ms: 100,
            latency_max_ms: 300,
        },
        Tunables::default(),
    );
    let sink = Arc::new(MetricsSink::try_new(SummaryConfig::default()).unwrap());
    let svc = ControlService::try_new(state, sink.clone()).unwrap();
    (svc, sink)
}

async fn call(svc: &ControlService, method: Method, path: &str, body: Option<&str>) -> Response {
    let body = match body {
        Some(body) => Body::from(body.to_owned()),
        None => Body::empty(),
    };
    let req = Request::builder()
        .method(method)
        .uri(path)
        .body(body)
        .unwrap();
    svc.serve(req).await.unwrap()
}

async fn call_ok_text(svc: &ControlService, method: Method, path: &str) -> String {
    let resp = call(svc, method, path, None).await;
    assert_eq!(StatusCode::OK, resp.status(), "path: {path}");
    resp.try_into_string().await.unwrap()
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_index_and_ping() {
    let svc = new_service();

    let payload = call_ok_text(&svc, Method::GET, "/").await;
    assert!(payload.contains("metricsim"));

    assert_eq!("pong", call_ok_text(&svc, Method::GET, "/ping").await);

    let resp = call(&svc, Method::POST, "/ping", None).await;
    assert_eq!(StatusCode::METHOD_NOT_ALLOWED, resp.status());

    let resp = call(&svc, Method::GET, "/nope", None).await;
    assert_eq!(StatusCode::NOT_FOUND, resp.status());
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_instance_lifecycle() {
    let svc = new_service();

    let resp = call(
        &svc,
        Method::POST,
        "/instance/A",
        Some(r##"{"error_pct": 5, "latency_max_ms": 50}"##),
    )
    .await;
    assert_eq!(StatusCode::CREATED, resp.status());
    let created: Instance = serde_json::from_str(&resp.try_into_string().await.unwrap()).unwrap();
    let expected = Instance {
        error_pct: Some(5),
        latency_min_ms: 100,
        latency_max_ms: 50,
        latency_offset_ms: None,
    };
    assert_eq!(expected, created);
    assert_eq!(Some(expected), svc.state.registry().get("A"));

    let payload = call_ok_text(&svc, Method::GET, "/instance/A").await;
    assert_eq!(expected, serde_json::from_str::<Instance>(&payload).unwrap());

    // update replaces the full record
    let resp = call(
        &svc,
        Method::PUT,
        "/instance/A",
        Some(r##"{"latency_offset_ms": -20}"##),
    )
    .await;
    assert_eq!(StatusCode::OK, resp.status());
    assert_eq!(
        Some(Instance {
            error_pct: None,
            latency_min_ms: 100,
            latency_max_ms: 300,
            latency_offset_ms: Some(-20),
        }),
        svc.state.registry().get("A")
    );

    let resp = call(&svc, Method::DELETE, "/instance/A", None).await;
    assert_eq!(StatusCode::NO_CONTENT, resp.status());
    assert!(svc.state.registry().is_empty());

    let resp = call(&svc, Method::GET, "/instance/A", None).await;
    assert_eq!(StatusCode::NOT_FOUND, resp.status());
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_instance_rejections_leave_registry_untouched() {
    let svc = new_service();
    let original = r##"{"error_pct": 1, "latency_min_ms": 1, "latency_max_ms": 2}"##;
    let resp = call(&svc, Method::POST, "/instance/A", Some(original)).await;
    assert_eq!(StatusCode::CREATED, resp.status());
    let original = svc.state.registry().get("A").unwrap();

    for (method, path, body, expected_status) in [
        (Method::POST, "/instance/A", Some("{}"), StatusCode::CONFLICT),
        (Method::PUT, "/instance/B", Some("{}"), StatusCode::NOT_FOUND),
        (Method::DELETE, "/instance/B", None, StatusCode::NOT_FOUND),
        (Method::POST, "/instance/C", None, StatusCode::BAD_REQUEST),
        (Method::POST, "/instance/C", Some("not json"), StatusCode::BAD_REQUEST),
        (
            Method::PUT,
            "/instance/A",
            Some(r##"{"error_pct": "x"}"##),
            StatusCode::BAD_REQUEST,
        ),
        (Method::POST, "/instance/", Some("{}"), StatusCode::BAD_REQUEST),
        (
            Method::PATCH,
            "/instance/A",
            Some("{}"),
            StatusCode::METHOD_NOT_ALLOWED,
        ),
    ] {
        let resp = call(&svc, method.clone(), path, body).await;
        assert_eq!(expected_status, resp.status(), "{method} {path} {body:?}");
    }

    let snapshot = svc.state.registry().snapshot();
    assert_eq!(1, snapshot.len());
    assert_eq!(Some(&original), snapshot.get("A"));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_list_instances() {
    let svc = new_service();
    for name in ["B", "A"] {
        let resp = call(&svc, Method::POST, &format!("/instance/{name}"), Some("{}")).await;
        assert_eq!(StatusCode::CREATED, resp.status());
    }

    let payload = call_ok_text(&svc, Method::GET, "/instances").await;
    let instances: std::collections::BTreeMap<String, Instance> =
        serde_json::from_str(&payload).unwrap();
    assert_eq!(
        vec!["A", "B"],
        instances.keys().map(String::as_str).collect::<Vec<_>>()
    );
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_tunables() {
    let svc = new_service();

    let payload = call_ok_text(&svc, Method::GET, "/error_rate").await;
    assert_eq!(
        json!({ "error_pct": 1 }),
        serde_json::from_str::<serde_json::Value>(&payload).unwrap()
    );

    call_ok_text(&svc, Method::PUT, "/error_rate/25").await;
    call_ok_text(&svc, Method::POST, "/latency_offset/-40").await;
    assert_eq!(
        Tunables {
            error_pct: 25,
            latency_offset_ms: -40,
        },
        svc.state.tunables()
    );

    let payload = call_ok_text(&svc, Method::GET, "/latency_offset").await;
    assert_eq!(
        json!({ "latency_offset_ms": -40 }),
        serde_json::from_str::<serde_json::Value>(&payload).unwrap()
    );

    for path in ["/error_rate/abc", "/error_rate/", "/latency_offset/1.5"] {
        let resp = call(&svc, Method::PUT, path, None).await;
        assert_eq!(StatusCode::BAD_REQUEST, resp.status(), "path: {path}");
    }
    let resp = call(&svc, Method::DELETE, "/error_rate/5", None).await;
    assert_eq!(StatusCode::METHOD_NOT_ALLOWED, resp.status());

    assert_eq!(
        Tunables {
            error_pct: 25,
            latency_offset_ms: -40,
        },
        svc.state.tunables()
    );
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_metrics_export_after_ticks() {
    let (svc, sink) = new_service_with_sink();
    let resp = call(
        &svc,
        Method::POST,
        "/instance/A",
        Some(r##"{"error_pct": 100, "latency_min_ms": 10, "latency_max_ms": 1}"##),
    )
    .await;
    assert_eq!(StatusCode::CREATED, resp.status());

    let mut simulator = Simulator::with_rng(
        svc.state.clone(),
        sink.clone(),
        4,
        SmallRng::seed_from_u64(1),
    );
    simulator.tick();

    // deleting the instance keeps its history
    let resp = call(&svc, Method::DELETE, "/instance/A", None).await;
    assert_eq!(StatusCode::NO_CONTENT, resp.status());
    simulator.tick();

    let resp = call(&svc, Method::GET, "/metrics", None).await;
    assert_eq!(StatusCode::OK, resp.status());
    assert_eq!(
        prometheus::CONTENT_TYPE,
        resp.headers().get(CONTENT_TYPE).unwrap().to_str().unwrap()
    );
    let payload = resp.try_into_string().await.unwrap();

    for line in [
        r#"request_duration_millis{code="500",instance="A",quantile="0.5"} 10"#,
        r#"request_duration_millis_sum{code="500",instance="A"} 40"#,
        r#"request_duration_millis_count{code="500",instance="A"} 4"#,
        r#"errors_encountered_total{code="500",instance="A"} 4"#,
    ] {
        assert!(payload.lines().any(|l| l == line), "missing '{line}' in:\n{payload}");
    }
    assert_eq!(4, sink.snapshot().error_count(Outcome::Error, "A"));
}
