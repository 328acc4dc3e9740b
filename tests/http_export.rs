mod common;

use chrono::Utc;
use serde_json::Value;
use stackdriver_exporter::credentials::CredentialResolver;
use stackdriver_exporter::{AttributeValue, ExportScheduler, ExporterStats, HttpConnector, LabelSet};
use std::collections::HashMap;
use std::sync::Arc;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_end_to_end_over_http() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v3/projects/e2e/metricDescriptors"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v3/projects/e2e/timeSeries"))
        .and(query_param("key", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/entries:write"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let yaml = format!(
        r#"
projectID: e2e
apiKey: secret
endpoint: {}
pushInterval: 1h
metricInfo:
  latency:
    value: DOUBLE
    kind: GAUGE
    labelNames: [route]
logInfo:
  access:
    payloadTemplate: "{{{{.method}}}} {{{{.url}}}}"
"#,
        server.uri()
    );

    let scheduler = ExportScheduler::start(
        &common::config(&yaml),
        CredentialResolver::new(Arc::new(common::StaticTokenProvider)),
        Arc::new(HttpConnector),
        Arc::new(ExporterStats::new()),
    )
    .await
    .unwrap();

    let labels: LabelSet = [("route".to_string(), "/x".to_string())].into_iter().collect();
    scheduler.record("latency", &AttributeValue::Double(12.5), labels, Utc::now()).await;
    let variables: HashMap<String, AttributeValue> =
        [("method", "GET"), ("url", "/x")].iter().map(|(k, v)| (k.to_string(), AttributeValue::from(*v))).collect();
    scheduler.log("access", &variables).await;

    let report = scheduler.shutdown().await.unwrap();
    assert_eq!(report.metrics.series_sent, 1);
    assert_eq!(report.logs.entries_sent, 1);

    let requests = server.received_requests().await.unwrap();
    let series = requests
        .iter()
        .find(|r| r.url.path() == "/v3/projects/e2e/timeSeries")
        .unwrap();
    let body: Value = serde_json::from_slice(&series.body).unwrap();
    let first = &body["timeSeries"][0];
    assert_eq!(first["metric"]["type"], "custom.googleapis.com/latency");
    assert_eq!(first["metric"]["labels"]["route"], "/x");
    assert_eq!(first["metricKind"], "GAUGE");
    assert_eq!(first["points"][0]["value"]["doubleValue"], 12.5);

    let entries = requests.iter().find(|r| r.url.path() == "/v2/entries:write").unwrap();
    let body: Value = serde_json::from_slice(&entries.body).unwrap();
    assert_eq!(body["entries"][0]["textPayload"], "GET /x");
    assert_eq!(body["partialSuccess"], true);

    let transport = scheduler.transport_metrics().await;
    assert_eq!(transport.failures, 0);
    assert_eq!(transport.attempts, 3);
}
