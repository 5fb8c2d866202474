//! Provider stats endpoint shape

mod harness;

use harness::completion_body;
use harness::mock_llm::MockUpstream;
use harness::server::TestServer;

#[tokio::test]
async fn stats_expose_instance_and_key_state() {
    let mock = MockUpstream::start().await.unwrap();
    let yaml = format!(
        r#"
providers:
  upstream:
    type: openai
    base_url: "{}"
    api_keys: ["sk-one", "sk-two"]
    rate_limits:
      requests_per_minute: 100
      tokens_per_day: 50000
models:
  gpt-test:
    providers:
      upstream:
        priority: 1
"#,
        mock.base_url()
    );
    let server = TestServer::start(&yaml).await.unwrap();

    let resp = server
        .client()
        .post(server.url("/v1/chat/completions"))
        .json(&completion_body("gpt-test"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = server
        .client()
        .get(server.url("/v1/providers/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let json: serde_json::Value = resp.json().await.unwrap();
    let instance = &json["gpt-test"]["upstream"];

    assert_eq!(instance["enabled"], true);
    assert_eq!(instance["priority"], 1);
    assert_eq!(instance["circuit_breaker"], "closed");
    assert_eq!(instance["consecutive_failures"], 0);
    assert_eq!(instance["requests"], 1);
    assert_eq!(instance["errors"], 0);
    assert_eq!(instance["prompt_tokens"], 9);
    assert_eq!(instance["completion_tokens"], 12);
    assert!(instance["health_score"].as_f64().unwrap() > 0.0);
    assert!(instance["avg_response_time"].as_f64().unwrap() >= 0.0);

    // Per-key state: indices, no key material, per-limit usage
    let keys = instance["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0]["index"], 0);
    assert_eq!(keys[0]["enabled"], true);
    assert_eq!(keys[0]["rate_limited"], false);
    assert_eq!(keys[0]["usage"]["requests_per_minute"]["used"], 1.0);
    assert_eq!(keys[0]["usage"]["requests_per_minute"]["limit"], 100.0);
    assert_eq!(keys[0]["usage"]["tokens_per_day"]["used"], 21.0);
    assert_eq!(keys[1]["usage"]["requests_per_minute"]["used"], 0.0);

    // Key strings never appear in the payload
    let raw = json.to_string();
    assert!(!raw.contains("sk-one"));
    assert!(!raw.contains("sk-two"));
}

#[tokio::test]
async fn stats_track_failures_and_breaker_state() {
    let mock = MockUpstream::builder().fail_for_key("sk-flaky").start().await.unwrap();
    let yaml = format!(
        r#"
providers:
  upstream:
    type: openai
    base_url: "{}"
    api_key: "sk-flaky"
models:
  gpt-test:
    providers:
      upstream:
        max_retries: 1
"#,
        mock.base_url()
    );
    let server = TestServer::start(&yaml).await.unwrap();

    for _ in 0..2 {
        let resp = server
            .client()
            .post(server.url("/v1/chat/completions"))
            .json(&completion_body("gpt-test"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
    }

    let resp = server
        .client()
        .get(server.url("/v1/providers/stats"))
        .send()
        .await
        .unwrap();
    let json: serde_json::Value = resp.json().await.unwrap();
    let instance = &json["gpt-test"]["upstream"];

    assert_eq!(instance["errors"], 2);
    assert_eq!(instance["consecutive_failures"], 2);
    assert_eq!(instance["circuit_breaker"], "closed");
    assert!(instance["health_score"].as_f64().unwrap() < 100.0);
    assert_eq!(instance["keys"][0]["failures"], 2);
}
