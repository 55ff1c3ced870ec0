//! Consul 后端 HTTP 协议测试
//!
//! 使用 wiremock 模拟 Consul agent，不需要真实的 Consul 实例。

use flare_discovery::{
    CheckStatus, ConsulBackend, QueryOptions, Registry, RegistryBackend, RegistryConfig,
    RegistryError, ServiceInstance,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend(server: &MockServer) -> ConsulBackend {
    ConsulBackend::with_client(reqwest::Client::new(), server.uri())
}

fn health_body() -> serde_json::Value {
    json!([
        {
            "Node": {"Node": "node-1", "Address": "10.0.0.1"},
            "Service": {
                "ID": "orders-1",
                "Service": "orders",
                "Tags": ["version=v3", "team=core"],
                "Address": "10.0.0.1",
                "Port": 9000,
                "Meta": {"zone": "a"},
                "TaggedAddresses": {
                    "grpc": {"Address": "grpc://10.0.0.1:9000", "Port": 9000},
                    "lan_ipv4": {"Address": "10.0.0.1", "Port": 9000}
                }
            },
            "Checks": []
        },
        {
            "Service": {
                "ID": "orders-2",
                "Service": "orders",
                "Tags": null,
                "Address": "10.0.0.2",
                "Port": 8080,
                "Meta": null,
                "TaggedAddresses": null
            }
        }
    ])
}

#[tokio::test]
async fn test_list_service_instances_blocking_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .and(query_param("passing", "1"))
        .and(query_param("index", "7"))
        .and(query_param("wait", "30s"))
        .and(query_param("dc", "east"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "12")
                .set_body_json(health_body()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let query = QueryOptions::blocking(7, Duration::from_secs(30)).in_datacenter("east");
    let (instances, index) = backend(&server)
        .list_service_instances("orders", &query)
        .await
        .expect("list");

    assert_eq!(index, 12);
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0].id, "orders-1");
    assert_eq!(instances[0].version, "v3");
    assert_eq!(instances[0].endpoints, vec!["grpc://10.0.0.1:9000".to_string()]);
    assert_eq!(instances[0].metadata.get("zone").map(String::as_str), Some("a"));
    assert_eq!(instances[1].version, "");
    assert_eq!(instances[1].endpoints, vec!["http://10.0.0.2:8080".to_string()]);
}

#[tokio::test]
async fn test_register_sends_agent_payload() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(header("X-Consul-Token", "secret"))
        .and(body_partial_json(json!({
            "ID": "orders-1",
            "Name": "orders",
            "Tags": ["version=v1"],
            "Address": "10.0.0.5",
            "Port": 9000,
            "TaggedAddresses": {"grpc": {"Address": "grpc://10.0.0.5:9000", "Port": 9000}},
            "Checks": [{"CheckID": "service:orders-1", "TTL": "20s"}]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = RegistryConfig::default().with_health_check(false);
    let instance = ServiceInstance::new("orders-1", "orders")
        .with_version("v1")
        .with_endpoint("grpc://10.0.0.5:9000");
    let registration =
        flare_discovery::registry::build_registration(&instance, &config).expect("payload");

    backend(&server)
        .with_token("secret")
        .register_service(&registration)
        .await
        .expect("register");
}

#[tokio::test]
async fn test_register_error_classification() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(body_partial_json(json!({"ID": "bad"})))
        .respond_with(ResponseTemplate::new(400).set_body_string("Invalid check: TTL must be > 0"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(body_partial_json(json!({"ID": "down"})))
        .respond_with(ResponseTemplate::new(500).set_body_string("rpc error"))
        .mount(&server)
        .await;

    let consul = backend(&server);
    let mut registration = flare_discovery::AgentRegistration {
        id: "bad".to_string(),
        name: "orders".to_string(),
        ..Default::default()
    };
    let err = consul.register_service(&registration).await.expect_err("400");
    assert!(matches!(err, RegistryError::RegistrationRejected(_)));

    registration.id = "down".to_string();
    let err = consul.register_service(&registration).await.expect_err("500");
    assert!(matches!(err, RegistryError::BackendUnavailable(_)));
}

#[tokio::test]
async fn test_update_ttl_and_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/check/update/service:orders-1"))
        .and(body_partial_json(json!({"Status": "passing"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/check/update/service:gone"))
        .respond_with(
            ResponseTemplate::new(500).set_body_string("Unknown check ID \"service:gone\""),
        )
        .mount(&server)
        .await;

    let consul = backend(&server);
    consul
        .update_ttl_check("service:orders-1", CheckStatus::Passing, "")
        .await
        .expect("pass");

    let err = consul
        .update_ttl_check("service:gone", CheckStatus::Passing, "")
        .await
        .expect_err("missing check");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_deregister_not_found_is_success_for_registry() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/orders-1"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Unknown service ID"))
        .expect(2)
        .mount(&server)
        .await;

    let consul = backend(&server);
    let err = consul.deregister_service("orders-1").await.expect_err("404");
    assert!(err.is_not_found());

    let registry = Registry::new(Arc::new(consul), RegistryConfig::default());
    registry.deregister("orders-1").await.expect("treated as success");
}

#[tokio::test]
async fn test_list_datacenters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/catalog/datacenters"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["east", "west"])))
        .mount(&server)
        .await;

    let datacenters = backend(&server).list_datacenters().await.expect("dcs");
    assert_eq!(datacenters, vec!["east".to_string(), "west".to_string()]);
}

#[tokio::test]
async fn test_kv_roundtrip_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/feature/flag"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "33")
                // base64("on")
                .set_body_json(json!([{"Key": "feature/flag", "Value": "b24=", "ModifyIndex": 33}])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/missing"))
        .respond_with(ResponseTemplate::new(404).insert_header("X-Consul-Index", "34"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/kv/feature/flag"))
        .and(body_string("off"))
        .respond_with(ResponseTemplate::new(200).set_body_string("true"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/kv/feature/flag"))
        .respond_with(ResponseTemplate::new(200).set_body_string("true"))
        .expect(1)
        .mount(&server)
        .await;

    let consul = backend(&server);
    let (value, index) = consul
        .kv_get("feature/flag", &QueryOptions::immediate())
        .await
        .expect("get");
    assert_eq!(value, Some(b"on".to_vec()));
    assert_eq!(index, 33);

    let (value, index) = consul
        .kv_get("missing", &QueryOptions::immediate())
        .await
        .expect("absent is not an error");
    assert_eq!(value, None);
    assert_eq!(index, 34);

    consul.kv_put("feature/flag", b"off").await.expect("put");
    consul.kv_delete("feature/flag").await.expect("delete");
}

#[tokio::test]
async fn test_unreachable_agent_is_backend_unavailable() {
    // 端口 9 (discard) 通常没有监听
    let consul = ConsulBackend::with_client(reqwest::Client::new(), "http://127.0.0.1:9");
    let err = consul.list_datacenters().await.expect_err("connection refused");
    assert!(matches!(err, RegistryError::BackendUnavailable(_)));
    assert!(err.is_retryable());
}

/// 服务名、检查 ID 中的特殊字符按路径段编码；KV 键的 `/` 保留为层级
#[tokio::test]
async fn test_path_segments_are_percent_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/billing%20api"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "3")
                .set_body_json(json!([])),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/check/update/service:web%2F1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/kv/feature/dark%20mode%3F"))
        .respond_with(ResponseTemplate::new(200).set_body_string("true"))
        .expect(1)
        .mount(&server)
        .await;

    let consul = backend(&server);
    let (instances, index) = consul
        .list_service_instances("billing api", &QueryOptions::immediate())
        .await
        .expect("list");
    assert!(instances.is_empty());
    assert_eq!(index, 3);

    consul
        .update_ttl_check("service:web/1", CheckStatus::Passing, "")
        .await
        .expect("check id with slash");
    consul
        .kv_put("feature/dark mode?", b"on")
        .await
        .expect("key with reserved characters");
}
