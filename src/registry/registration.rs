//! 注册载荷构建
//!
//! 把 [`ServiceInstance`] 和客户端配置翻译成 agent 注册载荷。

use std::collections::HashMap;

use crate::config::{RegistryConfig, ServiceCheck};
use crate::discovery::backend::{AgentCheck, AgentRegistration, TaggedAddress};
use crate::discovery::instance::ServiceInstance;
use crate::error::Result;
use crate::utils::{consul_duration, parse_endpoint};

const TCP_CHECK_TIMEOUT: &str = "5s";

/// TTL 检查 ID
pub fn ttl_check_id(service_id: &str) -> String {
    format!("service:{}", service_id)
}

/// 构建 agent 注册载荷
///
/// endpoint 无法解析时在发起任何后端调用前返回 `RegistryError::Config`。
pub fn build_registration(
    instance: &ServiceInstance,
    config: &RegistryConfig,
) -> Result<AgentRegistration> {
    let mut tagged_addresses = HashMap::new();
    let mut checks = Vec::new();
    let mut address = String::new();
    let mut port = 0u16;

    for endpoint in &instance.endpoints {
        let (scheme, host, endpoint_port) = parse_endpoint(endpoint)?;
        if address.is_empty() {
            address = host.clone();
            port = endpoint_port;
        }
        tagged_addresses.insert(
            scheme,
            TaggedAddress {
                address: endpoint.clone(),
                port: endpoint_port,
            },
        );
        if config.health_check {
            checks.push(AgentCheck {
                tcp: Some(tcp_target(&host, endpoint_port)),
                interval: Some(consul_duration(config.health_check_interval)),
                timeout: Some(TCP_CHECK_TIMEOUT.to_string()),
                deregister_critical_service_after: Some(consul_duration(
                    config.deregister_critical_service_after,
                )),
                ..Default::default()
            });
        }
    }

    if config.heartbeat {
        checks.push(AgentCheck {
            check_id: Some(ttl_check_id(&instance.id)),
            name: Some(format!("Service '{}' heartbeat", instance.name)),
            ttl: Some(consul_duration(config.health_check_interval * 2)),
            deregister_critical_service_after: Some(consul_duration(
                config.deregister_critical_service_after,
            )),
            ..Default::default()
        });
    }

    checks.extend(config.service_checks.iter().map(user_check));

    let mut tags = Vec::with_capacity(config.tags.len() + 1);
    tags.push(format!("version={}", instance.version));
    tags.extend(config.tags.iter().cloned());

    Ok(AgentRegistration {
        id: instance.id.clone(),
        name: instance.name.clone(),
        tags,
        address,
        port,
        meta: instance.metadata.clone(),
        tagged_addresses,
        checks,
    })
}

fn tcp_target(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn user_check(check: &ServiceCheck) -> AgentCheck {
    AgentCheck {
        check_id: check.check_id.clone(),
        name: check.name.clone(),
        tcp: check.tcp.clone(),
        http: check.http.clone(),
        ttl: None,
        interval: check.interval.clone(),
        timeout: check.timeout.clone(),
        deregister_critical_service_after: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;

    fn instance() -> ServiceInstance {
        ServiceInstance::new("orders-1", "orders")
            .with_version("v1.2.0")
            .with_metadata("zone", "a")
            .with_endpoint("grpc://10.0.0.5:9000")
            .with_endpoint("http://10.0.0.5:8080")
    }

    #[test]
    fn test_build_registration_with_all_checks() {
        let config = RegistryConfig::default()
            .with_tags(["team=core"])
            .with_service_check(ServiceCheck {
                check_id: Some("custom".into()),
                http: Some("http://10.0.0.5:8080/health".into()),
                interval: Some("30s".into()),
                ..Default::default()
            });

        let reg = build_registration(&instance(), &config).expect("valid instance");

        assert_eq!(reg.id, "orders-1");
        assert_eq!(reg.address, "10.0.0.5");
        assert_eq!(reg.port, 9000);
        assert_eq!(reg.tags, vec!["version=v1.2.0".to_string(), "team=core".to_string()]);
        assert_eq!(reg.meta.get("zone").map(String::as_str), Some("a"));
        assert_eq!(reg.tagged_addresses["grpc"].address, "grpc://10.0.0.5:9000");
        assert_eq!(reg.tagged_addresses["http"].port, 8080);

        // 两个 TCP 检查 + TTL 检查 + 自定义检查
        assert_eq!(reg.checks.len(), 4);
        assert_eq!(reg.checks[0].tcp.as_deref(), Some("10.0.0.5:9000"));
        assert_eq!(reg.checks[0].interval.as_deref(), Some("10s"));
        assert_eq!(reg.checks[0].deregister_critical_service_after.as_deref(), Some("600s"));
        assert_eq!(reg.checks[2].ttl.as_deref(), Some("20s"));
        assert_eq!(reg.ttl_check_id(), Some("service:orders-1"));
        assert_eq!(reg.checks[3].check_id.as_deref(), Some("custom"));
    }

    #[test]
    fn test_build_registration_without_checks() {
        let config = RegistryConfig::default()
            .with_health_check(false)
            .with_heartbeat(false);
        let reg = build_registration(&instance(), &config).expect("valid instance");
        assert!(reg.checks.is_empty());
        assert_eq!(reg.ttl_check_id(), None);
    }

    #[test]
    fn test_build_registration_rejects_bad_endpoint() {
        let bad = ServiceInstance::new("x", "orders").with_endpoint("grpc://10.0.0.5");
        let err = build_registration(&bad, &RegistryConfig::default()).expect_err("no port");
        assert!(matches!(err, RegistryError::Config(_)));
    }
}
