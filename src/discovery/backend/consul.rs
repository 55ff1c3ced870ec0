//! Consul 注册中心后端
//!
//! 基于 Consul agent HTTP API 实现 [`RegistryBackend`]。

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use super::{AgentRegistration, CheckStatus, QueryOptions, RegistryBackend, TaggedAddress};
use crate::config::{RegistryConfig, normalize_address};
use crate::discovery::instance::ServiceInstance;
use crate::error::{RegistryError, Result};

/// Consul 返回的阻塞查询索引头
const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Consul 自动生成的地址标签，不作为 endpoint
const RESERVED_ADDRESS_TAGS: [&str; 6] = [
    "lan", "lan_ipv4", "lan_ipv6", "wan", "wan_ipv4", "wan_ipv6",
];

/// Consul 注册中心后端
#[derive(Clone)]
pub struct ConsulBackend {
    http_client: HttpClient,
    consul_url: String,
    token: Option<String>,
}

impl ConsulBackend {
    /// 创建新的 Consul 后端
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        config.validate()?;
        let http_client = HttpClient::builder().build()?;
        Ok(Self {
            http_client,
            consul_url: normalize_address(&config.address),
            token: config.token.clone(),
        })
    }

    /// 使用已有的 HTTP 客户端
    pub fn with_client(http_client: HttpClient, consul_url: impl Into<String>) -> Self {
        Self {
            http_client,
            consul_url: consul_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.consul_url
    }

    /// 拼接 API 路径，每一段单独做百分号编码
    fn endpoint<'a, I>(&self, segments: I) -> Result<Url>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut url = Url::parse(&self.consul_url).map_err(|e| {
            RegistryError::config(format!("invalid consul address {}: {}", self.consul_url, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                RegistryError::config(format!("consul address {} cannot be a base", self.consul_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request<'a, I>(&self, method: reqwest::Method, segments: I) -> Result<RequestBuilder>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let builder = self.http_client.request(method, self.endpoint(segments)?);
        Ok(match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        })
    }

    /// 阻塞查询参数
    fn blocking_params(query: &QueryOptions) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if query.wait_index > 0 {
            params.push(("index", query.wait_index.to_string()));
            params.push(("wait", format!("{}s", query.wait_time.as_secs().max(1))));
        }
        if let Some(dc) = &query.datacenter {
            params.push(("dc", dc.clone()));
        }
        params
    }

    fn response_index(resp: &Response) -> u64 {
        resp.headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
    }
}

/// KV 路径段；键中的 `/` 保留为层级分隔
fn kv_path(key: &str) -> impl Iterator<Item = &str> {
    ["v1", "kv"]
        .into_iter()
        .chain(key.trim_start_matches('/').split('/'))
}

/// 将非 2xx 响应转换为错误
async fn ensure_success(resp: Response, resource: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(status, resource, &body))
}

fn classify_status(status: StatusCode, resource: &str, body: &str) -> RegistryError {
    let lowered = body.to_lowercase();
    if status == StatusCode::NOT_FOUND
        || lowered.contains("not found")
        || lowered.contains("unknown check")
        || lowered.contains("unknown service")
    {
        return RegistryError::not_found(format!("{}: {}", resource, body.trim()));
    }
    if status.is_server_error() {
        return RegistryError::backend_unavailable(format!(
            "{} returned {}: {}",
            resource,
            status,
            body.trim()
        ));
    }
    RegistryError::rejected(format!("{} returned {}: {}", resource, status, body.trim()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    service: ServiceEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    meta: Option<HashMap<String, String>>,
    #[serde(default)]
    tagged_addresses: Option<HashMap<String, TaggedAddress>>,
}

impl ServiceEntry {
    fn into_instance(self) -> ServiceInstance {
        let tags = self.tags.unwrap_or_default();
        let version = tags
            .iter()
            .filter_map(|tag| tag.split_once('='))
            .find(|(key, _)| *key == "version")
            .map(|(_, value)| value.to_string())
            .unwrap_or_default();

        let mut tagged: Vec<(String, TaggedAddress)> = self
            .tagged_addresses
            .unwrap_or_default()
            .into_iter()
            .filter(|(scheme, _)| !RESERVED_ADDRESS_TAGS.contains(&scheme.as_str()))
            .collect();
        tagged.sort_by(|a, b| a.0.cmp(&b.0));
        let mut endpoints: Vec<String> = tagged.into_iter().map(|(_, addr)| addr.address).collect();

        if endpoints.is_empty() && !self.address.is_empty() && self.port != 0 {
            endpoints.push(format!("http://{}:{}", self.address, self.port));
        }

        ServiceInstance {
            id: self.id,
            name: self.service,
            version,
            metadata: self.meta.unwrap_or_default(),
            endpoints,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    #[serde(default)]
    value: Option<String>,
}

#[async_trait]
impl RegistryBackend for ConsulBackend {
    async fn register_service(&self, registration: &AgentRegistration) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PUT, ["v1", "agent", "service", "register"])?
            .json(registration)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(RegistryError::backend_unavailable(format!(
                "register {} returned {}: {}",
                registration.id,
                status,
                body.trim()
            )));
        }
        // 4xx：后端校验失败
        Err(RegistryError::rejected(format!(
            "register {} returned {}: {}",
            registration.id,
            status,
            body.trim()
        )))
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::PUT,
                ["v1", "agent", "service", "deregister", service_id],
            )?
            .send()
            .await?;
        ensure_success(resp, &format!("service {}", service_id)).await?;
        Ok(())
    }

    async fn list_service_instances(
        &self,
        service_name: &str,
        query: &QueryOptions,
    ) -> Result<(Vec<ServiceInstance>, u64)> {
        let mut params = Self::blocking_params(query);
        if query.healthy_only {
            params.push(("passing", "1".to_string()));
        }

        let resp = self
            .request(reqwest::Method::GET, ["v1", "health", "service", service_name])?
            .query(&params)
            .send()
            .await?;
        let resp = ensure_success(resp, &format!("health of {}", service_name)).await?;
        let index = Self::response_index(&resp);
        let entries: Vec<HealthEntry> = resp.json().await?;

        debug!(
            service = %service_name,
            index,
            entries = entries.len(),
            "Consul health query returned"
        );

        let instances = entries
            .into_iter()
            .map(|entry| entry.service.into_instance())
            .collect();
        Ok((instances, index))
    }

    async fn list_datacenters(&self) -> Result<Vec<String>> {
        let resp = self
            .request(reqwest::Method::GET, ["v1", "catalog", "datacenters"])?
            .send()
            .await?;
        let resp = ensure_success(resp, "catalog datacenters").await?;
        Ok(resp.json().await?)
    }

    async fn update_ttl_check(
        &self,
        check_id: &str,
        status: CheckStatus,
        output: &str,
    ) -> Result<()> {
        let payload = serde_json::json!({
            "Status": status.as_str(),
            "Output": output,
        });
        let resp = self
            .request(reqwest::Method::PUT, ["v1", "agent", "check", "update", check_id])?
            .json(&payload)
            .send()
            .await?;
        ensure_success(resp, &format!("check {}", check_id)).await?;
        Ok(())
    }

    async fn kv_get(&self, key: &str, query: &QueryOptions) -> Result<(Option<Vec<u8>>, u64)> {
        let resp = self
            .request(reqwest::Method::GET, kv_path(key))?
            .query(&Self::blocking_params(query))
            .send()
            .await?;
        let index = Self::response_index(&resp);
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok((None, index));
        }
        let resp = ensure_success(resp, &format!("key {}", key)).await?;
        let entries: Vec<KvEntry> = resp.json().await?;
        let value = match entries.into_iter().next() {
            Some(entry) => Some(match entry.value {
                Some(encoded) => BASE64.decode(encoded)?,
                None => Vec::new(),
            }),
            None => None,
        };
        Ok((value, index))
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PUT, kv_path(key))?
            .body(value.to_vec())
            .send()
            .await?;
        ensure_success(resp, &format!("key {}", key)).await?;
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<()> {
        let resp = self
            .request(reqwest::Method::DELETE, kv_path(key))?
            .send()
            .await?;
        ensure_success(resp, &format!("key {}", key)).await?;
        Ok(())
    }
}
