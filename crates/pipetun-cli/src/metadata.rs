//! Connection metadata lookup
//!
//! Runs are resolved through the platform REST API: the run itself gives the
//! target address, SSH pass-phrase, owner and parameters, and the edge
//! endpoint gives the proxy. Bare hosts skip the run lookup.

use crate::config::Settings;
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use pipetun_proto::{ConnectionInfo, Endpoint, Platform, SSH_PORT};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Everything needed to reach `host_id`
    async fn connection_info(&self, host_id: &str, region: Option<&str>) -> Result<ConnectionInfo>;
}

/// Platform API envelope
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    status: String,
    message: Option<String>,
    payload: Option<T>,
}

impl<T> ApiResponse<T> {
    fn into_payload(self, what: &str) -> Result<T> {
        if !self.status.eq_ignore_ascii_case("OK") {
            return Err(TunnelError::Metadata(format!(
                "{}: {}",
                what,
                self.message.unwrap_or(self.status)
            )));
        }
        self.payload
            .ok_or_else(|| TunnelError::Metadata(format!("{}: empty response", what)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetails {
    pub id: u64,
    #[serde(rename = "podIP")]
    pub pod_ip: Option<String>,
    pub ssh_password: Option<String>,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub sensitive: bool,
    pub platform: Option<String>,
    #[serde(default)]
    pub pipeline_run_parameters: Vec<RunParameter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunParameter {
    pub name: String,
    pub value: Option<String>,
}

impl RunDetails {
    fn parameters(&self) -> HashMap<String, String> {
        self.pipeline_run_parameters
            .iter()
            .filter_map(|p| p.value.clone().map(|value| (p.name.clone(), value)))
            .collect()
    }
}

/// Edge proxy endpoint from its external URL
pub fn parse_edge_url(url: &str) -> Result<Endpoint> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| TunnelError::Metadata(format!("invalid edge URL {}: {}", url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| TunnelError::Metadata(format!("edge URL {} has no host", url)))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| TunnelError::Metadata(format!("edge URL {} has no port", url)))?;
    // IPv6 hosts come back bracketed
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok(Endpoint::new(host, port))
}

/// Assemble the connection info of a run
pub fn run_connection_info(run: &RunDetails, proxy: Endpoint) -> Result<ConnectionInfo> {
    let pod_ip = run
        .pod_ip
        .clone()
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| TunnelError::Metadata(format!("run {} has no IP address yet", run.id)))?;
    Ok(ConnectionInfo {
        proxy,
        target: Endpoint::new(pod_ip, SSH_PORT),
        credential: run.ssh_password.clone().unwrap_or_default(),
        owner: run.owner.clone(),
        sensitive: run.sensitive,
        platform: run.platform.as_deref().map(Platform::from).unwrap_or_default(),
        parameters: run.parameters(),
    })
}

pub struct RestMetadataProvider {
    client: reqwest::Client,
    api_url: String,
    token: String,
    user: String,
    proxy_override: Option<Endpoint>,
}

impl RestMetadataProvider {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let api_url = settings
            .api_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("API URL is not configured, run `pipetun config set-api`"))?;
        let token = settings
            .access_token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Access token is not configured, run `pipetun config set-token`"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            user: settings.user.clone().unwrap_or_default(),
            proxy_override: settings.proxy_override()?,
        })
    }

    fn request(&self, path: &str, query: &[(&str, &str)]) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.api_url, path);
        debug!("GET {} {:?}", url, query);
        self.client.get(&url).query(query).bearer_auth(&self.token)
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str, what: &str) -> Result<T> {
        self.get_with_query(path, &[], what).await
    }

    async fn get_with_query<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        what: &str,
    ) -> Result<T> {
        let response = self
            .request(path, query)
            .send()
            .await
            .map_err(|e| TunnelError::Metadata(format!("{}: {}", what, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TunnelError::Metadata(format!("{}: HTTP {}", what, status)));
        }
        response
            .json::<ApiResponse<T>>()
            .await
            .map_err(|e| TunnelError::Metadata(format!("{}: {}", what, e)))?
            .into_payload(what)
    }

    async fn run(&self, run_id: u64) -> Result<RunDetails> {
        self.get(&format!("run/{}", run_id), &format!("run {}", run_id))
            .await
    }

    async fn edge(&self, region: Option<&str>) -> Result<Endpoint> {
        if let Some(proxy) = &self.proxy_override {
            return Ok(proxy.clone());
        }
        let query: Vec<(&str, &str)> = region.map(|r| ("region", r)).into_iter().collect();
        let url: String = self
            .get_with_query("cluster/edge/externalUrl", &query, "edge address")
            .await?;
        parse_edge_url(&url)
    }
}

#[async_trait]
impl MetadataProvider for RestMetadataProvider {
    async fn connection_info(&self, host_id: &str, region: Option<&str>) -> Result<ConnectionInfo> {
        let proxy = self.edge(region).await?;

        let Ok(run_id) = host_id.parse::<u64>() else {
            return Ok(ConnectionInfo {
                proxy,
                target: Endpoint::new(host_id, SSH_PORT),
                credential: String::new(),
                owner: self.user.clone(),
                sensitive: false,
                platform: Platform::Linux,
                parameters: HashMap::new(),
            });
        };

        let run = self.run(run_id).await?;
        let mut info = run_connection_info(&run, proxy)?;

        // Cluster workers inherit sensitivity from their parent run
        if !info.sensitive {
            if let Some(parent_id) = info.parent_run_id() {
                let parent = self.run(parent_id).await?;
                if parent.sensitive {
                    debug!("Run {} inherits sensitivity from run {}", run_id, parent_id);
                    info.sensitive = true;
                }
            }
        }
        Ok(info)
    }
}
