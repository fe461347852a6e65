use axum::body::Bytes;
use conductive_shared::{DeviceCommand, DeviceConfig, InjectRequest};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use std::time::Duration;
use tracing::{info, warn};

// 设备访问路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub address: String,
    /// 数值越小越先尝试
    pub priority: u32,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, address: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            priority,
        }
    }

    /// 地址不带协议时默认 http
    fn url(&self, path: &str) -> String {
        let address = self.address.trim().trim_end_matches('/');
        if address.contains("://") {
            format!("{}{}", address, path)
        } else {
            format!("http://{}{}", address, path)
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceResponse {
    /// 成功响应的路径名
    pub endpoint: String,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("{endpoint} unreachable: {reason}")]
    TransportUnreachable { endpoint: String, reason: String },

    #[error("all connection methods failed after {attempts} attempt(s), last error: {last}")]
    AllEndpointsFailed {
        attempts: usize,
        last: Box<DeviceError>,
    },

    #[error("no device endpoints configured")]
    NoEndpoints,

    #[error("failed to encode device request: {0}")]
    Encode(#[from] serde_json::Error),
}

// 发往设备的 HTTP 请求
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeviceRequest {
    method: Method,
    path: String,
    body: Option<Vec<u8>>,
}

impl DeviceRequest {
    fn for_command(command: &DeviceCommand) -> Result<Self, DeviceError> {
        let request = match command {
            DeviceCommand::GetStatus => Self {
                method: Method::GET,
                path: "/status".to_string(),
                body: None,
            },
            DeviceCommand::Inject(req) => Self {
                method: Method::POST,
                path: "/api/inject".to_string(),
                body: Some(serde_json::to_vec(req)?),
            },
            DeviceCommand::Stop => Self {
                method: Method::POST,
                path: "/api/stop".to_string(),
                body: Some(b"{}".to_vec()),
            },
            DeviceCommand::SetAmplitude { value } => Self {
                method: Method::GET,
                path: format!("/set_amplitude?value={}", value),
                body: None,
            },
        };

        Ok(request)
    }
}

/// 设备命令路由
///
/// 按优先级依次尝试每个路径（AP 模式优先，其次 Station 模式），
/// 每个路径只尝试一次，返回第一个成功响应的原始内容。
/// 路径顺序在构造时确定，运行期间不再调整。
pub struct DeviceRouter {
    client: reqwest::Client,
    endpoints: Vec<Endpoint>,
}

impl DeviceRouter {
    pub fn new(mut endpoints: Vec<Endpoint>, timeout: Duration) -> Result<Self, reqwest::Error> {
        endpoints.retain(|e| !e.address.trim().is_empty());
        endpoints.sort_by_key(|e| e.priority);

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self { client, endpoints })
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self, reqwest::Error> {
        Self::new(
            vec![
                Endpoint::new("AP mode", config.ap_address.clone(), 0),
                Endpoint::new("Station mode", config.station_address.clone(), 1),
            ],
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub async fn get_status(&self) -> Result<DeviceResponse, DeviceError> {
        self.execute(&DeviceCommand::GetStatus).await
    }

    pub async fn inject(&self, request: InjectRequest) -> Result<DeviceResponse, DeviceError> {
        self.execute(&DeviceCommand::Inject(request)).await
    }

    pub async fn stop(&self) -> Result<DeviceResponse, DeviceError> {
        self.execute(&DeviceCommand::Stop).await
    }

    pub async fn set_amplitude(&self, value: i64) -> Result<DeviceResponse, DeviceError> {
        self.execute(&DeviceCommand::SetAmplitude { value }).await
    }

    pub async fn execute(&self, command: &DeviceCommand) -> Result<DeviceResponse, DeviceError> {
        let request = DeviceRequest::for_command(command)?;
        let mut last_error = None;
        let mut attempts = 0;

        for endpoint in &self.endpoints {
            attempts += 1;
            let url = endpoint.url(&request.path);
            info!("Trying {} for {}: {} {}", endpoint.name, command.name(), request.method, url);

            match self.attempt(endpoint, &url, &request).await {
                Ok(response) => {
                    info!("✅ {} success", endpoint.name);
                    return Ok(response);
                }
                Err(e) => {
                    warn!("⚠️ {} failed: {}", endpoint.name, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(last) => Err(DeviceError::AllEndpointsFailed {
                attempts,
                last: Box::new(last),
            }),
            None => Err(DeviceError::NoEndpoints),
        }
    }

    async fn attempt(
        &self,
        endpoint: &Endpoint,
        url: &str,
        request: &DeviceRequest,
    ) -> Result<DeviceResponse, DeviceError> {
        let unreachable = |e: reqwest::Error| DeviceError::TransportUnreachable {
            endpoint: endpoint.name.clone(),
            reason: describe(&e),
        };

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(unreachable)?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(unreachable)?;

        Ok(DeviceResponse {
            endpoint: endpoint.name.clone(),
            content_type,
            body,
        })
    }
}

fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timed out ({})", e)
    } else if e.is_connect() {
        format!("connection failed ({})", e)
    } else {
        e.to_string()
    }
}
