use crate::error::FetchError;
use crate::stream::{StreamRef, StreamSet};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 期望流集合的来源
///
/// 每个调度周期调用一次；出错时调度器跳过本周期
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch_streams(&self, token: &CancellationToken) -> Result<StreamSet, FetchError>;
}

#[derive(Debug, Deserialize)]
struct StreamList {
    #[serde(default)]
    streams: Vec<StreamRef>,
}

/// 每次调用都重新读取 YAML 流列表，修改文件即可改变期望集合
///
/// ```yaml
/// streams:
///   - id: cam-1
///     url: rtmp://origin/live/cam-1
/// ```
pub struct ConfigFetcher {
    path: PathBuf,
}

impl ConfigFetcher {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Fetcher for ConfigFetcher {
    async fn fetch_streams(&self, token: &CancellationToken) -> Result<StreamSet, FetchError> {
        let content = tokio::select! {
            _ = token.cancelled() => return Err(FetchError::Cancelled),
            content = tokio::fs::read_to_string(&self.path) => content?,
        };
        let list: StreamList =
            serde_yaml::from_str(&content).map_err(|e| FetchError::Parse(e.to_string()))?;
        Ok(list.streams.into_iter().collect())
    }
}

/// 通过 HTTP GET 拉取 JSON 数组 `[{"id": "...", "url": "..."}]`
pub struct HttpFetcher {
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl HttpFetcher {
    pub fn new(
        url: impl Into<String>,
        headers: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            headers,
        })
    }

    async fn request(&self) -> Result<StreamSet, FetchError> {
        let mut request = self.client.get(&self.url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let streams: Vec<StreamRef> = response.json().await?;
        Ok(streams.into_iter().collect())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_streams(&self, token: &CancellationToken) -> Result<StreamSet, FetchError> {
        tokio::select! {
            _ = token.cancelled() => Err(FetchError::Cancelled),
            result = self.request() => result,
        }
    }
}
