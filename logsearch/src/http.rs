//! [`SearchBackend`] over the log search server's JSON API.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backend::SearchBackend;
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::model::{
    ColumnInfo, DetailPage, DistributionResponse, HistogramData, ModuleQueryConfig, SearchParams,
};

const SUCCESS_CODE: &str = "0000";

const DETAILS_PATH: &str = "/api/logs/search/details";
const HISTOGRAM_PATH: &str = "/api/logs/search/histogram";
const DISTRIBUTIONS_PATH: &str = "/api/logs/search/field-distributions";
const COLUMNS_PATH: &str = "/api/logs/columns";
const QUERY_CONFIG_PATH: &str = "/api/modules/query-config";

/// Every response is wrapped as `{code, message, data}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: String,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let backend = Self::new(&config.base_url, config.request_timeout()?)?;
        Ok(match &config.token {
            Some(token) => backend.with_token(token),
            None => backend,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post<B, T>(&self, path: &str, body: &B, cancel: &CancellationToken) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.authorize(self.client.post(self.url(path)).json(body));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = send(request) => result,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        send(self.authorize(self.client.get(self.url(path)).query(query))).await
    }
}

async fn send<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T> {
    let response = request
        .send()
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;

    let envelope: Envelope<T> = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(_) if !status.is_success() => {
            return Err(Error::Server {
                code: status.as_u16().to_string(),
                message: status.canonical_reason().unwrap_or("request failed").to_string(),
            });
        }
        Err(e) => return Err(Error::Decode(e.to_string())),
    };
    if envelope.code != SUCCESS_CODE {
        return Err(Error::Server {
            code: envelope.code,
            message: envelope.message.unwrap_or_else(|| "request failed".to_string()),
        });
    }
    envelope
        .data
        .ok_or_else(|| Error::Decode("response has no data".to_string()))
}

#[async_trait]
impl SearchBackend for HttpBackend {
    async fn fetch_log_details(
        &self,
        params: &SearchParams,
        cancel: &CancellationToken,
    ) -> Result<DetailPage> {
        self.post(DETAILS_PATH, params, cancel).await
    }

    async fn fetch_log_histogram(
        &self,
        params: &SearchParams,
        cancel: &CancellationToken,
    ) -> Result<HistogramData> {
        self.post(HISTOGRAM_PATH, params, cancel).await
    }

    async fn fetch_distributions(
        &self,
        params: &SearchParams,
        cancel: &CancellationToken,
    ) -> Result<DistributionResponse> {
        self.post(DISTRIBUTIONS_PATH, params, cancel).await
    }

    async fn fetch_columns(&self, datasource_id: i64, module: &str) -> Result<Vec<ColumnInfo>> {
        let datasource_id = datasource_id.to_string();
        self.get(
            COLUMNS_PATH,
            &[("datasourceId", datasource_id.as_str()), ("module", module)],
        )
        .await
    }

    async fn get_module_query_config(&self, module: &str) -> Result<ModuleQueryConfig> {
        self.get(QUERY_CONFIG_PATH, &[("name", module)]).await
    }
}
