//! Prometheus HTTP API backend

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tcm_core::labels::METRIC_NAME_LABEL;
use tcm_core::{LabelSet, MetricsBackend};
use tracing::debug;

/// Queries series counts and label samples from the Prometheus HTTP API
pub struct PrometheusBackend {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VectorData {
    result: Vec<VectorSample>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    metric: HashMap<String, String>,
    /// `[timestamp, "value"]`
    value: (f64, String),
}

impl PrometheusBackend {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> tcm_core::Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| tcm_core::Error::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Backend for the configured URL and request timeout
    pub fn from_config(config: &crate::BackendConfig) -> tcm_core::Result<Self> {
        Self::new(config.url.clone(), config.request_timeout())
    }

    async fn get<T>(&self, path: &str, params: &[(&str, String)]) -> tcm_core::Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Querying metrics backend");

        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| tcm_core::Error::query(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        let body: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| tcm_core::Error::query(format!("Invalid response from {}: {}", url, e)))?;

        if !status.is_success() || body.status != "success" {
            return Err(tcm_core::Error::query(format!(
                "{} returned {}: {}",
                url,
                status,
                body.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }

        body.data
            .ok_or_else(|| tcm_core::Error::query(format!("{} returned no data", url)))
    }
}

#[async_trait]
impl MetricsBackend for PrometheusBackend {
    async fn current_series(&self, selector: &LabelSet) -> tcm_core::Result<HashMap<String, u64>> {
        let query = format!("count by ({}) ({})", METRIC_NAME_LABEL, selector.selector(None));
        let data: VectorData = self.get("/api/v1/query", &[("query", query)]).await?;

        let mut series = HashMap::with_capacity(data.result.len());
        for sample in data.result {
            let Some(metric) = sample.metric.get(METRIC_NAME_LABEL) else {
                continue;
            };
            let count = sample.value.1.parse::<f64>().map_err(|e| {
                tcm_core::Error::query(format!("Invalid series count for {}: {}", metric, e))
            })?;
            series.insert(metric.clone(), count.max(0.0) as u64);
        }

        Ok(series)
    }

    async fn sample_label_sets(
        &self,
        metric: &str,
        selector: &LabelSet,
        limit: usize,
    ) -> tcm_core::Result<Vec<LabelSet>> {
        let params = [
            ("match[]", selector.selector(Some(metric))),
            ("limit", limit.to_string()),
        ];
        let data: Vec<BTreeMap<String, String>> = self.get("/api/v1/series", &params).await?;

        // Older servers ignore `limit`
        Ok(data.into_iter().take(limit).map(LabelSet::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, routing::get, Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    async fn query_handler(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        let query = params.get("query").cloned().unwrap_or_default();
        if !query.contains(r#"job="api""#) {
            return Json(json!({"status": "success", "data": {"resultType": "vector", "result": []}}));
        }

        Json(json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"__name__": "http_requests_total"}, "value": [1700000000.0, "1200"]},
                    {"metric": {"__name__": "up"}, "value": [1700000000.0, "3"]}
                ]
            }
        }))
    }

    async fn series_handler(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        assert_eq!(
            params.get("match[]").map(String::as_str),
            Some(r#"{__name__="http_requests_total",job="api"}"#)
        );

        let series: Vec<Value> = (0..5)
            .map(|i| json!({"__name__": "http_requests_total", "job": "api", "path": format!("/{}", i)}))
            .collect();
        Json(json!({"status": "success", "data": series}))
    }

    async fn serve() -> String {
        let app = Router::new()
            .route("/api/v1/query", get(query_handler))
            .route("/api/v1/series", get(series_handler));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_current_series() {
        let backend = PrometheusBackend::new(serve().await, Duration::from_secs(5)).unwrap();

        let series = backend
            .current_series(&LabelSet::new().with("job", "api"))
            .await
            .unwrap();
        assert_eq!(series.get("http_requests_total"), Some(&1200));
        assert_eq!(series.get("up"), Some(&3));

        let empty = backend
            .current_series(&LabelSet::new().with("job", "other"))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_sample_label_sets_truncates() {
        let backend = PrometheusBackend::new(serve().await, Duration::from_secs(5)).unwrap();

        let samples = backend
            .sample_label_sets("http_requests_total", &LabelSet::new().with("job", "api"), 3)
            .await
            .unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].get("path"), Some("/0"));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_query_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = PrometheusBackend::new(format!("http://{}", addr), Duration::from_secs(1)).unwrap();
        let err = backend
            .current_series(&LabelSet::new().with("job", "api"))
            .await
            .unwrap_err();
        assert!(matches!(err, tcm_core::Error::QueryFailure(_)));
    }
}
