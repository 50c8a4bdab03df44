use super::UsageNode;
use crate::entity::node;
use crate::error::{RecorderError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use common::{StatRecord, TrafficCalculationMethod};
use http_body_util::{BodyExt, Empty};
use hyper::Uri;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, instrument};

pub type HttpClient = Client<HttpConnector, Empty<Bytes>>;

pub fn http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Node reached over plain HTTP, answering a JSON array of stat records.
pub struct HttpNode {
    id: i64,
    usage_coefficient: f64,
    traffic_calculation_method: TrafficCalculationMethod,
    stats_uri: Uri,
    client: HttpClient,
}

impl HttpNode {
    pub fn from_model(model: &node::Model, client: HttpClient, stats_path: &str) -> Result<Self> {
        let host = if model.address.contains(':') && !model.address.starts_with('[') {
            format!("[{}]", model.address)
        } else {
            model.address.clone()
        };
        let stats_uri: Uri = format!("http://{}:{}{}", host, model.port, stats_path)
            .parse()
            .map_err(|e| {
                RecorderError::Configuration(format!(
                    "Invalid stats uri for node {}: {}",
                    model.id, e
                ))
            })?;

        Ok(Self {
            id: model.id,
            usage_coefficient: model.usage_coefficient,
            traffic_calculation_method: model.calculation_method(),
            stats_uri,
            client,
        })
    }
}

#[async_trait]
impl UsageNode for HttpNode {
    fn id(&self) -> i64 {
        self.id
    }

    fn usage_coefficient(&self) -> f64 {
        self.usage_coefficient
    }

    fn traffic_calculation_method(&self) -> TrafficCalculationMethod {
        self.traffic_calculation_method
    }

    #[instrument(skip(self), fields(node_id = self.id))]
    async fn fetch_users_stats(&self) -> Result<Vec<StatRecord>> {
        let response = self
            .client
            .get(self.stats_uri.clone())
            .await
            .map_err(|e| RecorderError::Node(format!("Stats request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecorderError::Node(format!(
                "Stats request answered {}",
                status
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RecorderError::Node(format!("Failed to read stats body: {}", e)))?
            .to_bytes();

        let records = common::parse_stats(&body)?;
        debug!("Fetched {} stat records", records.len());
        Ok(records)
    }
}
