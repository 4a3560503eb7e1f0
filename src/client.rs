//! HTTP client for the agent API
//!
//! Used by the command-line tool and by integration tests.

use reqwest::StatusCode;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::ipam::NodeStatus;
use crate::server::{AddressInfoResponse, AllocateRequest};

#[derive(Error, Debug)]
pub enum ClientError {
    /// The agent answered with an error body
    #[error("agent returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid address in response: {0}")]
    InvalidAddress(String),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Client for one agent
#[derive(Debug, Clone)]
pub struct IpamClient {
    base_url: String,
    http: reqwest::Client,
}

impl IpamClient {
    /// `base_url` like `http://127.0.0.1:9383`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn allocate(
        &self,
        namespace: &str,
        pod_name: &str,
        container_id: &str,
    ) -> Result<IpAddr, ClientError> {
        let body = AllocateRequest {
            pod_namespace: namespace.to_string(),
            pod_name: pod_name.to_string(),
            container_id: container_id.to_string(),
        };
        let response = self
            .http
            .post(format!("{}/ip", self.base_url))
            .json(&body)
            .send()
            .await?;
        let info: AddressInfoResponse = Self::decode(response).await?;
        parse_address(&info.address)
    }

    /// Address held by `container_id`
    pub async fn lookup(&self, container_id: &str) -> Result<IpAddr, ClientError> {
        let response = self
            .http
            .get(format!("{}/ip/{}", self.base_url, container_id))
            .send()
            .await?;
        let info: AddressInfoResponse = Self::decode(response).await?;
        parse_address(&info.address)
    }

    /// Release a pod's address; `None` when the agent had nothing to free.
    pub async fn release(
        &self,
        namespace: &str,
        pod_name: &str,
        container_id: &str,
    ) -> Result<Option<IpAddr>, ClientError> {
        let response = self
            .http
            .delete(format!(
                "{}/ip/{}/{}/{}",
                self.base_url, namespace, pod_name, container_id
            ))
            .send()
            .await?;
        let info: AddressInfoResponse = Self::decode(response).await?;
        if info.address.is_empty() {
            return Ok(None);
        }
        parse_address(&info.address).map(Some)
    }

    pub async fn status(&self) -> Result<NodeStatus, ClientError> {
        let response = self
            .http
            .get(format!("{}/status", self.base_url))
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status == StatusCode::OK {
            return Ok(response.json::<T>().await?);
        }

        let text = response.text().await.unwrap_or_default();
        debug!(status = %status, body = %text, "Agent returned an error");
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.error)
            .unwrap_or(text);
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

fn parse_address(s: &str) -> Result<IpAddr, ClientError> {
    s.parse()
        .map_err(|_| ClientError::InvalidAddress(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let client = IpamClient::new("http://127.0.0.1:9383/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url, "http://127.0.0.1:9383");
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("10.0.0.1").unwrap(),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert!(matches!(
            parse_address("nope"),
            Err(ClientError::InvalidAddress(_))
        ));
    }
}
