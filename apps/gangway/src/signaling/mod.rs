//! Offer/answer exchange with the host.
//!
//! Hosts with a known address are reached with a single HTTP round trip to
//! `/connect`. Hosts known only by fingerprint get their offer through the
//! rendezvous service; their answer comes back asynchronously and is routed
//! to the session by the session manager.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use thiserror::Error;

use crate::transport::{SessionDescription, TransportError};

pub mod rendezvous;

pub use rendezvous::{
    PeerRecord, RendezvousClient, RendezvousConfig, RendezvousError, RendezvousMessage,
    RendezvousSignaling,
};

const TARGET: &str = "gangway::signaling";

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("signaling endpoint returned {0}")]
    Status(StatusCode),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid session description: {0}")]
    Json(#[from] serde_json::Error),
    #[error("host has neither an address nor a rendezvous fingerprint")]
    NoRoute,
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
    #[error("could not produce local description: {0}")]
    LocalDescription(#[from] TransportError),
}

/// Where an offer should go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalTarget {
    /// `host:port` of the host's signaling endpoint.
    pub addr: Option<String>,
    pub fingerprint: Option<String>,
}

#[async_trait]
pub trait SignalingBackend: Send + Sync {
    /// Delivers `offer`. `Ok(None)` means the answer will arrive later
    /// through the rendezvous channel.
    async fn exchange(
        &self,
        target: &SignalTarget,
        offer: &SessionDescription,
    ) -> Result<Option<SessionDescription>, SignalingError>;
}

pub fn encode_description(description: &SessionDescription) -> Result<String, SignalingError> {
    let json = serde_json::to_vec(description)?;
    Ok(STANDARD.encode(json))
}

pub fn decode_description(payload: &str) -> Result<SessionDescription, SignalingError> {
    let json = STANDARD.decode(payload.trim())?;
    Ok(serde_json::from_slice(&json)?)
}

#[derive(Clone)]
pub struct HttpSignaling {
    client: reqwest::Client,
}

impl HttpSignaling {
    pub fn new() -> Result<Self, SignalingError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn endpoint(addr: &str) -> String {
        format!("http://{}/connect", addr.trim_end_matches('/'))
    }

    pub async fn post_offer(
        &self,
        addr: &str,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, SignalingError> {
        let url = Self::endpoint(addr);
        let body = encode_description(offer)?;
        tracing::debug!(target: TARGET, url = %url, "posting offer");
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SignalingError::Status(status));
        }
        let text = response.text().await?;
        let answer = decode_description(&text)?;
        tracing::debug!(target: TARGET, url = %url, kind = %answer.kind, "received answer");
        Ok(answer)
    }
}

#[async_trait]
impl SignalingBackend for HttpSignaling {
    async fn exchange(
        &self,
        target: &SignalTarget,
        offer: &SessionDescription,
    ) -> Result<Option<SessionDescription>, SignalingError> {
        let addr = target.addr.as_deref().ok_or(SignalingError::NoRoute)?;
        self.post_offer(addr, offer).await.map(Some)
    }
}

/// HTTP when the host has an address, rendezvous otherwise.
pub struct RoutedSignaling {
    http: HttpSignaling,
    rendezvous: Option<Arc<dyn SignalingBackend>>,
}

impl RoutedSignaling {
    pub fn new(http: HttpSignaling, rendezvous: Option<Arc<dyn SignalingBackend>>) -> Self {
        Self { http, rendezvous }
    }
}

#[async_trait]
impl SignalingBackend for RoutedSignaling {
    async fn exchange(
        &self,
        target: &SignalTarget,
        offer: &SessionDescription,
    ) -> Result<Option<SessionDescription>, SignalingError> {
        if target.addr.is_some() {
            return self.http.exchange(target, offer).await;
        }
        match (&self.rendezvous, &target.fingerprint) {
            (Some(rendezvous), Some(_)) => rendezvous.exchange(target, offer).await,
            _ => Err(SignalingError::NoRoute),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_payload_is_base64_json() {
        let offer = SessionDescription::offer("v=0");
        let encoded = encode_description(&offer).unwrap();
        let raw = STANDARD.decode(&encoded).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value, serde_json::json!({"type": "offer", "sdp": "v=0"}));
        assert_eq!(decode_description(&format!("{encoded}\n")).unwrap(), offer);
    }

    #[test]
    fn rejects_garbage_payload() {
        assert!(matches!(
            decode_description("***"),
            Err(SignalingError::Base64(_))
        ));
        let not_json = STANDARD.encode("hello");
        assert!(matches!(
            decode_description(&not_json),
            Err(SignalingError::Json(_))
        ));
    }

    #[test]
    fn endpoint_targets_connect_path() {
        assert_eq!(
            HttpSignaling::endpoint("10.0.0.2:7777"),
            "http://10.0.0.2:7777/connect"
        );
    }

    #[tokio::test]
    async fn routed_without_address_or_rendezvous_has_no_route() {
        let routed = RoutedSignaling::new(HttpSignaling::new().unwrap(), None);
        let target = SignalTarget {
            addr: None,
            fingerprint: Some("abc".into()),
        };
        let result = routed
            .exchange(&target, &SessionDescription::offer("v=0"))
            .await;
        assert!(matches!(result, Err(SignalingError::NoRoute)));
    }
}
