//! Client for the breakpoint control plane.
//!
//! Three calls, all authenticated with the static API key header:
//!
//! - `GET  {endpoint}/sdk/snapshots/active/{service}` returns `{"breakpoints": [...]}`
//! - `POST {endpoint}/sdk/snapshots/auto-register` returns the descriptor for a location
//! - `POST {endpoint}/sdk/snapshots/capture` accepts a [`Snapshot`]

use crate::breakpoints::{ActiveBreakpoints, BreakpointDescriptor, RegistrationRequest};
use crate::constants::{defaults, routes, API_KEY_HEADER};
use crate::error::{ApmError, Result};
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use bon::bon;
use reqwest::{header::HeaderValue, Client as ReqwestClient, RequestBuilder, Response};
use std::{fmt::Debug, time::Duration};
use url::Url;

#[async_trait]
pub trait ControlPlane: Send + Sync + Debug {
    /// Active breakpoints for a service.
    async fn fetch_active(&self, service_name: &str) -> Result<Vec<BreakpointDescriptor>>;

    /// Registers a capture point seen for the first time and returns its descriptor.
    async fn auto_register(&self, request: &RegistrationRequest) -> Result<BreakpointDescriptor>;

    async fn submit_capture(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Control plane used when the agent is inactive. Every call fails with [`ApmError::Disabled`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledControlPlane;

#[async_trait]
impl ControlPlane for DisabledControlPlane {
    async fn fetch_active(&self, _service_name: &str) -> Result<Vec<BreakpointDescriptor>> {
        Err(ApmError::Disabled)
    }

    async fn auto_register(&self, _request: &RegistrationRequest) -> Result<BreakpointDescriptor> {
        Err(ApmError::Disabled)
    }

    async fn submit_capture(&self, _snapshot: &Snapshot) -> Result<()> {
        Err(ApmError::Disabled)
    }
}

#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: ReqwestClient,
    base: Url,
    api_key: HeaderValue,
}

#[bon]
impl HttpControlPlane {
    #[builder]
    pub fn new(
        #[builder(into)] endpoint: String,
        #[builder(into)] api_key: String,
        client: Option<ReqwestClient>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let client = match client {
            Some(client) => client,
            None => ReqwestClient::builder()
                .timeout(timeout.unwrap_or(defaults::REQUEST_TIMEOUT))
                .build()?,
        };
        let mut api_key = HeaderValue::from_str(&api_key)?;
        api_key.set_sensitive(true);
        Ok(Self {
            client,
            base: Url::parse(endpoint.trim_end_matches('/'))?,
            api_key,
        })
    }
}

impl HttpControlPlane {
    /// `{endpoint}{route}` with any extra path segments percent-encoded.
    fn url(&self, route: &str, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(route.split('/').filter(|s| !s.is_empty()));
            path.extend(segments);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(API_KEY_HEADER, self.api_key.clone())
    }

    async fn check(url: &Url, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Could not read response body".to_string());
        Err(ApmError::Status {
            endpoint: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn fetch_active(&self, service_name: &str) -> Result<Vec<BreakpointDescriptor>> {
        let url = self.url(routes::ACTIVE_BREAKPOINTS, &[service_name]);
        tracing::debug!(url = %url, "Fetching active breakpoints");
        let response = self.authorized(self.client.get(url.clone())).send().await?;
        let active: ActiveBreakpoints = Self::check(&url, response).await?.json().await?;
        Ok(active.breakpoints)
    }

    async fn auto_register(&self, request: &RegistrationRequest) -> Result<BreakpointDescriptor> {
        let url = self.url(routes::AUTO_REGISTER, &[]);
        tracing::debug!(
            function = %request.function_name,
            file = %request.file_path,
            line = request.line_number,
            "Auto-registering capture point"
        );
        let response = self
            .authorized(self.client.post(url.clone()))
            .json(request)
            .send()
            .await?;
        Ok(Self::check(&url, response).await?.json().await?)
    }

    async fn submit_capture(&self, snapshot: &Snapshot) -> Result<()> {
        let url = self.url(routes::CAPTURE, &[]);
        let response = self
            .authorized(self.client.post(url.clone()))
            .json(snapshot)
            .send()
            .await?;
        Self::check(&url, response).await?;
        Ok(())
    }
}
