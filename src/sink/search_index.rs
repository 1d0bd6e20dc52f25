//! Sink that upserts events into a search/index store.
//!
//! Documents are written with `PUT /{index}/_doc/{uid}`, so redelivery of
//! the same event overwrites the existing document instead of adding a
//! second one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use super::{EventFilter, Sink, SinkError};
use crate::config::SearchIndexConfig;
use crate::config::secrets::clone_secret;
use crate::model::Event;

pub const NAME: &str = "search-index";

/// Outcome of a single index request that reached the store.
#[derive(Debug, Clone, Default)]
pub struct IndexResponse {
    pub status: u16,
    /// Deprecation and similar notices from `Warning` headers.
    pub warnings: Vec<String>,
    pub body: String,
}

impl IndexResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport to the index store.
#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), SinkError>;

    /// Create or replace the document `id` in `index`.
    async fn upsert(&self, index: &str, id: &str, body: Vec<u8>)
    -> Result<IndexResponse, SinkError>;
}

/// HTTP client for Elasticsearch-compatible stores.
///
/// Requests rotate across the configured addresses and fail over to the
/// next one on connection errors.
pub struct HttpIndexClient {
    http: reqwest::Client,
    addresses: Vec<Url>,
    next: AtomicUsize,
    username: Option<String>,
    password: Option<SecretString>,
}

impl HttpIndexClient {
    pub fn new(config: &SearchIndexConfig) -> Result<Self, SinkError> {
        if config.addresses.is_empty() {
            return Err(SinkError::InvalidConfig("no addresses".to_string()));
        }
        let addresses = config
            .addresses
            .iter()
            .map(|a| {
                Url::parse(a).map_err(|e| SinkError::InvalidConfig(format!("address {a}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout())
            .build()?;

        Ok(Self {
            http,
            addresses,
            next: AtomicUsize::new(0),
            username: config.username.clone(),
            password: config.password.as_ref().map(clone_secret),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_ref().map(|p| p.expose_secret())),
            None => req,
        }
    }

    /// Addresses in the order this request should try them.
    fn rotation(&self) -> impl Iterator<Item = &Url> {
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.addresses.len();
        self.addresses[start..]
            .iter()
            .chain(self.addresses[..start].iter())
    }
}

fn document_url(base: &Url, index: &str, id: &str) -> Result<Url, SinkError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| SinkError::InvalidConfig(format!("address {base} cannot be a base")))?
        .pop_if_empty()
        .extend([index, "_doc", id]);
    Ok(url)
}

#[async_trait]
impl IndexClient for HttpIndexClient {
    async fn ping(&self) -> Result<(), SinkError> {
        let mut last_err = String::new();
        for base in self.rotation() {
            match self.authorize(self.http.head(base.clone())).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => {
                    return Err(SinkError::Rejected {
                        status: resp.status().as_u16(),
                        body: "authentication failed".to_string(),
                    });
                }
                Ok(resp) => last_err = format!("{base}: status {}", resp.status()),
                Err(e) => last_err = format!("{base}: {e}"),
            }
        }
        Err(SinkError::Unreachable(last_err))
    }

    async fn upsert(
        &self,
        index: &str,
        id: &str,
        body: Vec<u8>,
    ) -> Result<IndexResponse, SinkError> {
        let mut last_err = None;
        for base in self.rotation() {
            let url = document_url(base, index, id)?;
            let req = self
                .http
                .put(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
            match self.authorize(req).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let warnings = resp
                        .headers()
                        .get_all(reqwest::header::WARNING)
                        .iter()
                        .filter_map(|v| v.to_str().ok().map(str::to_string))
                        .collect();
                    let body = resp.text().await?;
                    return Ok(IndexResponse {
                        status,
                        warnings,
                        body,
                    });
                }
                Err(e) if e.is_connect() => {
                    debug!(address = %base, "connect failed, trying next address: {e}");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(match last_err {
            Some(e) => e.into(),
            None => SinkError::Unreachable("no addresses".to_string()),
        })
    }
}

/// Upserts events keyed by UID.
pub struct SearchIndexSink<C = HttpIndexClient> {
    client: C,
    index: String,
    timeout: Duration,
    filter: EventFilter,
}

impl SearchIndexSink<HttpIndexClient> {
    /// Build the HTTP client and check the store is reachable.
    pub async fn connect(config: &SearchIndexConfig, filter: EventFilter) -> Result<Self, SinkError> {
        let client = HttpIndexClient::new(config)?;
        let sink = Self::with_client(client, config.index.clone(), config.timeout(), filter)?;
        match tokio::time::timeout(sink.timeout, sink.client.ping()).await {
            Ok(result) => result?,
            Err(_) => return Err(SinkError::Timeout(sink.timeout)),
        }
        Ok(sink)
    }
}

impl<C: IndexClient> SearchIndexSink<C> {
    /// Wrap an existing client. No reachability check.
    pub fn with_client(
        client: C,
        index: impl Into<String>,
        timeout: Duration,
        filter: EventFilter,
    ) -> Result<Self, SinkError> {
        let index = index.into();
        if index.trim().is_empty() {
            return Err(SinkError::InvalidConfig("empty index name".to_string()));
        }
        Ok(Self {
            client,
            index,
            timeout,
            filter,
        })
    }

    pub fn index(&self) -> &str {
        &self.index
    }
}

#[async_trait]
impl<C: IndexClient> Sink for SearchIndexSink<C> {
    fn name(&self) -> &str {
        NAME
    }

    fn filter(&self, event: &Event) -> bool {
        self.filter.matches(event)
    }

    async fn send(&self, event: &Event) -> Result<(), SinkError> {
        let body = serde_json::to_vec(event)?;
        let resp = tokio::time::timeout(
            self.timeout,
            self.client.upsert(&self.index, event.uid.as_str(), body),
        )
        .await
        .map_err(|_| SinkError::Timeout(self.timeout))??;

        if !resp.warnings.is_empty() {
            warn!(sink = NAME, uid = %event.uid, warnings = ?resp.warnings, "request to index store returned warnings");
        }
        if !resp.is_success() {
            return Err(SinkError::Rejected {
                status: resp.status,
                body: resp.body,
            });
        }
        Ok(())
    }

    async fn close(&self) {}
}
