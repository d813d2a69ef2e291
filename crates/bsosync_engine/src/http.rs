//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via [`HttpClient`] so any library
//! (reqwest, ureq, hyper) can be plugged in. [`HttpTransport`] builds the
//! storage URLs, encodes JSON bodies and maps status codes to errors.

use crate::error::{SyncError, SyncResult};
use crate::transport::StorageTransport;
use bsosync_protocol::{
    Bso, CollectionPage, CollectionQuery, InfoCollections, MetaGlobal, ServerTimestamp,
    UploadResponse, GLOBAL_ID, META_COLLECTION,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Response returned by an [`HttpClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Value of the server timestamp header, if present.
    pub timestamp: Option<ServerTimestamp>,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, timestamp: Option<ServerTimestamp>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            timestamp,
            body: body.into(),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// `Err` means no response was received (connection refused, timeout).
pub trait HttpClient: Send + Sync {
    /// Sends a GET request.
    fn get(&self, url: &str) -> Result<HttpResponse, String>;

    /// Sends a POST request with a JSON body.
    fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, String>;

    /// Sends a PUT request with a JSON body.
    fn put(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, String>;

    /// Sends a DELETE request.
    fn delete(&self, url: &str) -> Result<HttpResponse, String>;
}

/// [`StorageTransport`] over HTTP.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the user's storage node, without a trailing slash.
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn collection_url(&self, collection: &str, query: &CollectionQuery) -> String {
        format!(
            "{}/storage/{}{}",
            self.base_url,
            collection,
            query.to_query_string()
        )
    }

    fn record_url(&self, collection: &str, id: &str) -> String {
        format!("{}/storage/{}/{}", self.base_url, collection, id)
    }

    /// Turns a client result into a response, mapping failures to errors.
    /// 404 is passed through for callers that treat it as "absent".
    fn check(&self, url: &str, result: Result<HttpResponse, String>) -> SyncResult<HttpResponse> {
        let response = result.map_err(|e| {
            warn!(url, error = %e, "request failed");
            *self.last_error.write() = Some(e.clone());
            SyncError::transport_retryable(e)
        })?;

        if response.is_success() || response.status == 404 {
            *self.last_error.write() = None;
            return Ok(response);
        }

        let message = String::from_utf8_lossy(&response.body).into_owned();
        *self.last_error.write() = Some(format!("{}: {}", response.status, message));
        debug!(url, status = response.status, "error response");

        match response.status {
            401 | 403 => Err(SyncError::AuthenticationFailed(message)),
            status => Err(SyncError::ServerError { status, message }),
        }
    }

    fn decode<T: DeserializeOwned>(response: &HttpResponse) -> SyncResult<T> {
        Ok(serde_json::from_slice(&response.body)?)
    }

    fn not_found(status: u16, url: &str) -> SyncError {
        SyncError::ServerError {
            status,
            message: format!("not found: {url}"),
        }
    }
}

impl<C: HttpClient> StorageTransport for HttpTransport<C> {
    fn info_collections(&self) -> SyncResult<InfoCollections> {
        let url = format!("{}/info/collections", self.base_url);
        let response = self.check(&url, self.client.get(&url))?;
        if response.status == 404 {
            return Ok(InfoCollections::new());
        }
        Self::decode(&response)
    }

    fn get_record(&self, collection: &str, id: &str) -> SyncResult<Option<Bso>> {
        let url = self.record_url(collection, id);
        let response = self.check(&url, self.client.get(&url))?;
        if response.status == 404 {
            return Ok(None);
        }
        Ok(Some(Self::decode(&response)?))
    }

    fn get(&self, collection: &str, query: &CollectionQuery) -> SyncResult<CollectionPage> {
        let query = query.clone().full();
        let url = self.collection_url(collection, &query);
        let response = self.check(&url, self.client.get(&url))?;
        if response.status == 404 {
            return Ok(CollectionPage::new(
                Vec::new(),
                response.timestamp.unwrap_or_default(),
            ));
        }

        let records: Vec<Bso> = Self::decode(&response)?;
        let server_time = response
            .timestamp
            .or_else(|| records.iter().map(|r| r.modified).max())
            .unwrap_or_default();
        Ok(CollectionPage::new(records, server_time))
    }

    fn get_ids(&self, collection: &str, query: &CollectionQuery) -> SyncResult<Vec<String>> {
        let mut query = query.clone();
        query.full = false;
        let url = self.collection_url(collection, &query);
        let response = self.check(&url, self.client.get(&url))?;
        if response.status == 404 {
            return Ok(Vec::new());
        }
        Self::decode(&response)
    }

    fn post(&self, collection: &str, records: &[Bso]) -> SyncResult<UploadResponse> {
        let url = self.collection_url(collection, &CollectionQuery::new());
        let body = serde_json::to_vec(records)?;
        let response = self.check(&url, self.client.post(&url, body))?;
        if response.status == 404 {
            return Err(Self::not_found(404, &url));
        }

        let mut upload: UploadResponse = Self::decode(&response)?;
        if upload.modified.is_zero() {
            upload.modified = response.timestamp.unwrap_or_default();
        }
        Ok(upload)
    }

    fn delete(&self, collection: &str, ids: Option<&[String]>) -> SyncResult<ServerTimestamp> {
        let query = match ids {
            Some(ids) => CollectionQuery::new().ids(ids.iter().cloned()),
            None => CollectionQuery::new(),
        };
        let url = self.collection_url(collection, &query);
        let response = self.check(&url, self.client.delete(&url))?;
        Ok(response.timestamp.unwrap_or_default())
    }

    fn put_meta_global(&self, meta: &MetaGlobal) -> SyncResult<ServerTimestamp> {
        let url = self.record_url(META_COLLECTION, GLOBAL_ID);
        let body = serde_json::to_vec(&meta.to_bso()?)?;
        let response = self.check(&url, self.client.put(&url, body))?;
        if response.status == 404 {
            return Err(Self::not_found(404, &url));
        }
        Ok(response.timestamp.unwrap_or_default())
    }
}
