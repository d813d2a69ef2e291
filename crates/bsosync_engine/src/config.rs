//! Configuration for the sync engine.

use std::time::Duration;

/// Kind of client running the engine.
///
/// Mobile clients download a bounded first page and defer the rest to
/// explicit ID fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    /// Unbounded first page.
    #[default]
    Desktop,
    /// First page bounded by [`EngineConfig::mobile_batch_size`].
    Mobile,
}

/// Configuration for one collection's sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Collection name, also the engine's key in `meta/global`.
    pub collection: String,
    /// Engine storage format version.
    pub version: u32,
    /// Client type.
    pub client_type: ClientType,
    /// First page size on mobile clients.
    pub mobile_batch_size: usize,
    /// Optional limit on IDs listed when the first page overflows.
    pub download_limit: Option<usize>,
    /// IDs per explicit fetch on desktop clients.
    pub guid_fetch_batch_size: usize,
    /// IDs per explicit fetch on mobile clients.
    pub mobile_guid_fetch_batch_size: usize,
    /// Records handed to the store at once.
    pub apply_batch_size: usize,
    /// Records per upload request.
    pub max_upload_records: usize,
    /// IDs per delete request.
    pub max_delete_ids: usize,
    /// Concurrent explicit fetch requests.
    pub fetch_concurrency: usize,
    /// Minimum time between two key refreshes triggered by HMAC errors.
    pub hmac_event_interval: Duration,
}

impl EngineConfig {
    /// Creates a desktop configuration with default limits.
    pub fn new(collection: impl Into<String>, version: u32) -> Self {
        Self {
            collection: collection.into(),
            version,
            client_type: ClientType::Desktop,
            mobile_batch_size: 50,
            download_limit: None,
            guid_fetch_batch_size: 50,
            mobile_guid_fetch_batch_size: 50,
            apply_batch_size: 1,
            max_upload_records: 100,
            max_delete_ids: 100,
            fetch_concurrency: 4,
            hmac_event_interval: Duration::from_secs(600),
        }
    }

    /// Sets the client type.
    pub fn with_client_type(mut self, client_type: ClientType) -> Self {
        self.client_type = client_type;
        self
    }

    /// Sets the mobile first page size.
    pub fn with_mobile_batch_size(mut self, size: usize) -> Self {
        self.mobile_batch_size = size.max(1);
        self
    }

    /// Limits the IDs listed after an overflowing first page.
    pub fn with_download_limit(mut self, limit: usize) -> Self {
        self.download_limit = Some(limit);
        self
    }

    /// Sets the explicit fetch batch size for both client types.
    pub fn with_guid_fetch_batch_size(mut self, size: usize) -> Self {
        let size = size.max(1);
        self.guid_fetch_batch_size = size;
        self.mobile_guid_fetch_batch_size = size;
        self
    }

    /// Sets the apply batch size.
    pub fn with_apply_batch_size(mut self, size: usize) -> Self {
        self.apply_batch_size = size.max(1);
        self
    }

    /// Sets the upload batch size.
    pub fn with_max_upload_records(mut self, size: usize) -> Self {
        self.max_upload_records = size.max(1);
        self
    }

    /// Sets the delete batch size.
    pub fn with_max_delete_ids(mut self, size: usize) -> Self {
        self.max_delete_ids = size.max(1);
        self
    }

    /// Sets the number of concurrent explicit fetches.
    pub fn with_fetch_concurrency(mut self, workers: usize) -> Self {
        self.fetch_concurrency = workers.max(1);
        self
    }

    /// Sets the HMAC event interval.
    pub fn with_hmac_event_interval(mut self, interval: Duration) -> Self {
        self.hmac_event_interval = interval;
        self
    }

    /// Returns true for mobile clients.
    pub fn is_mobile(&self) -> bool {
        self.client_type == ClientType::Mobile
    }

    /// Limit for the first incoming page; `None` means unbounded.
    pub fn first_page_limit(&self) -> Option<usize> {
        self.is_mobile().then_some(self.mobile_batch_size)
    }

    /// IDs per explicit fetch for this client type.
    pub fn guid_batch_size(&self) -> usize {
        let size = if self.is_mobile() {
            self.mobile_guid_fetch_batch_size
        } else {
            self.guid_fetch_batch_size
        };
        size.max(1)
    }

    /// IDs per delete request.
    pub fn delete_batch_size(&self) -> usize {
        self.max_delete_ids.max(1)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("", 1)
    }
}
