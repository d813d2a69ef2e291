//! Listing queries against a collection.

use crate::timestamp::ServerTimestamp;

/// Sort order for collection listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest modification first.
    Oldest,
    /// Newest modification first.
    Newest,
    /// Highest `sortindex` first.
    Index,
}

impl SortOrder {
    /// Returns the query parameter value.
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Oldest => "oldest",
            SortOrder::Newest => "newest",
            SortOrder::Index => "index",
        }
    }
}

/// Parameters for a collection listing.
///
/// `newer` and `older` are exclusive bounds. When `older` is set, `newer`
/// is not sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionQuery {
    /// Return full records instead of bare IDs.
    pub full: bool,
    /// Restrict to these IDs.
    pub ids: Option<Vec<String>>,
    /// Only records modified after this time.
    pub newer: Option<ServerTimestamp>,
    /// Only records modified before this time.
    pub older: Option<ServerTimestamp>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Result ordering.
    pub sort: Option<SortOrder>,
}

impl CollectionQuery {
    /// Creates an empty query (all IDs, server order).
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests full records.
    pub fn full(mut self) -> Self {
        self.full = true;
        self
    }

    /// Restricts to the given IDs.
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the exclusive lower bound. Zero means "no bound".
    pub fn newer_than(mut self, ts: ServerTimestamp) -> Self {
        self.newer = (!ts.is_zero()).then_some(ts);
        self
    }

    /// Sets the exclusive upper bound.
    pub fn older_than(mut self, ts: ServerTimestamp) -> Self {
        self.older = Some(ts);
        self
    }

    /// Sets the result limit. Zero means "no limit".
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = (limit > 0).then_some(limit);
        self
    }

    /// Sets the sort order.
    pub fn sort(mut self, order: SortOrder) -> Self {
        self.sort = Some(order);
        self
    }

    /// Builds the query string, including the leading `?` when non-empty.
    pub fn to_query_string(&self) -> String {
        let mut args = Vec::new();
        if let Some(older) = self.older {
            args.push(format!("older={older}"));
        } else if let Some(newer) = self.newer {
            args.push(format!("newer={newer}"));
        }
        if self.full {
            args.push("full=1".to_string());
        }
        if let Some(sort) = self.sort {
            args.push(format!("sort={}", sort.as_str()));
        }
        if let Some(ids) = &self.ids {
            args.push(format!("ids={}", ids.join(",")));
        }
        if let Some(limit) = self.limit {
            args.push(format!("limit={limit}"));
        }

        if args.is_empty() {
            String::new()
        } else {
            format!("?{}", args.join("&"))
        }
    }
}
