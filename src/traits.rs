//! Seams between the fetchers and the remote APIs.
//!
//! The pipeline talks to the primary scroll API through [`ScrollSource`] and
//! to the reverse-lookup API through [`ReverseSource`]. The HTTP clients in
//! [`quake`](crate::quake) and [`fofa`](crate::fofa) are the production
//! implementations; tests plug in scripted ones.
//!
//! Both traits return one decoded page per call and leave protocol decisions
//! (error codes, termination, cursor handling) to the fetchers.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::FetchError;

/// One page of the primary scroll API, decoded but not yet judged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrollPage {
    /// Envelope status; `0` means success.
    pub code: i64,
    pub message: String,
    pub data: Vec<Value>,
    /// Continuation cursor (`meta.pagination_id`), absent on the last page.
    pub cursor: Option<String>,
}

/// One page of the reverse-lookup API.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReversePage {
    pub error: bool,
    pub errmsg: String,
    /// Positional rows following the requested field list.
    pub results: Vec<Value>,
    /// Continuation token, absent on the last page.
    pub next: Option<String>,
}

/// The primary asset search API (scroll semantics).
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use icp_sweep::error::FetchError;
/// use icp_sweep::traits::{ScrollPage, ScrollSource};
///
/// struct Empty;
///
/// #[async_trait]
/// impl ScrollSource for Empty {
///     async fn scroll(
///         &self,
///         _query: &str,
///         _size: usize,
///         _cursor: Option<&str>,
///     ) -> Result<ScrollPage, FetchError> {
///         Ok(ScrollPage::default())
///     }
/// }
/// ```
#[async_trait]
pub trait ScrollSource: Send + Sync {
    /// Request one page. `cursor` is `None` for the first request.
    async fn scroll(
        &self,
        query: &str,
        size: usize,
        cursor: Option<&str>,
    ) -> Result<ScrollPage, FetchError>;
}

/// The reverse-lookup search API.
#[async_trait]
pub trait ReverseSource: Send + Sync {
    /// Request one page for a base64-encoded query. `next` is `None` for the
    /// first request.
    async fn search_next(&self, qbase64: &str, next: Option<&str>)
        -> Result<ReversePage, FetchError>;

    /// Field projection the rows are laid out by.
    fn fields(&self) -> &[String];
}
