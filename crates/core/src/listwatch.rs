use futures::stream::BoxStream;

use crate::{Error, Object, Result, Selector};

/// Point-in-time bulk fetch of a collection.
#[derive(Debug, Clone)]
pub struct ListResult<K> {
    pub items: Vec<K>,
    /// Resume token for the first watch after this list.
    pub resource_version: String,
}

/// One item of a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Advances the resume token without an object change.
    Bookmark(String),
    /// `Expired` forces a full list, `Malformed` is skipped, anything else
    /// ends the stream.
    Error(Error),
}

pub type WatchStream<K> = BoxStream<'static, WatchEvent<K>>;

/// Remote collection exposing list and resumable watch.
///
/// Streams end when the remote side closes them; callers race both calls
/// against their own cancellation signal.
#[async_trait::async_trait]
pub trait ListWatcher: Send + Sync + 'static {
    type Object: Object;

    async fn list(&self, selector: &Selector) -> Result<ListResult<Self::Object>>;

    async fn watch(&self, selector: &Selector, resource_version: &str) -> Result<WatchStream<Self::Object>>;
}
