//! The bulk document loader consumed by the diff queue.

use std::future::Future;

use crate::case::Document;

/// Loads full documents by id from one of the two backends.
///
/// Implementations must tolerate ids that no longer exist: the result may
/// hold fewer documents than requested, and the caller treats the gap as
/// missing documents. Order of the result is not significant.
pub trait DocumentLoader: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn load<'a>(
    &'a self,
    ids: &'a [String],
  ) -> impl Future<Output = Result<Vec<Document>, Self::Error>> + Send + 'a;
}

impl<T: DocumentLoader> DocumentLoader for std::sync::Arc<T> {
  type Error = T::Error;

  fn load<'a>(
    &'a self,
    ids: &'a [String],
  ) -> impl Future<Output = Result<Vec<Document>, Self::Error>> + Send + 'a {
    (**self).load(ids)
  }
}
