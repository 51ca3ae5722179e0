use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::size::SizeWarning;
use crate::Result;

mod asynchronous;
mod sync;

pub use asynchronous::{AsyncPublisher, DrainHandle};
pub use sync::SyncPublisher;

/// Publishing surface shared by [`SyncPublisher`] and [`AsyncPublisher`].
///
/// Values are JSON encoded unless sent with [`Publisher::write_string_with_key`].
#[async_trait]
pub trait Publisher: Send + Sync + Sized {
    /// Send an already encoded payload
    async fn write_bytes(&self, topic: &str, key: Option<&str>, payload: Bytes) -> Result<()>;

    async fn write<T>(&self, value: &T, topic: &str) -> Result<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        let payload = serde_json::to_vec(value)?;
        self.write_bytes(topic, None, Bytes::from(payload)).await
    }

    async fn write_with_key<T>(&self, value: &T, key: &str, topic: &str) -> Result<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        let payload = serde_json::to_vec(value)?;
        self.write_bytes(topic, Some(key), Bytes::from(payload)).await
    }

    async fn write_string_with_key(&self, value: &str, key: &str, topic: &str) -> Result<()> {
        self.write_bytes(topic, Some(key), Bytes::copy_from_slice(value.as_bytes())).await
    }

    /// Oversized payload reports, see [`SizeWarning`]
    fn subscribe_size_warnings(&self) -> broadcast::Receiver<SizeWarning>;

    /// Release the broker handle. Errors are logged.
    async fn close(self);
}
