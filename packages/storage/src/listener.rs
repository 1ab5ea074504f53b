use futures::{StreamExt, stream::BoxStream};
use services::broadcaster::port::bus::Subscriber;
use sqlx::postgres::PgListener;
use tracing::error;

use crate::Postgres;

/// Postgres channel the insert trigger notifies on; the payload is the
/// hex-encoded sender address.
pub const TX_INSERT_CHANNEL: &str = "broadcaster_insert_tx";

/// Insert-notification bus backed by `LISTEN`/`NOTIFY`.
///
/// Notifications are best-effort wake-ups; if the stream dies the
/// workers fall back to their poll timers, so the stream simply ends on
/// an unrecoverable listener error.
pub struct TxInsertListener {
    db: Postgres,
}

impl TxInsertListener {
    pub fn new(db: Postgres) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl Subscriber for TxInsertListener {
    async fn subscribe(&self) -> services::Result<BoxStream<'static, String>> {
        let mut listener = PgListener::connect_with(&self.db.pool())
            .await
            .map_err(|e| services::Error::Storage(e.to_string()))?;
        listener
            .listen(TX_INSERT_CHANNEL)
            .await
            .map_err(|e| services::Error::Storage(e.to_string()))?;

        Ok(futures::stream::unfold(listener, |mut listener| async move {
            match listener.recv().await {
                Ok(notification) => Some((notification.payload().to_owned(), listener)),
                Err(e) => {
                    error!("insert-notification listener failed: {e}");
                    None
                }
            }
        })
        .boxed())
    }
}
