use std::sync::Arc;
use std::time::Duration;

use keyminter_contracts::Update;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispatcher::CommandDispatcher;
use crate::gateway::{GatewayError, TelegramGateway};

const RETRY_DELAY: Duration = Duration::from_secs(3);

/// `getUpdates` loop for deployments without a public webhook URL.
pub struct UpdatePoller {
    telegram: Arc<TelegramGateway>,
    dispatcher: Arc<CommandDispatcher>,
    wait_s: u64,
    offset: Option<i64>,
}

impl UpdatePoller {
    pub fn new(
        telegram: Arc<TelegramGateway>,
        dispatcher: Arc<CommandDispatcher>,
        wait_s: u64,
    ) -> Self {
        Self {
            telegram,
            dispatcher,
            wait_s,
            offset: None,
        }
    }

    /// Next `offset` sent to Telegram.
    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    /// Fetches one batch and handles it in order. Returns how many updates
    /// Telegram delivered, malformed ones included.
    pub async fn poll_once(&mut self) -> Result<usize, GatewayError> {
        let batch = self.telegram.get_updates(self.offset, self.wait_s).await?;
        self.handle_batch(&batch).await;
        Ok(batch.len())
    }

    async fn handle_batch(&mut self, batch: &[Value]) {
        for raw in batch {
            // advance past every delivered id, even ones we cannot decode
            if let Some(id) = raw.get("update_id").and_then(Value::as_i64) {
                self.offset = Some(self.offset.map_or(id + 1, |o| o.max(id + 1)));
            }
            match serde_json::from_value::<Update>(raw.clone()) {
                Ok(update) => {
                    self.dispatcher
                        .respond(&update, self.telegram.as_ref())
                        .await
                }
                Err(err) => warn!(error = %err, "skipping malformed update"),
            }
        }
    }

    /// Polls until `stop` flips to true or its sender goes away. Only the
    /// fetch is cancelled on stop; a batch already received is handled in
    /// full.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(wait_s = self.wait_s, "polling telegram for updates");
        loop {
            if *stop.borrow() {
                break;
            }
            let fetched = tokio::select! {
                _ = stop.changed() => break,
                fetched = self.telegram.get_updates(self.offset, self.wait_s) => fetched,
            };
            match fetched {
                Ok(batch) => {
                    debug!(count = batch.len(), "received updates");
                    self.handle_batch(&batch).await;
                }
                Err(err) => {
                    warn!(error = %err, retry_in_s = RETRY_DELAY.as_secs(), "getUpdates failed");
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }
        info!(offset = ?self.offset, "polling stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::tests::{FixedKeys, ScriptedStore};
    use crate::issuer::{KeyIssuer, LookupFailMode};
    use serde_json::json;

    fn poller() -> UpdatePoller {
        let dispatcher = CommandDispatcher::new(KeyIssuer::new(
            Arc::new(ScriptedStore::new(Ok(false))),
            Arc::new(FixedKeys::new("k")),
            LookupFailMode::Allow,
        ));
        let telegram =
            TelegramGateway::new("http://127.0.0.1:1", "1:t", Duration::from_millis(200)).unwrap();
        UpdatePoller::new(Arc::new(telegram), Arc::new(dispatcher), 0)
    }

    #[tokio::test]
    async fn offset_moves_past_highest_id_including_undecodable() {
        let mut p = poller();
        assert_eq!(p.offset(), None);
        p.handle_batch(&[
            json!({"update_id": 7}),
            json!({"update_id": 9, "message": 5}),
            json!({"update_id": 8}),
        ])
        .await;
        assert_eq!(p.offset(), Some(10));

        p.handle_batch(&[json!({"no_id": true})]).await;
        assert_eq!(p.offset(), Some(10));
    }

    #[tokio::test]
    async fn run_returns_once_stopped() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(poller().run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("poller stops within the retry pause")
            .unwrap();
    }
}
