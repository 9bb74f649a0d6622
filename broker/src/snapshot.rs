use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};
use crate::types::{QueueEntry, QueueId, Subscription};

/// Persisted state of one queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub exclusive: bool,
    /// Live entries in FIFO order
    pub entries: Vec<QueueEntry>,
}

/// Everything needed to rebuild the broker after a restart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub subscriptions: Vec<Subscription>,
    pub queues: BTreeMap<QueueId, QueueRecord>,
}

/// JSON snapshot file.
///
/// Writes go to a sibling temp file first and are renamed into place, so a crash mid-write never
/// leaves a truncated snapshot behind.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, snapshot: &BrokerSnapshot) -> BrokerResult<()> {
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|err| BrokerError::Snapshot(err.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| BrokerError::Snapshot(format!("creating {}: {}", parent.display(), err)))?;
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|err| BrokerError::Snapshot(format!("writing {}: {}", tmp.display(), err)))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| BrokerError::Snapshot(format!("renaming {}: {}", tmp.display(), err)))?;

        debug!(
            "snapshot saved to {} ({} subscriptions, {} queues)",
            self.path.display(),
            snapshot.subscriptions.len(),
            snapshot.queues.len()
        );
        Ok(())
    }

    /// Reads the snapshot; a missing file means a fresh broker
    pub async fn load(&self) -> BrokerResult<Option<BrokerSnapshot>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(BrokerError::Snapshot(format!(
                    "reading {}: {}",
                    self.path.display(),
                    err
                )));
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| BrokerError::Snapshot(format!("decoding {}: {}", self.path.display(), err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{RoutingKey, TopicPattern};
    use crate::types::{DeliveryState, Event, SubscriptionId};

    fn snapshot() -> BrokerSnapshot {
        let queue_id = QueueId::new("mailers");
        let subscription = Subscription::new(
            SubscriptionId::new("s1"),
            "product.exchange",
            TopicPattern::parse("product.*").unwrap(),
            queue_id.clone(),
        )
        .in_group("mailers");

        let entry = QueueEntry {
            event: Event::new(
                "product.exchange",
                RoutingKey::parse("product.created").unwrap(),
                "Widget",
            ),
            delivery_state: DeliveryState::Delivered,
            attempt_count: 2,
            last_attempt_at: Some(chrono::Utc::now()),
        };

        BrokerSnapshot {
            subscriptions: vec![subscription],
            queues: BTreeMap::from([(
                queue_id,
                QueueRecord {
                    exclusive: false,
                    entries: vec![entry],
                },
            )]),
        }
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state").join("broker.json"));

        assert!(store.load().await.unwrap().is_none());

        let original = snapshot();
        store.save(&original).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(original));
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let result = SnapshotStore::new(path).load().await;
        assert!(matches!(result, Err(BrokerError::Snapshot(_))));
    }
}
