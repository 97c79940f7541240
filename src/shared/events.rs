use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::modules::api::FileInfo;

/// エンジンが外部（UI 層など）へ通知するライフサイクルイベント。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    SyncStarted {
        count: usize,
    },
    OperationSynced {
        id: String,
    },
    OperationFailed {
        id: String,
        error: String,
    },
    SyncCompleted {
        synced_count: u32,
        failed_count: u32,
    },
    UploadProgress {
        task_id: String,
        progress: f64,
    },
    UploadCompleted {
        task_id: String,
        result: FileInfo,
    },
    UploadFailed {
        task_id: String,
        error: String,
    },
    NetworkChanged {
        online: bool,
    },
}

/// broadcast チャネルを使った pub/sub バス。
/// 購読は `subscribe` で受信機を取り、破棄すれば解除される。
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// イベントを発行する。購読者がいない場合は単に捨てられる。
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::SyncStarted { count: 2 });
        bus.emit(EngineEvent::OperationSynced { id: "op1".into() });
        bus.emit(EngineEvent::SyncCompleted {
            synced_count: 1,
            failed_count: 1,
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::SyncStarted { count: 2 }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::OperationSynced { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::SyncCompleted {
                synced_count: 1,
                failed_count: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.emit(EngineEvent::NetworkChanged { online: false });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_unsubscribed() {
        let bus = EventBus::new(4);
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
