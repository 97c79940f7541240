use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::info;

/// 観測された接続品質。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Offline,
    /// 繋がってはいるが不安定。同期は走らせるが転送は控えめにしたい状態。
    Poor,
    Good,
}

/// 接続状態の観測点。プラットフォーム層が `report` で変化を流し込み、
/// エンジン側は watch チャネル越しに遷移を購読する。
pub struct NetworkMonitor {
    state: watch::Sender<ConnectionQuality>,
    /// 設定による強制オフライン。有効な間は観測値に関わらず offline 扱い。
    offline_mode: AtomicBool,
}

impl NetworkMonitor {
    pub fn new(offline_mode: bool) -> Self {
        let (state, _) = watch::channel(ConnectionQuality::Good);
        Self {
            state,
            offline_mode: AtomicBool::new(offline_mode),
        }
    }

    pub fn is_online(&self) -> bool {
        if self.offline_mode.load(Ordering::SeqCst) {
            return false;
        }
        *self.state.borrow() != ConnectionQuality::Offline
    }

    pub fn quality(&self) -> ConnectionQuality {
        if self.offline_mode.load(Ordering::SeqCst) {
            return ConnectionQuality::Offline;
        }
        *self.state.borrow()
    }

    /// 接続品質の変化を通知する。同一値の連続報告は購読側に流れない。
    pub fn report(&self, quality: ConnectionQuality) {
        let changed = self.state.send_if_modified(|current| {
            if *current == quality {
                false
            } else {
                *current = quality;
                true
            }
        });
        if changed {
            info!(target: "network", quality = ?quality, "connection quality changed");
        }
    }

    pub fn set_offline_mode(&self, enabled: bool) {
        self.offline_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionQuality> {
        self.state.subscribe()
    }
}
