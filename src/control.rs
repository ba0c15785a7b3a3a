//! Control channels consumed by the lifecycle loop.
//!
//! The management API (out of process scope here) gets a `ControlHandle`;
//! the main loop owns the receiving side. Sends are non-blocking and
//! idempotent: firing shutdown twice, or after the loop already exited,
//! is harmless.

use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct ControlHandle {
    shutdown: mpsc::Sender<()>,
    reload: mpsc::Sender<()>,
    upgrade: mpsc::Sender<String>,
}

impl ControlHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.try_send(());
    }

    pub fn reload(&self) {
        let _ = self.reload.try_send(());
    }

    pub fn upgrade(&self, artifact: String) {
        let _ = self.upgrade.try_send(artifact);
    }
}

pub struct ControlChannels {
    pub shutdown: mpsc::Receiver<()>,
    pub reload: mpsc::Receiver<()>,
    pub upgrade: mpsc::Receiver<String>,
}

pub fn channels() -> (ControlHandle, ControlChannels) {
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (reload_tx, reload_rx) = mpsc::channel(1);
    let (upgrade_tx, upgrade_rx) = mpsc::channel(1);
    (
        ControlHandle {
            shutdown: shutdown_tx,
            reload: reload_tx,
            upgrade: upgrade_tx,
        },
        ControlChannels {
            shutdown: shutdown_rx,
            reload: reload_rx,
            upgrade: upgrade_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_signals_do_not_block() {
        let (handle, mut channels) = channels();
        handle.shutdown();
        handle.shutdown();
        handle.shutdown();
        assert!(channels.shutdown.recv().await.is_some());

        drop(channels);
        // Sending after the loop is gone is a no-op.
        handle.reload();
        handle.upgrade("shuttle.zip".to_string());
    }
}
