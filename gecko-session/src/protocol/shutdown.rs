use std::sync::Arc;

use tokio::sync::watch;

/// 一次连接的退出信号，触发后不会再重置
/// 新的连接使用新的信号
#[derive(Clone)]
pub(crate) struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// 已经触发过的信号，表示当前没有连接
    pub(crate) fn triggered() -> Self {
        let shutdown = Self::new();
        shutdown.trigger();
        shutdown
    }

    pub(crate) fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// 等待信号触发，已经触发时立即返回
    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}
