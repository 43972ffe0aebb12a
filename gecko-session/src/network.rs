//! 网络层接口
//! 会话层不关心报文的读写和编解码，只依赖这里定义的连接抽象

use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::packet::{Ack, Packet, Publish, Subscribe, Unsubscribe};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O: {0}")]
    IO(#[from] io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection already started")]
    AlreadyStarted,
}

/// 连接断开的原因，决定是否需要发送遗嘱消息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 客户端发送了 disconnect 报文
    Disconnect,
    /// 服务端主动关闭（session stop）
    Shutdown,
    /// 网络错误，keepalive 超时，协议错误等
    Unexpected,
}

impl CloseReason {
    /// 只有异常断开才发送遗嘱
    pub fn publish_will(&self) -> bool {
        matches!(self, CloseReason::Unexpected)
    }
}

/// 连接读到报文后的回调，由会话实现
/// 同一个连接上的回调不会并发调用
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// 客户端发布消息
    async fn on_publish(&self, publish: Publish) -> crate::Result<()>;
    /// 客户端发来 puback/pubrec/pubrel/pubcomp
    async fn on_ack(&self, ack: Ack) -> crate::Result<()>;
    /// 客户端订阅
    async fn on_subscribe(&self, subscribe: Subscribe) -> crate::Result<()>;
    /// 客户端取消订阅
    async fn on_unsubscribe(&self, unsubscribe: Unsubscribe) -> crate::Result<()>;
    /// 连接已断开
    async fn on_close(&self, reason: CloseReason);
}

/// 启动连接时传入的参数
pub struct ConnectionConfig {
    /// 客户端 id
    pub id: String,
    /// 在这个时间内没有读到任何报文，视为连接断开，None 表示不检测
    pub keep_alive: Option<Duration>,
    /// 报文回调
    pub handler: Arc<dyn Handler>,
}

/// 设备与服务器之间的一条连接
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// 开始读取报文，检测 keepalive
    /// 读到的报文通过 handler 交给会话处理
    fn start(&self, cfg: ConnectionConfig) -> Result<(), Error>;

    /// 写一个报文，返回写入的字节数
    async fn write_message(&self, packet: &Packet) -> Result<usize, Error>;

    /// 关闭连接
    async fn close(&self) -> Result<(), Error>;
}
