//! mqtt broker 的客户端会话层
//!
//! 每个客户端对应一个 [`Session`]，负责：
//! * 发给客户端的消息队列，由单独的协程按顺序写入连接
//! * QoS1, QoS2 收发两个方向的确认状态
//! * 订阅列表，保留消息，遗嘱消息
//! * 连接断开与重连时的状态交接
//!
//! 网络读写、主题匹配、持久化都由使用者实现，会话只依赖
//! [`network::Connection`]，[`topics::TopicsManager`] 和 [`Manager`] 三个接口

pub mod config;
pub mod error;
pub mod network;
pub mod packet;
mod protocol;
pub mod topics;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use protocol::{
    AckStatus, AckTracker, Direction, Message, Options, Session, SessionMessages, Subscriptions,
};

use packet::Publish;

/// 会话的拥有者（broker）需要实现的回调
pub trait Manager: Send + Sync + 'static {
    /// 持久化会话 stop 时调用，带上最终的订阅列表
    fn on_close(&self, id: &str, subscriptions: Subscriptions);
    /// 连接断开时调用，交出还没有投递完成的消息
    /// suspend = true 表示会话需要保留，false 表示会话可以删除
    fn on_disconnect(&self, id: &str, messages: SessionMessages, suspend: bool);
    /// 客户端不在线时收到的 QoS0 消息
    fn on_publish(&self, id: &str, publish: Publish);
}

pub struct ManagerNoop;

impl Manager for ManagerNoop {
    fn on_close(&self, _id: &str, _subscriptions: Subscriptions) {}

    fn on_disconnect(&self, _id: &str, _messages: SessionMessages, _suspend: bool) {}

    fn on_publish(&self, _id: &str, _publish: Publish) {}
}
