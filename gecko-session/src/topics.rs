//! 主题管理接口
//! 订阅匹配和消息分发由 broker 实现，会话只通过这里的接口和它交互

use std::sync::Arc;

use crate::packet::{Publish, QoS};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid subscribe filter: {0}")]
    InvalidSubscribeFilter(String),
    #[error("Invalid publish topic: {0}")]
    InvalidPublishTopic(String),
    #[error("Subscriber {0} is gone")]
    SubscriberGone(String),
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// 订阅者，主题匹配成功后由主题管理器调用
pub trait Subscriber: Send + Sync {
    /// 订阅者的客户端 id
    fn id(&self) -> &str;

    /// 把匹配到的消息交给订阅者
    fn publish(&self, publish: &Publish) -> Result<(), Error>;
}

pub trait TopicsManager: Send + Sync {
    fn subscribe(&self, filter: &str, qos: QoS, subscriber: Arc<dyn Subscriber>)
        -> Result<(), Error>;

    fn unsubscribe(&self, filter: &str, subscriber: &dyn Subscriber) -> Result<(), Error>;

    /// 分发消息给所有匹配的订阅者
    fn publish(&self, publish: &Publish) -> Result<(), Error>;

    /// 保存保留消息
    fn retain(&self, publish: &Publish) -> Result<(), Error>;
}
