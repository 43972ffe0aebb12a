//! 协议层
//! 处理会话相关的协议逻辑，依赖网络层进行报文读写

pub use ack::{AckStatus, AckTracker, Direction};
pub use session::{Options, Session, Subscriptions};

use crate::packet::{Packet, PubRel, Publish, QoS};

mod ack;
mod queue;
mod session;
mod shutdown;
mod worker;

/// 等待发送给客户端的消息
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Message {
    Publish(Publish),
    PubRel(PubRel),
}

impl Message {
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Message::Publish(publish) => publish.packet_id,
            Message::PubRel(pubrel) => Some(pubrel.packet_id),
        }
    }

    /// pubrel 属于 QoS2 流程
    pub fn qos(&self) -> QoS {
        match self {
            Message::Publish(publish) => publish.qos,
            Message::PubRel(_) => QoS::ExactlyOnce,
        }
    }

    /// 重新投递的 QoS1, QoS2 消息需要设置 dup
    pub(crate) fn mark_dup(&mut self) {
        if let Message::Publish(publish) = self {
            if publish.qos != QoS::AtMostOnce {
                publish.dup = true;
            }
        }
    }

    pub fn to_packet(&self) -> Packet {
        match self {
            Message::Publish(publish) => Packet::Publish(publish.clone()),
            Message::PubRel(pubrel) => Packet::PubRel(*pubrel),
        }
    }
}

/// 会话断开时交给持久化的消息
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SessionMessages {
    /// 还在队列中等待发送给客户端的消息
    pub outgoing: Vec<Message>,
    /// 客户端发来的 QoS2 消息，还没有收到 pubrel
    pub incoming: Vec<Message>,
}

impl SessionMessages {
    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.incoming.is_empty()
    }
}
