//! 协议报文的数据模型（3.1.1）
//! 编解码由网络层负责，这里只保留会话层需要的字段

pub use ack::*;
pub use connect::*;
pub use publish::*;
pub use subscribe::*;
pub use unsubscribe::*;

pub mod ack;
pub mod connect;
pub mod publish;
pub mod subscribe;
pub mod unsubscribe;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),
    #[error("Miss packet id")]
    MissPacketId,
}

/// 服务质量
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
#[allow(clippy::enum_variant_names)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    /// 取两者中较低的服务质量
    pub fn downgrade(self, qos: QoS) -> QoS {
        self.min(qos)
    }
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            qos => Err(Error::InvalidQoS(qos)),
        }
    }
}

/// 服务端写给客户端的报文
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    SubAck(SubAck),
    UnsubAck(UnsubAck),
}

impl Packet {
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(publish) => publish.packet_id,
            Packet::PubAck(PubAck { packet_id })
            | Packet::PubRec(PubRec { packet_id })
            | Packet::PubRel(PubRel { packet_id })
            | Packet::PubComp(PubComp { packet_id })
            | Packet::SubAck(SubAck { packet_id, .. })
            | Packet::UnsubAck(UnsubAck { packet_id }) => Some(*packet_id),
        }
    }
}

impl From<Ack> for Packet {
    fn from(ack: Ack) -> Self {
        match ack {
            Ack::PubAck(puback) => Packet::PubAck(puback),
            Ack::PubRec(pubrec) => Packet::PubRec(pubrec),
            Ack::PubRel(pubrel) => Packet::PubRel(pubrel),
            Ack::PubComp(pubcomp) => Packet::PubComp(pubcomp),
        }
    }
}
