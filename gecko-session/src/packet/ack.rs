//! 发布流程中的确认报文

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    /// 包 id
    pub packet_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    /// 包 id
    pub packet_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PubRel {
    /// 包 id
    pub packet_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubComp {
    /// 包 id
    pub packet_id: u16,
}

/// 客户端发来的确认报文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// QoS1 publish 的确认
    PubAck(PubAck),
    /// QoS2 publish 的第一次确认
    PubRec(PubRec),
    /// QoS2 的释放，客户端作为发送端
    PubRel(PubRel),
    /// QoS2 publish 的最终确认
    PubComp(PubComp),
}

impl Ack {
    pub fn packet_id(&self) -> u16 {
        match self {
            Ack::PubAck(PubAck { packet_id })
            | Ack::PubRec(PubRec { packet_id })
            | Ack::PubRel(PubRel { packet_id })
            | Ack::PubComp(PubComp { packet_id }) => *packet_id,
        }
    }
}
