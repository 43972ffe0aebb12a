use bytes::Bytes;

use super::{Error, QoS};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Publish {
    /// 客户端是否之前发送过此消息（是否重新投递）
    pub dup: bool,
    /// 服务质量
    pub qos: QoS,
    /// 消息保留
    pub retain: bool,
    /// 主题
    pub topic: String,
    /// 包 id，QoS0 没有
    pub packet_id: Option<u16>,
    /// 消息负载
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }

    /// QoS1, QoS2 的消息必须带有包 id
    pub fn required_packet_id(&self) -> Result<u16, Error> {
        match self.packet_id {
            Some(id) if id != 0 => Ok(id),
            _ => Err(Error::MissPacketId),
        }
    }
}
