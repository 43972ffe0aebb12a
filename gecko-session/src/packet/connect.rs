use bytes::Bytes;

use super::{Publish, QoS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// keepalive，单位秒，0 表示不检测
    pub keep_alive: u16,
    /// 客户端id
    pub client_id: String,
    /// 是否开启新会话
    pub clean_session: bool,
    /// 遗嘱消息
    pub last_will: Option<LastWill>,
}

impl Connect {
    pub fn new(client_id: impl Into<String>, clean_session: bool) -> Self {
        Self {
            keep_alive: 0,
            client_id: client_id.into(),
            clean_session,
            last_will: None,
        }
    }
}

/// 遗嘱设置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    /// 遗嘱发送的目标主题
    pub topic: String,
    // 遗嘱消息
    pub message: Bytes,
    /// 服务质量
    pub qos: QoS,
    /// 消息保留
    pub retain: bool,
}

impl From<LastWill> for Publish {
    fn from(will: LastWill) -> Self {
        Publish {
            dup: false,
            qos: will.qos,
            retain: will.retain,
            topic: will.topic,
            packet_id: None,
            payload: will.message,
        }
    }
}
