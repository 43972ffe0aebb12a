#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    /// 包 id
    pub packet_id: u16,
    /// 取消订阅的主题
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    /// 包 id
    pub packet_id: u16,
}
