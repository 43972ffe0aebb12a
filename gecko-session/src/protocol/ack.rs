use std::collections::HashMap;

use parking_lot::Mutex;

use crate::packet::{Ack, QoS};

use super::Message;

/// 跟踪的消息方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 客户端发来的 QoS2 publish，等待 pubrel
    Incoming,
    /// 发给客户端的 publish/pubrel，等待 puback/pubrec/pubcomp
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// 收到了对应的确认报文
    Completed,
    /// 会话清理时被强制结束
    Aborted,
}

type AckCallback = Box<dyn Fn(Message, AckStatus) + Send + Sync>;

struct AckEntry {
    message: Message,
    /// 登记顺序
    seq: u64,
}

#[derive(Default)]
struct Entries {
    entries: HashMap<u16, AckEntry>,
    seq: u64,
}

impl Entries {
    fn drain_ordered(&mut self) -> Vec<Message> {
        let mut entries = self.entries.drain().map(|(_, e)| e).collect::<Vec<_>>();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.message).collect()
    }
}

/// 等待确认的消息，key = packet id
/// 每个 packet id 最多只有一条记录，先登记的有效
pub struct AckTracker {
    direction: Direction,
    entries: Mutex<Entries>,
    /// 确认完成时的回调，在锁外调用
    on_complete: AckCallback,
}

impl AckTracker {
    pub fn new<F>(direction: Direction, on_complete: F) -> Self
    where
        F: Fn(Message, AckStatus) + Send + Sync + 'static,
    {
        Self {
            direction,
            entries: Mutex::new(Entries::default()),
            on_complete: Box::new(on_complete),
        }
    }

    /// 登记一条等待确认的消息
    ///
    /// 没有 packet id 或者 packet id 已经在等待确认时返回 false，原来的记录保持不变
    pub fn register(&self, message: Message) -> bool {
        let packet_id = match message.packet_id() {
            Some(id) => id,
            None => return false,
        };

        let mut guard = self.entries.lock();
        if guard.entries.contains_key(&packet_id) {
            return false;
        }
        guard.seq += 1;
        let seq = guard.seq;
        guard.entries.insert(
            packet_id,
            AckEntry {
                message,
                seq,
            },
        );
        true
    }

    /// 收到确认报文，移除记录并调用回调
    ///
    /// 记录不存在或者确认报文类型不匹配时什么都不做（重复或迟到的确认）
    pub fn acknowledge(&self, ack: &Ack) -> bool {
        let packet_id = ack.packet_id();
        let message = {
            let mut guard = self.entries.lock();
            let matched = guard
                .entries
                .get(&packet_id)
                .map_or(false, |entry| self.expects(&entry.message, ack));
            if !matched {
                return false;
            }
            guard.entries.remove(&packet_id).map(|entry| entry.message)
        };

        match message {
            Some(message) => {
                (self.on_complete)(message, AckStatus::Completed);
                true
            }
            None => false,
        }
    }

    /// 移除记录，不调用回调
    pub fn discard(&self, packet_id: u16) -> Option<Message> {
        self.entries
            .lock()
            .entries
            .remove(&packet_id)
            .map(|entry| entry.message)
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.entries.lock().entries.contains_key(&packet_id)
    }

    /// 正在等待确认的消息
    pub fn get(&self, packet_id: u16) -> Option<Message> {
        self.entries
            .lock()
            .entries
            .get(&packet_id)
            .map(|entry| entry.message.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 所有等待确认的消息，按登记顺序
    pub fn pending(&self) -> Vec<Message> {
        let guard = self.entries.lock();
        let mut entries = guard.entries.values().collect::<Vec<_>>();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.message.clone()).collect()
    }

    /// 取出所有等待确认的消息，按登记顺序，不调用回调
    pub fn take_all(&self) -> Vec<Message> {
        self.entries.lock().drain_ordered()
    }

    /// 强制结束所有等待确认的消息
    pub fn abort_all(&self) {
        let messages = self.entries.lock().drain_ordered();
        for message in messages {
            (self.on_complete)(message, AckStatus::Aborted);
        }
    }

    fn expects(&self, message: &Message, ack: &Ack) -> bool {
        match (self.direction, message, ack) {
            (Direction::Incoming, Message::Publish(_), Ack::PubRel(_)) => true,
            (Direction::Outgoing, Message::Publish(p), Ack::PubAck(_)) => {
                p.qos == QoS::AtLeastOnce
            }
            (Direction::Outgoing, Message::Publish(p), Ack::PubRec(_)) => {
                p.qos == QoS::ExactlyOnce
            }
            (Direction::Outgoing, Message::PubRel(_), Ack::PubComp(_)) => true,
            _ => false,
        }
    }
}
