use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::packet::QoS;

use super::Message;

/// 发给客户端的消息队列
/// 多个生产者（订阅分发，会话恢复），一个消费者（publish worker）
/// 出队后立即释放锁，写网络时不会阻塞生产者
#[derive(Default)]
pub(crate) struct PublishQueue {
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl PublishQueue {
    pub(crate) fn push_back(&self, message: Message) {
        self.messages.lock().push_back(message);
        self.notify.notify_one();
    }

    pub(crate) fn extend(&self, messages: impl IntoIterator<Item = Message>) {
        self.messages.lock().extend(messages);
        self.notify.notify_one();
    }

    /// 按原来的顺序放回队列头部
    pub(crate) fn push_front_all(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        {
            let mut queue = self.messages.lock();
            for message in messages.into_iter().rev() {
                queue.push_front(message);
            }
        }
        self.notify.notify_one();
    }

    /// 取出队列头部的消息，队列为空时等待
    pub(crate) async fn pop(&self) -> Message {
        loop {
            // 先注册等待再检查队列，避免错过检查之后的通知
            let notified = self.notify.notified();
            let message = self.messages.lock().pop_front();
            if let Some(message) = message {
                return message;
            }
            notified.await;
        }
    }

    /// 丢弃 QoS0 的消息，其它的保留等待下次连接或持久化
    pub(crate) fn discard_at_most_once(&self) -> usize {
        let mut queue = self.messages.lock();
        let before = queue.len();
        queue.retain(|m| m.qos() != QoS::AtMostOnce);
        before - queue.len()
    }

    /// 队列中是否有消息已经带有这个包 id
    pub(crate) fn contains_id(&self, packet_id: u16) -> bool {
        self.messages
            .lock()
            .iter()
            .any(|m| m.packet_id() == Some(packet_id))
    }

    pub(crate) fn snapshot(&self) -> Vec<Message> {
        self.messages.lock().iter().cloned().collect()
    }

    pub(crate) fn clear(&self) {
        self.messages.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.lock().len()
    }
}
