//! 内存中的主题管理器和会话管理器

use std::{collections::HashMap, sync::Arc};

use gecko_session::{
    packet::{Publish, QoS},
    topics::{self, Subscriber, TopicsManager},
    Manager, SessionMessages, Subscriptions,
};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::topic;

struct Subscription {
    filter: String,
    qos: QoS,
    subscriber: Arc<dyn Subscriber>,
}

/// 遍历所有订阅做匹配，只适合少量客户端
#[derive(Default)]
pub struct MemoryTopics {
    subscriptions: Mutex<Vec<Subscription>>,
    /// key = topic
    retained: Mutex<HashMap<String, Publish>>,
}

impl MemoryTopics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn retained(&self, topic: &str) -> Option<Publish> {
        self.retained.lock().get(topic).cloned()
    }

    /// 某个客户端的订阅
    pub fn filters(&self, id: &str) -> Vec<(String, QoS)> {
        self.subscriptions
            .lock()
            .iter()
            .filter(|s| s.subscriber.id() == id)
            .map(|s| (s.filter.clone(), s.qos))
            .collect()
    }

    fn remove_subscriber(&self, id: &str) {
        self.subscriptions
            .lock()
            .retain(|s| s.subscriber.id() != id);
    }
}

impl TopicsManager for MemoryTopics {
    fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<(), topics::Error> {
        if !topic::valid_subscribe_filter(filter) {
            return Err(topics::Error::InvalidSubscribeFilter(filter.to_string()));
        }

        {
            let mut subscriptions = self.subscriptions.lock();
            match subscriptions
                .iter_mut()
                .find(|s| s.filter == filter && s.subscriber.id() == subscriber.id())
            {
                // 同一个 filter 重复订阅，替换原来的订阅
                Some(s) => {
                    s.qos = qos;
                    s.subscriber = subscriber.clone();
                }
                None => subscriptions.push(Subscription {
                    filter: filter.to_string(),
                    qos,
                    subscriber: subscriber.clone(),
                }),
            }
        }

        // 新的订阅收到匹配的保留消息
        let retained = self
            .retained
            .lock()
            .values()
            .filter(|p| topic::matches(&p.topic, filter))
            .cloned()
            .collect::<Vec<_>>();
        for publish in retained {
            subscriber.publish(&Publish {
                qos: publish.qos.downgrade(qos),
                ..publish
            })?;
        }
        Ok(())
    }

    fn unsubscribe(&self, filter: &str, subscriber: &dyn Subscriber) -> Result<(), topics::Error> {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| !(s.filter == filter && s.subscriber.id() == subscriber.id()));
        if subscriptions.len() == before {
            debug!("{0} not subscribed to {1}", subscriber.id(), filter);
        }
        Ok(())
    }

    fn publish(&self, publish: &Publish) -> Result<(), topics::Error> {
        if !topic::valid_publish_topic(&publish.topic) {
            return Err(topics::Error::InvalidPublishTopic(publish.topic.clone()));
        }

        // 一个客户端有多个订阅匹配时只投递一次，使用最大的 qos
        let mut targets: HashMap<String, (QoS, Arc<dyn Subscriber>)> = HashMap::new();
        for s in self.subscriptions.lock().iter() {
            if !topic::matches(&publish.topic, &s.filter) {
                continue;
            }
            let target = targets
                .entry(s.subscriber.id().to_string())
                .or_insert_with(|| (s.qos, s.subscriber.clone()));
            target.0 = target.0.max(s.qos);
        }

        for (id, (qos, subscriber)) in targets {
            let message = Publish {
                qos: publish.qos.downgrade(qos),
                ..publish.clone()
            };
            match subscriber.publish(&message) {
                Ok(()) => {}
                Err(topics::Error::SubscriberGone(_)) => {
                    info!("remove subscriptions of dropped session {}", id);
                    self.remove_subscriber(&id);
                }
                Err(e) => warn!("Couldn't deliver message to {0}: {1}", id, e),
            }
        }
        Ok(())
    }

    fn retain(&self, publish: &Publish) -> Result<(), topics::Error> {
        if !topic::valid_publish_topic(&publish.topic) {
            return Err(topics::Error::InvalidPublishTopic(publish.topic.clone()));
        }

        let mut retained = self.retained.lock();
        // 空消息清除该 topic 的保留消息
        if publish.payload.is_empty() {
            retained.remove(&publish.topic);
        } else {
            retained.insert(publish.topic.clone(), publish.clone());
        }
        Ok(())
    }
}

/// 持久化会话断开后留下的状态
#[derive(Debug, Default, Clone)]
pub struct Suspended {
    pub subscriptions: Subscriptions,
    pub messages: SessionMessages,
}

/// 在内存中保存断开的持久化会话
#[derive(Default)]
pub struct MemoryManager {
    sessions: Mutex<HashMap<String, Suspended>>,
    offline: Mutex<Vec<(String, Publish)>>,
}

impl MemoryManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 取出保存的会话，用于重建
    pub fn take(&self, id: &str) -> Option<Suspended> {
        self.sessions.lock().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// 客户端不在线时错过的 QoS0 消息
    pub fn offline(&self, id: &str) -> Vec<Publish> {
        self.offline
            .lock()
            .iter()
            .filter(|(client, _)| client == id)
            .map(|(_, publish)| publish.clone())
            .collect()
    }
}

impl Manager for MemoryManager {
    fn on_close(&self, id: &str, subscriptions: Subscriptions) {
        info!("session {0} closed with {1} subscriptions", id, subscriptions.len());
        self.sessions
            .lock()
            .entry(id.to_string())
            .or_default()
            .subscriptions = subscriptions;
    }

    fn on_disconnect(&self, id: &str, messages: SessionMessages, suspend: bool) {
        if !suspend {
            self.sessions.lock().remove(id);
            return;
        }
        info!(
            "session {0} suspended, outgoing: {1}, incoming: {2}",
            id,
            messages.outgoing.len(),
            messages.incoming.len()
        );
        self.sessions
            .lock()
            .entry(id.to_string())
            .or_default()
            .messages = messages;
    }

    fn on_publish(&self, id: &str, publish: Publish) {
        debug!("session {0} offline, qos0 message to {1}", id, publish.topic);
        self.offline.lock().push((id.to_string(), publish));
    }
}

#[cfg(test)]
mod tests {
    use gecko_session::Message;

    use super::*;

    struct Recorder {
        id: String,
        received: Mutex<Vec<Publish>>,
        gone: bool,
    }

    impl Recorder {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                received: Mutex::new(Vec::new()),
                gone: false,
            })
        }

        fn gone(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                received: Mutex::new(Vec::new()),
                gone: true,
            })
        }
    }

    impl Subscriber for Recorder {
        fn id(&self) -> &str {
            &self.id
        }

        fn publish(&self, publish: &Publish) -> Result<(), topics::Error> {
            if self.gone {
                return Err(topics::Error::SubscriberGone(self.id.clone()));
            }
            self.received.lock().push(publish.clone());
            Ok(())
        }
    }

    #[test]
    fn overlapping_subscriptions_deliver_once() {
        let topics = MemoryTopics::new();
        let client = Recorder::new("c");
        topics.subscribe("a/+", QoS::AtMostOnce, client.clone()).unwrap();
        topics.subscribe("a/#", QoS::AtLeastOnce, client.clone()).unwrap();
        topics.subscribe("b", QoS::ExactlyOnce, client.clone()).unwrap();

        topics
            .publish(&Publish::new("a/b", QoS::ExactlyOnce, "x"))
            .unwrap();

        let received = client.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].qos, QoS::AtLeastOnce);
    }

    #[test]
    fn invalid_filter_and_topic() {
        let topics = MemoryTopics::new();
        let client = Recorder::new("c");
        assert!(matches!(
            topics.subscribe("a/#/b", QoS::AtMostOnce, client),
            Err(topics::Error::InvalidSubscribeFilter(_))
        ));
        assert!(matches!(
            topics.publish(&Publish::new("a/+", QoS::AtMostOnce, "x")),
            Err(topics::Error::InvalidPublishTopic(_))
        ));
    }

    #[test]
    fn retained_delivered_on_subscribe() {
        let topics = MemoryTopics::new();
        let mut retained = Publish::new("a/b", QoS::ExactlyOnce, "x");
        retained.retain = true;
        topics.retain(&retained).unwrap();
        assert!(topics.retained("a/b").is_some());

        let client = Recorder::new("c");
        topics.subscribe("a/+", QoS::AtLeastOnce, client.clone()).unwrap();
        {
            let received = client.received.lock();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].qos, QoS::AtLeastOnce);
        }

        // 空消息清除保留消息
        topics
            .retain(&Publish::new("a/b", QoS::AtMostOnce, ""))
            .unwrap();
        assert!(topics.retained("a/b").is_none());
    }

    #[test]
    fn gone_subscriber_is_removed() {
        let topics = MemoryTopics::new();
        topics.subscribe("a", QoS::AtMostOnce, Recorder::gone("old")).unwrap();
        let alive = Recorder::new("new");
        topics.subscribe("a", QoS::AtMostOnce, alive.clone()).unwrap();

        topics.publish(&Publish::new("a", QoS::AtMostOnce, "x")).unwrap();

        assert!(topics.filters("old").is_empty());
        assert_eq!(topics.filters("new"), vec![("a".to_string(), QoS::AtMostOnce)]);
        assert_eq!(alive.received.lock().len(), 1);
    }

    #[test]
    fn unsubscribe_only_own_filter() {
        let topics = MemoryTopics::new();
        let a = Recorder::new("a");
        let b = Recorder::new("b");
        topics.subscribe("t", QoS::AtMostOnce, a.clone()).unwrap();
        topics.subscribe("t", QoS::AtMostOnce, b.clone()).unwrap();

        topics.unsubscribe("t", a.as_ref()).unwrap();
        topics.unsubscribe("never", a.as_ref()).unwrap();

        assert!(topics.filters("a").is_empty());
        assert_eq!(topics.filters("b").len(), 1);
    }

    #[test]
    fn manager_keeps_suspended_sessions() {
        let manager = MemoryManager::new();
        let messages = SessionMessages {
            outgoing: vec![Message::Publish(Publish::new("a", QoS::AtLeastOnce, "x"))],
            incoming: vec![],
        };
        manager.on_disconnect("c", messages.clone(), true);
        manager.on_close("c", Subscriptions::from([("a".to_string(), QoS::AtLeastOnce)]));

        let suspended = manager.take("c").unwrap();
        assert_eq!(suspended.messages, messages);
        assert_eq!(suspended.subscriptions.len(), 1);
        assert!(!manager.contains("c"));

        manager.on_disconnect("c", messages.clone(), true);
        manager.on_disconnect("c", SessionMessages::default(), false);
        assert!(!manager.contains("c"));

        manager.on_publish("c", Publish::new("q0", QoS::AtMostOnce, "x"));
        assert_eq!(manager.offline("c").len(), 1);
        assert!(manager.offline("other").is_empty());
    }
}
