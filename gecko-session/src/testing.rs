//! 测试用的连接，主题管理器和 manager

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::Notify, time};

use crate::{
    config,
    network::{self, Connection, ConnectionConfig, Handler},
    packet::{Packet, Publish, QoS},
    topics::{self, Subscriber, TopicsManager},
    Manager, Options, Session, SessionMessages, Subscriptions,
};

/// 记录写出的报文，可以模拟写失败
#[derive(Default)]
pub(crate) struct MockConnection {
    written: Mutex<Vec<Packet>>,
    fail_writes: AtomicBool,
    fail_start: AtomicBool,
    closes: AtomicUsize,
    keep_alive: Mutex<Option<Duration>>,
    handler: Mutex<Option<Arc<dyn Handler>>>,
    /// 设置后每次写都要等待放行
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MockConnection {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing() -> Arc<Self> {
        let conn = Self::new();
        conn.set_fail_writes(true);
        conn
    }

    pub(crate) fn refusing_start() -> Arc<Self> {
        let conn = Self::new();
        conn.fail_start.store(true, Ordering::SeqCst);
        conn
    }

    /// 写报文时阻塞，直到 gate 放行一次
    pub(crate) fn gated(gate: Arc<Notify>) -> Arc<Self> {
        let conn = Self::new();
        *conn.gate.lock() = Some(gate);
        conn
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn written(&self) -> Vec<Packet> {
        self.written.lock().clone()
    }

    pub(crate) fn publishes(&self) -> Vec<Publish> {
        self.written()
            .into_iter()
            .filter_map(|p| match p {
                Packet::Publish(publish) => Some(publish),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn keep_alive(&self) -> Option<Duration> {
        *self.keep_alive.lock()
    }

    pub(crate) fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn start(&self, cfg: ConnectionConfig) -> Result<(), network::Error> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(network::Error::AlreadyStarted);
        }
        *self.keep_alive.lock() = cfg.keep_alive;
        *self.handler.lock() = Some(cfg.handler);
        Ok(())
    }

    async fn write_message(&self, packet: &Packet) -> Result<usize, network::Error> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(network::Error::ConnectionClosed);
        }
        self.written.lock().push(packet.clone());
        Ok(1)
    }

    async fn close(&self) -> Result<(), network::Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        // 断开后释放 handler，和真实连接一样
        self.handler.lock().take();
        Ok(())
    }
}

/// 精确匹配 topic 的主题管理器
#[derive(Default)]
pub(crate) struct MockTopics {
    subscribers: Mutex<Vec<(String, QoS, Arc<dyn Subscriber>)>>,
    published: Mutex<Vec<Publish>>,
    pub(crate) retained: Mutex<Vec<Publish>>,
    pub(crate) unsubscribed: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl MockTopics {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn subscribed(&self) -> Vec<(String, QoS)> {
        self.subscribers
            .lock()
            .iter()
            .map(|(filter, qos, _)| (filter.clone(), *qos))
            .collect()
    }

    pub(crate) fn published(&self) -> Vec<Publish> {
        self.published.lock().clone()
    }

    fn check(&self) -> Result<(), topics::Error> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(topics::Error::Rejected("mock failure".into()));
        }
        Ok(())
    }
}

impl TopicsManager for MockTopics {
    fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<(), topics::Error> {
        self.check()?;
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(f, _, s)| !(f == filter && s.id() == subscriber.id()));
        subscribers.push((filter.to_string(), qos, subscriber));
        Ok(())
    }

    fn unsubscribe(&self, filter: &str, subscriber: &dyn Subscriber) -> Result<(), topics::Error> {
        self.unsubscribed.lock().push(filter.to_string());
        self.subscribers
            .lock()
            .retain(|(f, _, s)| !(f == filter && s.id() == subscriber.id()));
        self.check()
    }

    fn publish(&self, publish: &Publish) -> Result<(), topics::Error> {
        self.published.lock().push(publish.clone());
        self.check()?;
        let targets = self
            .subscribers
            .lock()
            .iter()
            .filter(|(filter, _, _)| filter == &publish.topic)
            .map(|(_, qos, subscriber)| (*qos, subscriber.clone()))
            .collect::<Vec<_>>();
        for (qos, subscriber) in targets {
            let message = Publish {
                qos: publish.qos.downgrade(qos),
                ..publish.clone()
            };
            subscriber.publish(&message)?;
        }
        Ok(())
    }

    fn retain(&self, publish: &Publish) -> Result<(), topics::Error> {
        self.retained.lock().push(publish.clone());
        self.check()
    }
}

#[derive(Default)]
pub(crate) struct RecordingManager {
    pub(crate) closes: Mutex<Vec<(String, Subscriptions)>>,
    pub(crate) disconnects: Mutex<Vec<(String, SessionMessages, bool)>>,
    pub(crate) publishes: Mutex<Vec<(String, Publish)>>,
}

impl RecordingManager {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Manager for RecordingManager {
    fn on_close(&self, id: &str, subscriptions: Subscriptions) {
        self.closes.lock().push((id.to_string(), subscriptions));
    }

    fn on_disconnect(&self, id: &str, messages: SessionMessages, suspend: bool) {
        self.disconnects
            .lock()
            .push((id.to_string(), messages, suspend));
    }

    fn on_publish(&self, id: &str, publish: Publish) {
        self.publishes.lock().push((id.to_string(), publish));
    }
}

pub(crate) fn session(
    id: &str,
    topics: &Arc<MockTopics>,
    manager: &Arc<RecordingManager>,
    subscriptions: Subscriptions,
) -> Arc<Session> {
    Session::new(
        id,
        Options {
            cfg: config::Session::default(),
            topics: topics.clone(),
            manager: manager.clone(),
            subscriptions,
        },
    )
}

/// 等待条件成立，超时 panic
pub(crate) async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
