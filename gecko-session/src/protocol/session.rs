use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};

use crate::{
    config,
    network::{self, CloseReason, Connection, ConnectionConfig, Handler},
    packet::{
        Ack, Connect, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck, Subscribe,
        SubscribeFilter, SubscribeReasonCode, UnsubAck, Unsubscribe,
    },
    topics::{self, Subscriber, TopicsManager},
    Error, Manager, Result,
};

use super::{
    ack::{AckStatus, AckTracker, Direction},
    queue::PublishQueue,
    shutdown::Shutdown,
    worker, Message, SessionMessages,
};

/// 订阅的主题，key = topic-filter, value = qos
pub type Subscriptions = HashMap<String, QoS>;

/// 会话生命周期
/// Idle -> Starting -> Running -> Stopping -> Idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// 创建会话需要的参数
pub struct Options {
    pub cfg: config::Session,
    pub topics: Arc<dyn TopicsManager>,
    pub manager: Arc<dyn Manager>,
    /// 恢复持久化会话时之前的订阅，新会话为空
    pub subscriptions: Subscriptions,
}

/// 由会话锁保护的状态
struct Inner {
    /// clean session，每次连接时更新
    clean: bool,
    /// 连接异常断开时发布的遗嘱消息
    will: Option<Publish>,
    subscriptions: Subscriptions,
    /// 当前的连接，同一时间最多一个
    conn: Option<Arc<dyn Connection>>,
}

/// 代表服务端的一次会话
/// 会话的生命周期不能小于一次客户端连接，持久化会话可以跨越多次连接
pub struct Session {
    /// 客户端 id
    id: String,
    cfg: config::Session,
    topics: Arc<dyn TopicsManager>,
    manager: Arc<dyn Manager>,
    /// 交给主题管理器的订阅者，弱引用当前会话
    subscriber: Arc<dyn Subscriber>,

    inner: Mutex<Inner>,
    /// 客户端发布的 QoS0 保留消息
    retained: Mutex<Vec<Publish>>,

    pub(super) queue: PublishQueue,
    /// 客户端发来的 QoS2 消息
    ack_in: AckTracker,
    /// 发给客户端的 QoS1, QoS2 消息
    pub(super) ack_out: AckTracker,
    packet_id: AtomicU32,

    shutdown: Mutex<Shutdown>,
    worker: Mutex<Option<JoinHandle<()>>>,
    state: watch::Sender<State>,
    /// stop 正在执行
    closing: watch::Sender<bool>,
}

impl Session {
    /// 创建会话，如果带有订阅，重新向主题管理器订阅
    pub fn new(id: impl Into<String>, options: Options) -> Arc<Self> {
        let id = id.into();
        let Options {
            cfg,
            topics,
            manager,
            subscriptions,
        } = options;

        let session = Arc::new_cyclic(|weak: &Weak<Session>| {
            let ack_in = {
                let weak = weak.clone();
                AckTracker::new(Direction::Incoming, move |message, status| {
                    if let Some(session) = weak.upgrade() {
                        session.on_ack_in(message, status)
                    }
                })
            };
            let ack_out = {
                let weak = weak.clone();
                AckTracker::new(Direction::Outgoing, move |message, status| {
                    if let Some(session) = weak.upgrade() {
                        session.on_ack_out(message, status)
                    }
                })
            };

            Session {
                id: id.clone(),
                cfg,
                topics,
                manager,
                subscriber: Arc::new(SessionSubscriber {
                    id,
                    session: weak.clone(),
                }),
                inner: Mutex::new(Inner {
                    clean: false,
                    will: None,
                    subscriptions: Subscriptions::new(),
                    conn: None,
                }),
                retained: Mutex::new(Vec::new()),
                queue: PublishQueue::default(),
                ack_in,
                ack_out,
                packet_id: AtomicU32::new(0),
                shutdown: Mutex::new(Shutdown::triggered()),
                worker: Mutex::new(None),
                state: watch::channel(State::Idle).0,
                closing: watch::channel(false).0,
            }
        });

        for (filter, qos) in subscriptions {
            match session
                .topics
                .subscribe(&filter, qos, session.subscriber.clone())
            {
                Ok(()) => session.add_subscription(&filter, qos),
                Err(e) => error!(
                    "Couldn't subscribe [{0}] to [{1}/{2:?}]: {3}",
                    session.id, filter, qos, e
                ),
            }
        }

        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscriber(&self) -> Arc<dyn Subscriber> {
        self.subscriber.clone()
    }

    pub fn is_running(&self) -> bool {
        *self.state.borrow() == State::Running
    }

    pub fn is_clean(&self) -> bool {
        self.inner.lock().clean
    }

    pub fn subscriptions(&self) -> Subscriptions {
        self.inner.lock().subscriptions.clone()
    }

    pub fn will(&self) -> Option<Publish> {
        self.inner.lock().will.clone()
    }

    pub fn retained(&self) -> Vec<Publish> {
        self.retained.lock().clone()
    }

    /// 队列中等待发送的消息
    pub fn queued(&self) -> Vec<Message> {
        self.queue.snapshot()
    }

    /// 已经发送给客户端，等待确认的消息
    pub fn inflight(&self) -> Vec<Message> {
        self.ack_out.pending()
    }

    /// 客户端发来的 QoS2 消息，等待 pubrel
    pub fn pending_incoming(&self) -> Vec<Message> {
        self.ack_in.pending()
    }

    /// 恢复持久化的消息
    ///
    /// 用于从持久化中恢复出来的新会话，可以在 start 之前调用。
    /// 同一个会话断开后重连不需要调用，未完成的消息仍在队列中
    pub fn restore(&self, messages: SessionMessages) {
        let SessionMessages { outgoing, incoming } = messages;
        // 新分配的包 id 从恢复的最大 id 之后开始
        if let Some(max) = outgoing.iter().filter_map(Message::packet_id).max() {
            self.packet_id.fetch_max(u32::from(max), Ordering::Relaxed);
        }
        for message in incoming {
            if !self.ack_in.register(message) {
                debug!("session {0} skip restoring duplicate incoming message", self.id);
            }
        }
        self.queue.extend(outgoing);
    }

    /// 新连接接入
    ///
    /// 上一次连接的清理还没结束时，等待清理完成后再启动。
    /// 会话已经在运行时返回 [`Error::AlreadyRunning`]
    pub async fn start(self: &Arc<Self>, connect: Connect, conn: Arc<dyn Connection>) -> Result<()> {
        let mut state = self.state.subscribe();
        loop {
            let _ = state.wait_for(|s| *s != State::Stopping).await;
            match self.transition(State::Idle, State::Starting) {
                Ok(()) => break,
                Err(State::Stopping) => continue,
                Err(_) => return Err(Error::AlreadyRunning),
            }
        }

        if let Err(e) = self.run(connect, conn).await {
            error!("session {0} start error: {1}", self.id, e);
            self.rollback().await;
            return Err(e);
        }

        self.state.send_replace(State::Running);
        info!("session {} started", self.id);
        Ok(())
    }

    async fn run(self: &Arc<Self>, connect: Connect, conn: Arc<dyn Connection>) -> Result<()> {
        let Connect {
            keep_alive,
            clean_session,
            last_will,
            ..
        } = connect;

        {
            let mut inner = self.inner.lock();
            inner.will = last_will.map(Publish::from);
            inner.clean = clean_session;
            inner.conn = Some(conn.clone());
        }
        let shutdown = Shutdown::new();
        *self.shutdown.lock() = shutdown.clone();

        // 超过 keepalive 的宽限倍数时间没有收到报文，断开连接
        let keep_alive = match keep_alive {
            0 => None,
            secs => Some(
                Duration::from_secs(u64::from(secs)).mul_f32(self.cfg.keep_alive_factor.max(1.0)),
            ),
        };
        conn.start(ConnectionConfig {
            id: self.id.clone(),
            keep_alive,
            handler: self.clone(),
        })?;

        // 等待 worker 开始消费后再返回
        let (started_tx, started_rx) = oneshot::channel();
        let handle = tokio::spawn(worker::run(self.clone(), conn, shutdown, started_tx));
        *self.worker.lock() = Some(handle);
        started_rx.await.map_err(|_| Error::WorkerStart)
    }

    async fn rollback(&self) {
        self.shutdown.lock().trigger();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("session {0} publish worker error: {1}", self.id, e);
            }
        }
        let conn = self.inner.lock().conn.take();
        if let Some(conn) = conn {
            if let Err(e) = conn.close().await {
                warn!("Couldn't close connection [{0}]: {1}", self.id, e);
            }
        }
        self.state.send_replace(State::Idle);
    }

    /// 停止会话，重复调用会等待正在执行的 stop 完成
    ///
    /// 持久化会话会通知 manager 保存订阅
    pub async fn stop(&self) {
        let begin = self.closing.send_if_modified(|closing| {
            if *closing {
                false
            } else {
                *closing = true;
                true
            }
        });
        if !begin {
            let mut closing = self.closing.subscribe();
            let _ = closing.wait_for(|closing| !*closing).await;
            return;
        }

        // 关闭失败也要继续清理
        let conn = self.inner.lock().conn.clone();
        if let Some(conn) = conn {
            if let Err(e) = conn.close().await {
                error!("Couldn't close connection [{0}]: {1}", self.id, e);
            }
        }
        self.teardown(CloseReason::Shutdown).await;

        let (clean, subscriptions) = {
            let inner = self.inner.lock();
            (inner.clean, inner.subscriptions.clone())
        };
        if !clean {
            self.manager.on_close(&self.id, subscriptions);
        }

        self.closing.send_replace(false);
    }

    /// 连接断开后的清理，每次连接只执行一次
    /// 连接的 on_close 和 stop 谁先到谁执行，另一个等待它完成
    async fn teardown(&self, reason: CloseReason) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s != State::Starting).await;
        match self.transition(State::Running, State::Stopping) {
            Ok(()) => {}
            Err(State::Stopping) => {
                let _ = state.wait_for(|s| *s != State::Stopping).await;
                return;
            }
            Err(_) => return,
        }

        // 等待 worker 退出，此后队列中只剩 QoS1, QoS2 的消息
        self.shutdown.lock().trigger();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("session {0} publish worker error: {1}", self.id, e);
            }
        }
        // worker 可能早已因写失败退出，之后入队的 QoS0 在这里丢弃
        let discarded = self.queue.discard_at_most_once();
        if discarded > 0 {
            debug!("session {0} discard {1} qos0 messages", self.id, discarded);
        }

        let (clean, will) = {
            let mut inner = self.inner.lock();
            inner.conn = None;
            (inner.clean, inner.will.take())
        };
        if let Some(will) = will {
            if reason.publish_will() {
                info!("session {0} publish will message to {1}", self.id, will.topic);
                self.publish_to_topic(will);
            }
        }

        let messages = if clean {
            self.discard();
            SessionMessages::default()
        } else {
            self.suspend()
        };
        self.manager.on_disconnect(&self.id, messages, !clean);

        self.state.send_replace(State::Idle);
        info!("session {0} stopped: {1:?}", self.id, reason);
    }

    /// 持久化会话断开：已发送未确认的消息放回队列头部，下次连接重新投递
    fn suspend(&self) -> SessionMessages {
        let mut inflight = self.ack_out.take_all();
        inflight.iter_mut().for_each(Message::mark_dup);
        self.queue.push_front_all(inflight);
        debug!("session {0} suspended with {1} queued messages", self.id, self.queue.len());

        SessionMessages {
            outgoing: self.queue.snapshot(),
            incoming: self.ack_in.pending(),
        }
    }

    /// 清理会话断开：丢弃所有消息和订阅
    fn discard(&self) {
        self.queue.clear();
        self.ack_out.abort_all();
        self.ack_in.abort_all();
        self.retained.lock().clear();

        let subscriptions = std::mem::take(&mut self.inner.lock().subscriptions);
        for filter in subscriptions.keys() {
            if let Err(e) = self.topics.unsubscribe(filter, self.subscriber.as_ref()) {
                error!("Couldn't unsubscribe [{0}] from [{1}]: {2}", self.id, filter, e);
            }
        }
    }

    fn transition(&self, from: State, to: State) -> std::result::Result<(), State> {
        let mut current = from;
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                current = *state;
                false
            }
        });
        if current == from {
            Ok(())
        } else {
            Err(current)
        }
    }

    /// 其它客户端发布的消息匹配到当前会话的订阅
    pub fn on_subscribed_publish(&self, publish: &Publish) {
        let message = Publish {
            // [MQTT-3.3.1-9]
            retain: false,
            // [MQTT-3.3.1-3]
            dup: false,
            packet_id: None,
            ..publish.clone()
        };

        // QoS0 的消息，客户端不在线时不进入队列，交给 manager 处理
        if message.qos == QoS::AtMostOnce && self.shutdown.lock().is_triggered() {
            self.manager.on_publish(&self.id, message);
            return;
        }

        self.queue.push_back(Message::Publish(message));
    }

    pub fn add_subscription(&self, filter: &str, qos: QoS) {
        self.inner
            .lock()
            .subscriptions
            .insert(filter.to_string(), qos);
    }

    pub fn remove_subscription(&self, filter: &str) {
        self.inner.lock().subscriptions.remove(filter);
    }

    /// 客户端发布的消息交给主题管理器分发
    pub fn publish_to_topic(&self, mut publish: Publish) {
        // [MQTT-3.3.1-5]
        if publish.retain {
            if let Err(e) = self.topics.retain(&publish) {
                error!("Error retaining message [{0}]: {1}", self.id, e);
            }

            // [MQTT-3.3.1-7]
            if publish.qos == QoS::AtMostOnce {
                self.retained.lock().push(publish.clone());
            }
        }

        // 保留标志只对存储有效，不转发给订阅者
        publish.retain = false;

        if let Err(e) = self.topics.publish(&publish) {
            error!("Error publishing message [{0}]: {1}", self.id, e);
        }
    }

    fn on_ack_in(&self, message: Message, status: AckStatus) {
        match (message, status) {
            (Message::Publish(publish), AckStatus::Completed) => self.publish_to_topic(publish),
            (message, status) => debug!(
                "session {0} incoming {1:?} finished: {2:?}",
                self.id,
                message.packet_id(),
                status
            ),
        }
    }

    fn on_ack_out(&self, message: Message, status: AckStatus) {
        // TODO 确定超时重发策略（超时时长，重试次数）后，在这里把超时的消息设置 dup 重新入队
        debug!(
            "session {0} outgoing {1:?} finished: {2:?}",
            self.id,
            message.packet_id(),
            status
        );
    }

    /// 分配新的包 id，跳过 0，还在等待确认的 id，以及队列中消息已经带有的 id
    pub(super) fn next_packet_id(&self) -> u16 {
        let mut id = 1;
        for _ in 0..=u16::MAX {
            id = self.packet_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1) as u16;
            if id != 0 && !self.ack_out.contains(id) && !self.queue.contains_id(id) {
                return id;
            }
        }
        warn!("session {0} all packet ids are inflight", self.id);
        id.max(1)
    }

    /// 发送前登记到 ack_out，返回是否新登记
    pub(super) fn register_outgoing(&self, message: &mut Message) -> bool {
        if let Message::Publish(publish) = message {
            if publish.qos == QoS::AtMostOnce {
                return false;
            }
            // 只在第一次发送时分配
            if publish.packet_id.is_none() {
                publish.packet_id = Some(self.next_packet_id());
            }
        }
        self.ack_out.register(message.clone())
    }

    async fn write(&self, packet: Packet) -> Result<()> {
        let conn = self.inner.lock().conn.clone();
        match conn {
            Some(conn) => {
                conn.write_message(&packet).await?;
                Ok(())
            }
            None => Err(network::Error::ConnectionClosed.into()),
        }
    }
}

#[async_trait]
impl Handler for Session {
    /// * qos0: 直接分发
    /// * qos1: 分发，回复 puback
    /// * qos2: 保存，回复 pubrec，收到 pubrel 后分发
    async fn on_publish(&self, publish: Publish) -> Result<()> {
        match publish.qos {
            QoS::AtMostOnce => self.publish_to_topic(publish),
            QoS::AtLeastOnce => {
                let packet_id = publish.required_packet_id()?;
                self.publish_to_topic(publish);
                self.write(Packet::PubAck(PubAck { packet_id })).await?;
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.required_packet_id()?;
                if !self.ack_in.register(Message::Publish(publish)) {
                    debug!("session {0} duplicate publish {1}", self.id, packet_id);
                }
                self.write(Packet::PubRec(PubRec { packet_id })).await?;
            }
        }
        Ok(())
    }

    async fn on_ack(&self, ack: Ack) -> Result<()> {
        match ack {
            Ack::PubAck(_) | Ack::PubComp(_) => {
                if !self.ack_out.acknowledge(&ack) {
                    debug!("session {0} ignore ack {1:?}", self.id, ack);
                }
            }
            Ack::PubRec(PubRec { packet_id }) => {
                // 重复的 pubrec 重发 pubrel
                let release = self.ack_out.acknowledge(&ack)
                    || matches!(self.ack_out.get(packet_id), Some(Message::PubRel(_)));
                if !release {
                    debug!("session {0} ignore ack {1:?}", self.id, ack);
                    return Ok(());
                }
                // pubrel 由 worker 发送，并登记等待 pubcomp
                self.queue.push_back(Message::PubRel(PubRel { packet_id }));
            }
            Ack::PubRel(PubRel { packet_id }) => {
                if !self.ack_in.acknowledge(&ack) {
                    debug!("session {0} ignore ack {1:?}", self.id, ack);
                }
                self.write(Packet::PubComp(PubComp { packet_id })).await?;
            }
        }
        Ok(())
    }

    async fn on_subscribe(&self, subscribe: Subscribe) -> Result<()> {
        let Subscribe { packet_id, filters } = subscribe;

        let mut return_codes = Vec::with_capacity(filters.len());
        for SubscribeFilter { path, qos } in filters {
            match self.topics.subscribe(&path, qos, self.subscriber.clone()) {
                Ok(()) => {
                    self.add_subscription(&path, qos);
                    return_codes.push(SubscribeReasonCode::Success(qos));
                }
                Err(e) => {
                    error!(
                        "Couldn't subscribe [{0}] to [{1}/{2:?}]: {3}",
                        self.id, path, qos, e
                    );
                    return_codes.push(SubscribeReasonCode::Failure);
                }
            }
        }

        self.write(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        }))
        .await
    }

    async fn on_unsubscribe(&self, unsubscribe: Unsubscribe) -> Result<()> {
        let Unsubscribe { packet_id, filters } = unsubscribe;
        for filter in filters {
            if let Err(e) = self.topics.unsubscribe(&filter, self.subscriber.as_ref()) {
                error!("Couldn't unsubscribe [{0}] from [{1}]: {2}", self.id, filter, e);
            }
            self.remove_subscription(&filter);
        }
        self.write(Packet::UnsubAck(UnsubAck { packet_id })).await
    }

    async fn on_close(&self, reason: CloseReason) {
        self.teardown(reason).await
    }
}

/// 主题管理器持有的订阅者，不会延长会话的生命周期
struct SessionSubscriber {
    id: String,
    session: Weak<Session>,
}

impl Subscriber for SessionSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    fn publish(&self, publish: &Publish) -> std::result::Result<(), topics::Error> {
        match self.session.upgrade() {
            Some(session) => {
                session.on_subscribed_publish(publish);
                Ok(())
            }
            None => Err(topics::Error::SubscriberGone(self.id.clone())),
        }
    }
}
