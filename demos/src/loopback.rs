//! 进程内的回环连接
//!
//! 服务端一侧实现 [`Connection`]，客户端一侧是 [`LoopbackClient`]，
//! 两端通过 channel 收发报文，不做编解码

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use gecko_session::{
    network::{self, CloseReason, Connection, ConnectionConfig},
    packet::{
        Ack, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, Subscribe, Unsubscribe,
    },
};
use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::{
    select,
    sync::{mpsc, watch},
    time,
};

/// 客户端发给服务端的报文
#[derive(Debug, Clone)]
pub enum ClientPacket {
    Publish(Publish),
    Ack(Ack),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    Disconnect,
}

pub struct LoopbackConnection {
    id: String,
    /// start 时交给读协程
    inbound: Mutex<Option<mpsc::UnboundedReceiver<ClientPacket>>>,
    outbound: mpsc::UnboundedSender<Packet>,
    closed: watch::Sender<bool>,
}

pub struct LoopbackClient {
    inbound: mpsc::UnboundedSender<ClientPacket>,
    outbound: mpsc::UnboundedReceiver<Packet>,
}

/// 创建一对连接，客户端一侧 drop 后服务端视为异常断开
pub fn pair(id: impl Into<String>) -> (Arc<LoopbackConnection>, LoopbackClient) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let conn = LoopbackConnection {
        id: id.into(),
        inbound: Mutex::new(Some(inbound_rx)),
        outbound: outbound_tx,
        closed: watch::channel(false).0,
    };
    let client = LoopbackClient {
        inbound: inbound_tx,
        outbound: outbound_rx,
    };
    (Arc::new(conn), client)
}

impl LoopbackConnection {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn start(&self, cfg: ConnectionConfig) -> Result<(), network::Error> {
        if self.is_closed() {
            return Err(network::Error::ConnectionClosed);
        }
        let inbound = self
            .inbound
            .lock()
            .take()
            .ok_or(network::Error::AlreadyStarted)?;
        debug!("loopback connection {0} started, keep alive: {1:?}", self.id, cfg.keep_alive);
        tokio::spawn(read_loop(cfg, inbound, self.closed.subscribe()));
        Ok(())
    }

    async fn write_message(&self, packet: &Packet) -> Result<usize, network::Error> {
        if self.is_closed() {
            return Err(network::Error::ConnectionClosed);
        }
        self.outbound
            .send(packet.clone())
            .map_err(|_| network::Error::ConnectionClosed)?;
        Ok(1)
    }

    async fn close(&self) -> Result<(), network::Error> {
        self.closed.send_replace(true);
        Ok(())
    }
}

/// 读取客户端的报文交给 handler，直到连接关闭
///
/// 服务端主动关闭时不回调 on_close
async fn read_loop(
    cfg: ConnectionConfig,
    mut inbound: mpsc::UnboundedReceiver<ClientPacket>,
    mut closed: watch::Receiver<bool>,
) {
    let ConnectionConfig {
        id,
        keep_alive,
        handler,
    } = cfg;

    let reason = loop {
        let packet = select! {
            _ = wait_closed(&mut closed) => {
                debug!("loopback connection {} closed by server", id);
                return;
            }
            packet = read(&mut inbound, keep_alive) => packet,
        };

        let packet = match packet {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!("loopback connection {} dropped by client", id);
                break CloseReason::Unexpected;
            }
            Err(_) => {
                warn!("loopback connection {} keep alive timeout", id);
                break CloseReason::Unexpected;
            }
        };

        let res = match packet {
            ClientPacket::Publish(publish) => handler.on_publish(publish).await,
            ClientPacket::Ack(ack) => handler.on_ack(ack).await,
            ClientPacket::Subscribe(subscribe) => handler.on_subscribe(subscribe).await,
            ClientPacket::Unsubscribe(unsubscribe) => handler.on_unsubscribe(unsubscribe).await,
            ClientPacket::Disconnect => break CloseReason::Disconnect,
        };
        if let Err(e) = res {
            error!("loopback connection {0} handle packet error: {1}", id, e);
            break CloseReason::Unexpected;
        }
    };

    handler.on_close(reason).await;
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn read(
    inbound: &mut mpsc::UnboundedReceiver<ClientPacket>,
    keep_alive: Option<Duration>,
) -> Result<Option<ClientPacket>, time::error::Elapsed> {
    match keep_alive {
        Some(timeout) => time::timeout(timeout, inbound.recv()).await,
        None => Ok(inbound.recv().await),
    }
}

impl LoopbackClient {
    pub fn send(&self, packet: ClientPacket) -> Result<(), network::Error> {
        self.inbound
            .send(packet)
            .map_err(|_| network::Error::ConnectionClosed)
    }

    /// 服务端写出的下一个报文，服务端连接释放后返回 None
    pub async fn recv(&mut self) -> Option<Packet> {
        self.outbound.recv().await
    }

    /// 按 qos 流程回复服务端发来的报文，不需要回复的报文忽略
    pub fn ack(&self, packet: &Packet) -> Result<(), network::Error> {
        let ack = match packet {
            Packet::Publish(publish) => match (publish.qos, publish.packet_id) {
                (QoS::AtLeastOnce, Some(packet_id)) => Ack::PubAck(PubAck { packet_id }),
                (QoS::ExactlyOnce, Some(packet_id)) => Ack::PubRec(PubRec { packet_id }),
                _ => return Ok(()),
            },
            Packet::PubRec(PubRec { packet_id }) => Ack::PubRel(PubRel {
                packet_id: *packet_id,
            }),
            Packet::PubRel(PubRel { packet_id }) => Ack::PubComp(PubComp {
                packet_id: *packet_id,
            }),
            _ => return Ok(()),
        };
        self.send(ClientPacket::Ack(ack))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use gecko_session::{
        config,
        packet::{Connect, LastWill, SubAck, SubscribeFilter, SubscribeReasonCode},
        Options, Session, Subscriptions,
    };

    use crate::{MemoryManager, MemoryTopics};

    use super::*;

    fn session(id: &str, topics: &Arc<MemoryTopics>, manager: &Arc<MemoryManager>) -> Arc<Session> {
        Session::new(
            id,
            Options {
                cfg: config::Session::default(),
                topics: topics.clone(),
                manager: manager.clone(),
                subscriptions: Subscriptions::new(),
            },
        )
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let topics = MemoryTopics::new();
        let manager = MemoryManager::new();
        let s = session("c", &topics, &manager);
        let (conn, _client) = pair("c");

        s.start(Connect::new("c", true), conn.clone()).await.unwrap();
        let res = conn.start(ConnectionConfig {
            id: "c".into(),
            keep_alive: None,
            handler: s.clone(),
        });
        assert!(matches!(res, Err(network::Error::AlreadyStarted)));
    }

    #[tokio::test]
    async fn publish_between_clients() {
        let topics = MemoryTopics::new();
        let manager = MemoryManager::new();

        let sub = session("sub", &topics, &manager);
        let (conn, mut sub_client) = pair("sub");
        sub.start(Connect::new("sub", false), conn).await.unwrap();
        sub_client
            .send(ClientPacket::Subscribe(Subscribe {
                packet_id: 1,
                filters: vec![SubscribeFilter {
                    path: "t/+".into(),
                    qos: QoS::ExactlyOnce,
                }],
            }))
            .unwrap();
        assert_eq!(
            sub_client.recv().await,
            Some(Packet::SubAck(SubAck {
                packet_id: 1,
                return_codes: vec![SubscribeReasonCode::Success(QoS::ExactlyOnce)],
            }))
        );

        let publisher = session("pub", &topics, &manager);
        let (conn, mut pub_client) = pair("pub");
        publisher
            .start(Connect::new("pub", true), conn)
            .await
            .unwrap();
        let mut publish = Publish::new("t/1", QoS::ExactlyOnce, "21.5");
        publish.packet_id = Some(10);
        pub_client.send(ClientPacket::Publish(publish)).unwrap();

        // 发布端 qos2 流程：pubrec -> pubrel -> pubcomp
        let pubrec = pub_client.recv().await.unwrap();
        assert_eq!(pubrec, Packet::PubRec(PubRec { packet_id: 10 }));
        pub_client.ack(&pubrec).unwrap();
        assert_eq!(
            pub_client.recv().await,
            Some(Packet::PubComp(PubComp { packet_id: 10 }))
        );

        // 订阅端收到 qos2 消息
        let received = match sub_client.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("unexpected packet: {:?}", other),
        };
        assert_eq!(received.topic, "t/1");
        assert_eq!(received.payload, Bytes::from_static(b"21.5"));
        assert_eq!(received.qos, QoS::ExactlyOnce);
        let packet_id = received.packet_id.unwrap();

        sub_client.ack(&Packet::Publish(received)).unwrap();
        let pubrel = sub_client.recv().await.unwrap();
        assert_eq!(pubrel, Packet::PubRel(PubRel { packet_id }));
        sub_client.ack(&pubrel).unwrap();

        eventually(|| sub.inflight().is_empty()).await;
    }

    #[tokio::test]
    async fn dropped_client_publishes_will() {
        let topics = MemoryTopics::new();
        let manager = MemoryManager::new();

        let watcher = session("watcher", &topics, &manager);
        let (conn, mut watcher_client) = pair("watcher");
        watcher
            .start(Connect::new("watcher", true), conn)
            .await
            .unwrap();
        watcher_client
            .send(ClientPacket::Subscribe(Subscribe {
                packet_id: 1,
                filters: vec![SubscribeFilter {
                    path: "status/#".into(),
                    qos: QoS::AtMostOnce,
                }],
            }))
            .unwrap();
        watcher_client.recv().await.unwrap();

        let s = session("device", &topics, &manager);
        let (conn, client) = pair("device");
        let mut connect = Connect::new("device", false);
        connect.last_will = Some(LastWill {
            topic: "status/device".into(),
            message: Bytes::from_static(b"offline"),
            qos: QoS::AtMostOnce,
            retain: false,
        });
        s.start(connect, conn).await.unwrap();

        drop(client);

        match watcher_client.recv().await {
            Some(Packet::Publish(publish)) => assert_eq!(publish.topic, "status/device"),
            other => panic!("unexpected packet: {:?}", other),
        }
        assert!(manager.contains("device"));
    }

    #[tokio::test]
    async fn keep_alive_timeout_closes_session() {
        let topics = MemoryTopics::new();
        let manager = MemoryManager::new();
        let s = Session::new(
            "c",
            Options {
                cfg: config::Session {
                    keep_alive_factor: 1.0,
                },
                topics: topics.clone(),
                manager: manager.clone(),
                subscriptions: Subscriptions::new(),
            },
        );
        let (conn, _client) = pair("c");
        let mut connect = Connect::new("c", true);
        connect.keep_alive = 1;

        s.start(connect, conn.clone()).await.unwrap();
        assert!(s.is_running());

        eventually(|| !s.is_running()).await;
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn disconnect_then_stop() {
        let topics = MemoryTopics::new();
        let manager = MemoryManager::new();
        let s = session("c", &topics, &manager);
        let (conn, client) = pair("c");
        s.start(Connect::new("c", false), conn.clone()).await.unwrap();

        client.send(ClientPacket::Disconnect).unwrap();
        eventually(|| manager.contains("c")).await;
        assert!(!s.is_running());

        s.stop().await;
        assert!(manager.take("c").is_some());
        assert!(!conn.is_closed());
    }
}
