use std::{error::Error, ops::Range, time::Duration};

use clap::Parser;
use demos::{
    loopback::{self, ClientPacket, LoopbackClient},
    Config, MemoryManager, MemoryTopics,
};
use flexi_logger::Logger;
use gecko_session::{
    packet::{Connect, Packet, Publish, QoS, Subscribe, SubscribeFilter},
    Options, Session, Subscriptions,
};
use log::{info, warn};
use tokio::time;

const DEFAULT_CONFIG: &str = "./standalone.toml";

/// 单进程演示：一个发布端，一个持久化的订阅端，订阅端断线重连后收到离线消息
#[derive(Debug, Parser)]
#[clap(name = "standalone")]
struct Args {
    /// 配置文件路径，未指定时读取 GECKO_CONFIG 环境变量
    #[clap(short, long)]
    config: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct Env {
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _logger = Logger::try_with_env_or_str("info")?
        .format(flexi_logger::detailed_format)
        .start()?;

    // 获取配置
    let args = Args::parse();
    let env = envy::prefixed("GECKO_").from_env::<Env>()?;
    let path = args
        .config
        .or(env.config)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let cfg = match Config::from_path(&path).await {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("load config {0} error: {1}, use default", path, e);
            Config::default()
        }
    };

    let topics = MemoryTopics::new();
    let manager = MemoryManager::new();
    let options = |subscriptions: Subscriptions| Options {
        cfg: cfg.session.clone(),
        topics: topics.clone(),
        manager: manager.clone(),
        subscriptions,
    };

    // 订阅端，持久化会话
    let subscriber = Session::new("subscriber", options(Subscriptions::new()));
    let mut connect = Connect::new("subscriber", false);
    connect.keep_alive = cfg.client.keep_alive;
    let (conn, mut sub_client) = loopback::pair("subscriber");
    subscriber.start(connect.clone(), conn).await?;
    sub_client.send(ClientPacket::Subscribe(Subscribe {
        packet_id: 1,
        filters: vec![SubscribeFilter {
            path: cfg.client.filter.clone(),
            qos: QoS::ExactlyOnce,
        }],
    }))?;
    if let Some(suback) = sub_client.recv().await {
        info!("subscriber got {:?}", suback);
    }

    // 发布端
    let publisher = Session::new("publisher", options(Subscriptions::new()));
    let (conn, mut pub_client) = loopback::pair("publisher");
    publisher.start(Connect::new("publisher", true), conn).await?;

    let messages = cfg.client.messages;
    publish_all(&mut pub_client, 0..messages).await?;
    receive(&mut sub_client, messages).await?;

    // 订阅端异常断开，之后的消息留在会话中
    drop(sub_client);
    while subscriber.is_running() {
        time::sleep(Duration::from_millis(10)).await;
    }
    publish_all(&mut pub_client, messages..messages * 2).await?;
    info!(
        "subscriber offline, {} messages queued",
        subscriber.queued().len()
    );

    // 重连后收到离线期间的消息
    let (conn, mut sub_client) = loopback::pair("subscriber");
    subscriber.start(connect, conn).await?;
    receive(&mut sub_client, messages).await?;

    pub_client.send(ClientPacket::Disconnect)?;
    sub_client.send(ClientPacket::Disconnect)?;
    publisher.stop().await;
    subscriber.stop().await;

    if let Some(suspended) = manager.take(subscriber.id()) {
        info!(
            "subscriber saved with subscriptions: {:?}, pending: {}",
            suspended.subscriptions,
            suspended.messages.outgoing.len()
        );
    }
    Ok(())
}

/// 用 qos2 发布消息，每条等待 pubcomp
async fn publish_all(client: &mut LoopbackClient, seq: Range<usize>) -> Result<(), Box<dyn Error>> {
    for i in seq {
        let mut publish = Publish::new(
            format!("sensors/{}/temperature", i),
            QoS::ExactlyOnce,
            format!("{}", 20 + i),
        );
        publish.packet_id = Some(i as u16 + 1);
        client.send(ClientPacket::Publish(publish))?;

        while let Some(packet) = client.recv().await {
            client.ack(&packet)?;
            if matches!(packet, Packet::PubComp(_)) {
                break;
            }
        }
    }
    Ok(())
}

/// 接收 qos2 消息直到完成 count 条
async fn receive(client: &mut LoopbackClient, count: usize) -> Result<(), Box<dyn Error>> {
    let mut completed = 0;
    time::timeout(Duration::from_secs(5), async {
        while completed < count {
            let packet = match client.recv().await {
                Some(packet) => packet,
                None => break,
            };
            if let Packet::Publish(publish) = &packet {
                info!(
                    "received {0}: {1:?}, dup: {2}",
                    publish.topic, publish.payload, publish.dup
                );
            }
            client.ack(&packet)?;
            if matches!(packet, Packet::PubRel(_)) {
                completed += 1;
            }
        }
        Ok::<_, Box<dyn Error>>(())
    })
    .await??;
    info!("received {} messages", completed);
    Ok(())
}
