use std::sync::Arc;

use log::{debug, warn};
use tokio::{select, sync::oneshot};

use crate::network::Connection;

use super::{session::Session, shutdown::Shutdown};

/// 按顺序把队列中的消息写给客户端，每次连接一个
///
/// 写失败时把消息放回队尾，然后退出，由下一次连接重新投递。
/// 退出前丢弃队列中的 QoS0 消息
pub(super) async fn run(
    session: Arc<Session>,
    conn: Arc<dyn Connection>,
    shutdown: Shutdown,
    started: oneshot::Sender<()>,
) {
    let _ = started.send(());
    debug!("session {} publish worker started", session.id());

    loop {
        let mut message = select! {
            biased;
            _ = shutdown.wait() => break,
            message = session.queue.pop() => message,
        };

        // 先登记再发送，确认报文不会早于登记到达
        let registered = session.register_outgoing(&mut message);

        if let Err(e) = conn.write_message(&message.to_packet()).await {
            warn!("session {0} write message error: {1}", session.id(), e);
            if registered {
                if let Some(packet_id) = message.packet_id() {
                    session.ack_out.discard(packet_id);
                }
            }
            message.mark_dup();
            session.queue.push_back(message);
            break;
        }
    }

    let discarded = session.queue.discard_at_most_once();
    debug!(
        "session {0} publish worker exit, {1} qos0 messages discarded",
        session.id(),
        discarded
    );
}
