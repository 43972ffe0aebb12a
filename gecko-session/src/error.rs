use crate::{config, network, packet, topics};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Session already running")]
    AlreadyRunning,
    #[error("Publish worker exited before started")]
    WorkerStart,
    #[error("Network conn error: {0}")]
    Network(#[from] network::Error),
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("Topics error: {0}")]
    Topics(#[from] topics::Error),
    #[error("Config error: {0}")]
    Config(#[from] config::Error),
}
