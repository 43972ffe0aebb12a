use std::io;

use tokio::fs;

const DEFAULT_KEEP_ALIVE_FACTOR: f32 = 1.5;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Read config file error: {0}")]
    IO(#[from] io::Error),
    #[error("Parse config error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: Session,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Session {
    /// 客户端 keepalive 的宽限倍数，超过 keep_alive * factor 没有收到报文即断开
    #[serde(default = "default_keep_alive_factor")]
    pub keep_alive_factor: f32,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            keep_alive_factor: DEFAULT_KEEP_ALIVE_FACTOR,
        }
    }
}

fn default_keep_alive_factor() -> f32 {
    DEFAULT_KEEP_ALIVE_FACTOR
}

impl Config {
    pub async fn from_path(path: &str) -> Result<Self, Error> {
        let s = fs::read_to_string(path).await?;
        s.parse()
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str::<Config>(s)?)
    }
}
