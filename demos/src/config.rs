use gecko_session::config::{self, Session};
use tokio::fs;

#[derive(Debug, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub client: Client,
}

/// 演示客户端的参数
#[derive(Debug, serde::Deserialize)]
pub struct Client {
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,
    /// 每一轮发布的消息数
    #[serde(default = "default_messages")]
    pub messages: usize,
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            keep_alive: default_keep_alive(),
            messages: default_messages(),
            filter: default_filter(),
        }
    }
}

fn default_keep_alive() -> u16 {
    10
}

fn default_messages() -> usize {
    5
}

fn default_filter() -> String {
    "sensors/+/temperature".to_string()
}

impl Config {
    pub async fn from_path(path: &str) -> Result<Self, config::Error> {
        let s = fs::read_to_string(path).await?;
        toml::from_str::<Config>(&s).map_err(config::Error::Toml)
    }
}
