//! 会话层的进程内演示：内存主题管理器，内存 manager，回环连接

pub mod config;
pub mod loopback;
pub mod memory;
pub mod topic;

pub use config::Config;
pub use memory::{MemoryManager, MemoryTopics, Suspended};
