//! VPS 部署系统库
//! SSH 连接池与智能部署命令执行

pub mod config;
pub mod deploy;
pub mod error;
pub mod models;
pub mod output;
pub mod pool;
pub mod realtime;
pub mod repository;
pub mod services;
pub mod ssh;
pub mod telemetry;
