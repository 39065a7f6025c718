//! SSH 会话模块
//! 传输层抽象、russh 实现与带状态机的会话客户端

pub mod client;
pub mod russh_transport;
pub mod transport;

pub use client::{quote, validate_remote_path, SessionClient, SessionOptions, SessionState};
pub use russh_transport::{RusshTransport, RusshTransportFactory};
pub use transport::{SshTransport, TransportFactory};
