//! 任务存储层
//! 执行核心只把任务快照交给存储，不自行做持久化 I/O

pub mod task_repo;

pub use task_repo::*;
