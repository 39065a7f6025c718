//! 领域模型

pub mod environment;
pub mod execution;
pub mod target;
pub mod task;

pub use environment::{OsFamily, PackageManager, SystemEnvironmentInfo};
pub use execution::ExecutionResult;
pub use target::{Credential, HostKeyVerification, Target};
pub use task::{DeploymentRequest, DeploymentTask, LogEntry, LogLevel, TaskStatus};
