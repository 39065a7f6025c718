//! 部署命令引擎
//! 命令流解析、变量传递、sudo 诊断修复与按组执行

pub mod environment;
pub mod executor;
pub mod parser;
pub mod reporter;
pub mod sudo;

pub use environment::{detect_environment, EnvironmentMap};
pub use executor::{DeploymentExecutor, ExecutorOptions, GroupOutput};
pub use parser::{parse, CommandGroup};
pub use reporter::TaskReporter;
pub use sudo::{diagnose, solve, SudoProblem, SudoSolution};
