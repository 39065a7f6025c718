//! sudo 诊断与修复
//!
//! 根据目标主机环境判断特权问题并给出修复方案，以及执行前的命令改写。
//! 全部为纯函数。

use serde::Serialize;

use crate::models::SystemEnvironmentInfo;
use crate::ssh::quote;

/// sudo 问题分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SudoProblem {
    /// 已是 root，无需 sudo
    RootUser,
    /// 未安装 sudo
    NotInstalled,
    /// 已安装但当前用户无免密权限
    NoPrivileges,
    /// sudoers 配置损坏
    ConfigurationError,
    Unknown,
}

/// 修复方案
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SudoSolution {
    pub description: String,
    /// 需要以特权执行的修复命令（不带 sudo 前缀）
    pub commands: Vec<String>,
    pub manual_steps: Vec<String>,
    pub is_automatic: bool,
}

impl SudoSolution {
    fn manual(description: &str, manual_steps: Vec<String>) -> Self {
        Self {
            description: description.to_string(),
            commands: Vec::new(),
            manual_steps,
            is_automatic: false,
        }
    }
}

/// 根据环境诊断
pub fn diagnose(env: &SystemEnvironmentInfo) -> SudoProblem {
    if env.is_root {
        SudoProblem::RootUser
    } else if !env.has_sudo_binary {
        SudoProblem::NotInstalled
    } else if !env.has_sudo_privilege {
        SudoProblem::NoPrivileges
    } else {
        SudoProblem::Unknown
    }
}

/// 结合失败命令的 stderr 诊断，可识别 sudoers 配置错误
pub fn diagnose_failure(env: &SystemEnvironmentInfo, stderr: &str) -> SudoProblem {
    let lower = stderr.to_lowercase();
    if !env.is_root
        && lower.contains("sudoers")
        && (lower.contains("parse error") || lower.contains("syntax error"))
    {
        return SudoProblem::ConfigurationError;
    }
    diagnose(env)
}

/// 为问题生成修复方案
pub fn solve(problem: SudoProblem, env: &SystemEnvironmentInfo) -> SudoSolution {
    let user = env.current_user.trim();

    match problem {
        SudoProblem::RootUser => SudoSolution {
            description: "Running as root; sudo prefixes are dropped".to_string(),
            commands: Vec::new(),
            manual_steps: Vec::new(),
            is_automatic: false,
        },
        SudoProblem::NotInstalled | SudoProblem::NoPrivileges if user.is_empty() => {
            SudoSolution::manual(
                "Current user could not be determined",
                vec!["Log in as root and grant the deploy user sudo access".to_string()],
            )
        }
        SudoProblem::NotInstalled => {
            let (Some(install), Some(group)) = (
                env.package_manager.install_command("sudo"),
                env.package_manager.admin_group(),
            ) else {
                return SudoSolution::manual(
                    "sudo is not installed and no supported package manager was found",
                    vec![
                        "Install the sudo package with the system package manager".to_string(),
                        format!("Add {} to the administrators group", user),
                        format!("Allow {} to run sudo without a password", user),
                    ],
                );
            };

            let mut commands = vec![install];
            commands.extend(grant_commands(user, group));
            SudoSolution {
                description: format!("Install sudo and grant {} passwordless access", user),
                commands,
                manual_steps: Vec::new(),
                is_automatic: true,
            }
        }
        SudoProblem::NoPrivileges => match env.package_manager.admin_group() {
            Some(group) => SudoSolution {
                description: format!("Grant {} passwordless sudo access", user),
                commands: grant_commands(user, group),
                manual_steps: Vec::new(),
                is_automatic: true,
            },
            None => SudoSolution::manual(
                "User lacks sudo privileges on an unrecognised platform",
                vec![
                    format!("As root, add {} to the administrators group", user),
                    format!(
                        "As root, run: echo '{} ALL=(ALL) NOPASSWD:ALL' > /etc/sudoers.d/{}",
                        user, user
                    ),
                ],
            ),
        },
        SudoProblem::ConfigurationError => SudoSolution::manual(
            "The sudoers configuration is invalid",
            vec![
                "Log in as root and run `visudo -c` to locate the syntax error".to_string(),
                "Fix or remove the offending file under /etc/sudoers.d".to_string(),
            ],
        ),
        SudoProblem::Unknown => SudoSolution::manual(
            "The privilege failure could not be diagnosed",
            vec![
                "Check that the command itself is valid".to_string(),
                "Run `sudo -n true` on the host to verify sudo access".to_string(),
            ],
        ),
    }
}

fn grant_commands(user: &str, group: &str) -> Vec<String> {
    let sudoers_file = format!("/etc/sudoers.d/90-{}", sanitize_file_component(user));
    let rule = format!("{} ALL=(ALL) NOPASSWD:ALL", user);
    vec![
        format!("usermod -aG {} {}", group, quote(user)),
        format!(
            "echo {} > {} && chmod 440 {}",
            quote(&rule),
            quote(&sudoers_file),
            quote(&sudoers_file)
        ),
    ]
}

fn sanitize_file_component(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// 是否为 sudo 前缀命令
pub fn is_sudo_command(command: &str) -> bool {
    command.trim_start().starts_with("sudo ")
}

/// 去掉开头的 `sudo `
pub fn strip_sudo(command: &str) -> &str {
    let trimmed = command.trim_start();
    trimmed
        .strip_prefix("sudo ")
        .map(str::trim_start)
        .unwrap_or(command)
}

/// 执行前改写命令
///
/// root 直接去掉 sudo；无特权的 apt 系主机改用 `su -c`，其他主机执行裸命令。
pub fn adapt_command(command: &str, env: &SystemEnvironmentInfo) -> String {
    if !is_sudo_command(command) {
        return command.to_string();
    }
    if env.is_root {
        return strip_sudo(command).to_string();
    }
    if env.has_sudo_binary && env.has_sudo_privilege {
        return command.to_string();
    }

    let inner = strip_sudo(command);
    if env.is_apt_based() {
        format!("su -c {}", quote(inner))
    } else {
        inner.to_string()
    }
}

/// 以特权方式执行一条不带 sudo 的命令
pub fn privileged(command: &str, env: &SystemEnvironmentInfo) -> String {
    adapt_command(&format!("sudo {}", command), env)
}

/// root 主机上去掉脚本中每一行开头的 sudo，换行符原样保留
pub fn strip_sudo_lines(script: &str) -> String {
    script
        .split_inclusive('\n')
        .map(|line| {
            let (body, ending) = match line.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (line, ""),
            };
            if is_sudo_command(body) {
                let indent = &body[..body.len() - body.trim_start().len()];
                format!("{}{}{}", indent, strip_sudo(body), ending)
            } else {
                line.to_string()
            }
        })
        .collect()
}
