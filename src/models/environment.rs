//! 目标主机系统环境快照

use serde::{Deserialize, Serialize};

/// 操作系统家族
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Debian,
    RedHat,
    Alpine,
    Arch,
    #[default]
    Unknown,
}

impl OsFamily {
    /// 根据 /etc/os-release 的 ID / ID_LIKE 推断
    pub fn from_os_release(id: &str, id_like: &str) -> Self {
        let ids = format!("{} {}", id, id_like).to_lowercase();
        let has = |name: &str| ids.split_whitespace().any(|part| part == name);

        if has("debian") || has("ubuntu") {
            OsFamily::Debian
        } else if has("rhel") || has("centos") || has("fedora") || has("rocky") || has("almalinux")
        {
            OsFamily::RedHat
        } else if has("alpine") {
            OsFamily::Alpine
        } else if has("arch") {
            OsFamily::Arch
        } else {
            OsFamily::Unknown
        }
    }
}

/// 包管理器
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    Apt,
    Yum,
    Dnf,
    #[default]
    Unknown,
}

impl PackageManager {
    pub fn from_binary(name: &str) -> Self {
        match name.trim() {
            "apt" | "apt-get" => PackageManager::Apt,
            "yum" => PackageManager::Yum,
            "dnf" => PackageManager::Dnf,
            _ => PackageManager::Unknown,
        }
    }

    /// 安装软件包的命令
    pub fn install_command(&self, package: &str) -> Option<String> {
        match self {
            PackageManager::Apt => Some(format!(
                "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
                package
            )),
            PackageManager::Yum => Some(format!("yum install -y {}", package)),
            PackageManager::Dnf => Some(format!("dnf install -y {}", package)),
            PackageManager::Unknown => None,
        }
    }

    /// 平台的管理员组
    pub fn admin_group(&self) -> Option<&'static str> {
        match self {
            PackageManager::Apt => Some("sudo"),
            PackageManager::Yum | PackageManager::Dnf => Some("wheel"),
            PackageManager::Unknown => None,
        }
    }
}

/// 系统环境信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SystemEnvironmentInfo {
    pub os_family: OsFamily,
    pub current_user: String,
    pub is_root: bool,
    pub has_sudo_binary: bool,
    pub has_sudo_privilege: bool,
    pub package_manager: PackageManager,
}

/// 环境探测脚本，每行输出一个 KEY=VALUE
pub const ENVIRONMENT_PROBE_COMMAND: &str = concat!(
    "echo \"PROBE_USER=$(id -un 2>/dev/null || whoami)\"; ",
    "echo \"PROBE_UID=$(id -u)\"; ",
    "if command -v sudo >/dev/null 2>&1; then echo PROBE_SUDO=1; ",
    "if sudo -n true >/dev/null 2>&1; then echo PROBE_SUDO_OK=1; else echo PROBE_SUDO_OK=0; fi; ",
    "else echo PROBE_SUDO=0; echo PROBE_SUDO_OK=0; fi; ",
    "if [ -r /etc/os-release ]; then . /etc/os-release; fi; ",
    "echo \"PROBE_OS_ID=${ID:-}\"; echo \"PROBE_OS_LIKE=${ID_LIKE:-}\"; ",
    "for pm in apt-get dnf yum; do if command -v $pm >/dev/null 2>&1; then echo \"PROBE_PKG=$pm\"; break; fi; done"
);

impl SystemEnvironmentInfo {
    /// 解析环境探测脚本的输出
    pub fn from_probe_output(output: &str) -> Self {
        let mut info = SystemEnvironmentInfo::default();
        let mut os_id = String::new();
        let mut os_like = String::new();

        for line in output.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key {
                "PROBE_USER" => info.current_user = value.to_string(),
                "PROBE_UID" => info.is_root = value == "0",
                "PROBE_SUDO" => info.has_sudo_binary = value == "1",
                "PROBE_SUDO_OK" => info.has_sudo_privilege = value == "1",
                "PROBE_OS_ID" => os_id = value.trim_matches('"').to_string(),
                "PROBE_OS_LIKE" => os_like = value.trim_matches('"').to_string(),
                "PROBE_PKG" => info.package_manager = PackageManager::from_binary(value),
                _ => {}
            }
        }

        if info.current_user == "root" {
            info.is_root = true;
        }
        info.os_family = OsFamily::from_os_release(&os_id, &os_like);
        if info.package_manager == PackageManager::Unknown {
            info.package_manager = match info.os_family {
                OsFamily::Debian => PackageManager::Apt,
                OsFamily::RedHat => PackageManager::Yum,
                _ => PackageManager::Unknown,
            };
        }

        info
    }

    /// 是否可以无障碍执行特权命令
    pub fn can_elevate(&self) -> bool {
        self.is_root || (self.has_sudo_binary && self.has_sudo_privilege)
    }

    pub fn is_apt_based(&self) -> bool {
        self.package_manager == PackageManager::Apt
    }
}
