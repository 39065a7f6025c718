//! 运行期 shell 变量表与目标主机环境探测

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, info};

use crate::error::Result;
use crate::models::environment::ENVIRONMENT_PROBE_COMMAND;
use crate::models::SystemEnvironmentInfo;
use crate::ssh::SessionClient;

static VARIABLE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

static ASSIGNMENT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)=(.*)$").unwrap()
});

/// 单次部署运行内的变量表，只增不删，不持久化
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentMap {
    values: HashMap<String, String>,
}

impl EnvironmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// 替换 `$NAME` 与 `${NAME}`；未知变量保持原样交给远端 shell
    pub fn substitute(&self, text: &str) -> String {
        if self.values.is_empty() {
            return text.to_string();
        }

        VARIABLE_REFERENCE
            .replace_all(text, |caps: &Captures| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match self.values.get(name) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// 从命令输出中收集 `export NAME=value` / `NAME=value` 行，返回更新的变量名
    pub fn absorb_output(&mut self, stdout: &str) -> Vec<String> {
        let mut updated = Vec::new();
        for line in stdout.lines() {
            let Some(caps) = ASSIGNMENT_LINE.captures(line) else {
                continue;
            };
            let name = caps[1].to_string();
            let value = strip_quotes(caps[2].trim()).to_string();
            debug!(name = %name, "Captured variable from command output");
            self.values.insert(name.clone(), value);
            updated.push(name);
        }
        updated
    }
}

impl From<HashMap<String, String>> for EnvironmentMap {
    fn from(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// 探测目标主机的系统环境
pub async fn detect_environment(session: &mut SessionClient) -> Result<SystemEnvironmentInfo> {
    let result = session.execute(ENVIRONMENT_PROBE_COMMAND).await?;
    let info = SystemEnvironmentInfo::from_probe_output(&result.stdout);

    info!(
        target_id = %session.target().id,
        user = %info.current_user,
        is_root = info.is_root,
        has_sudo = info.has_sudo_binary,
        sudo_ok = info.has_sudo_privilege,
        os = ?info.os_family,
        package_manager = ?info.package_manager,
        "Detected target environment"
    );
    Ok(info)
}
