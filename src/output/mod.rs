//! 命令输出处理
//! 日志中的输出先脱敏再截断；变量传递始终使用原始输出

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

/// 输出脱敏器
pub struct OutputSanitizer {
    rules: Vec<SanitizeRule>,
}

/// 脱敏规则
#[derive(Clone, Debug)]
pub struct SanitizeRule {
    pub name: String,
    pattern: Regex,
    replacement: String,
}

impl SanitizeRule {
    pub fn new(name: &str, pattern: Regex, replacement: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern,
            replacement: replacement.to_string(),
        }
    }
}

impl OutputSanitizer {
    /// 创建默认脱敏器
    pub fn new_default() -> Self {
        Self {
            rules: vec![
                // 密码相关
                SanitizeRule::new(
                    "password",
                    Regex::new(r"(?i)(password|passwd|pwd)[\s=:]+[^\s]+").unwrap(),
                    "$1=***",
                ),
                // API Key
                SanitizeRule::new(
                    "api_key",
                    Regex::new(r"(?i)(api[_-]?key|apikey)[\s=:]+[^\s]+").unwrap(),
                    "$1=***",
                ),
                // Token
                SanitizeRule::new(
                    "token",
                    Regex::new(r"(?i)(token|access[_-]?token|refresh[_-]?token)[\s=:]+[^\s]+")
                        .unwrap(),
                    "$1=***",
                ),
                // Secret
                SanitizeRule::new(
                    "secret",
                    Regex::new(r"(?i)(secret|private[_-]?key|secret[_-]?key)[\s=:]+[^\s]+")
                        .unwrap(),
                    "$1=***",
                ),
                // PEM 私钥块
                SanitizeRule::new(
                    "pem_block",
                    Regex::new(r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----")
                        .unwrap(),
                    "-----PRIVATE KEY REDACTED-----",
                ),
                // JWT Token
                SanitizeRule::new(
                    "jwt",
                    Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+").unwrap(),
                    "eyJ***.***.***",
                ),
            ],
        }
    }

    /// 创建自定义脱敏器
    pub fn new(rules: Vec<SanitizeRule>) -> Self {
        Self { rules }
    }

    /// 脱敏输出
    pub fn sanitize(&self, output: &str) -> String {
        let mut result = output.to_string();

        for rule in &self.rules {
            result = rule.pattern.replace_all(&result, rule.replacement.as_str()).to_string();
        }

        result
    }

    /// 检查输出是否包含敏感信息
    pub fn contains_sensitive(&self, output: &str) -> bool {
        self.rules.iter().any(|rule| rule.pattern.is_match(output))
    }
}

/// 全局默认脱敏器
static DEFAULT_SANITIZER: Lazy<Arc<OutputSanitizer>> =
    Lazy::new(|| Arc::new(OutputSanitizer::new_default()));

/// 获取默认脱敏器
pub fn default_sanitizer() -> Arc<OutputSanitizer> {
    Arc::clone(&DEFAULT_SANITIZER)
}

/// 日志输出默认的摘要长度
pub const DEFAULT_SUMMARY_LENGTH: usize = 2000;

/// 按字符截断，超出部分以 `...` 表示
pub fn truncate(output: &str, max_chars: usize) -> String {
    match output.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &output[..cut]),
        None => output.to_string(),
    }
}

/// 生成可写入日志的输出摘要：去除首尾空白、脱敏、截断
pub fn summarize(output: &str, max_chars: usize) -> String {
    truncate(&default_sanitizer().sanitize(output.trim()), max_chars)
}

const BOILERPLATE_TOKENS: &[&str] = &["ok", "done", "success", "true", "false", "yes"];

/// 无意义输出：空白、纯数字或常见的样板应答
pub fn is_meaningless_output(output: &str) -> bool {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    BOILERPLATE_TOKENS
        .iter()
        .any(|token| trimmed.eq_ignore_ascii_case(token))
}
