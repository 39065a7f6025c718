//! 部署模板
//! 模板目录只作为外部协作者的接口，附带一个内存实现

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap());

/// 部署模板
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub commands: Vec<String>,
    /// 渲染时必须提供的变量
    #[serde(default)]
    pub required_variables: Vec<String>,
}

impl DeploymentTemplate {
    /// 用变量替换 `{{name}}` 占位符；未提供的非必需占位符保持原样
    pub fn render(&self, variables: &HashMap<String, String>) -> Result<Vec<String>> {
        let missing: Vec<&str> = self
            .required_variables
            .iter()
            .filter(|name| !variables.contains_key(name.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(AppError::Validation(format!(
                "Template '{}' requires variables: {}",
                self.id,
                missing.join(", ")
            )));
        }

        Ok(self
            .commands
            .iter()
            .map(|command| {
                PLACEHOLDER
                    .replace_all(command, |caps: &Captures| {
                        variables
                            .get(&caps[1])
                            .cloned()
                            .unwrap_or_else(|| caps[0].to_string())
                    })
                    .into_owned()
            })
            .collect())
    }
}

/// 模板目录
pub trait TemplateCatalog: Send + Sync {
    fn get(&self, template_id: &str) -> Option<DeploymentTemplate>;

    fn list(&self) -> Vec<DeploymentTemplate>;
}

/// 内存模板目录
#[derive(Debug, Clone, Default)]
pub struct StaticTemplateCatalog {
    templates: HashMap<String, DeploymentTemplate>,
}

impl StaticTemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, template: DeploymentTemplate) -> Self {
        self.templates.insert(template.id.clone(), template);
        self
    }

    /// 从 JSON 数组加载
    pub fn from_json(json: &str) -> Result<Self> {
        let templates: Vec<DeploymentTemplate> = serde_json::from_str(json)
            .map_err(|e| AppError::Validation(format!("Invalid template catalog: {}", e)))?;
        Ok(templates
            .into_iter()
            .fold(Self::new(), |catalog, template| catalog.with_template(template)))
    }
}

impl TemplateCatalog for StaticTemplateCatalog {
    fn get(&self, template_id: &str) -> Option<DeploymentTemplate> {
        self.templates.get(template_id).cloned()
    }

    fn list(&self) -> Vec<DeploymentTemplate> {
        let mut templates: Vec<DeploymentTemplate> = self.templates.values().cloned().collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        templates
    }
}
