//! Business logic services layer

pub mod deployment_service;
pub mod template;

pub use deployment_service::DeploymentService;
pub use template::{DeploymentTemplate, StaticTemplateCatalog, TemplateCatalog};
