use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::detect::Detection;
use crate::templates;

pub const RECIPE_FILE: &str = "Dockerfile";
const IGNORE_FILE: &str = ".dockerignore";
const DEFAULT_TEMPLATE: &str = "default";
const CONTAINER_WORKDIR: &str = "/app";
const DEFAULT_IGNORE: &str = "node_modules\n.git\n__pycache__\n*.pyc\n.env\n";

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("no recipe template for stack '{stack}' (searched: {})", searched.join(", "))]
    TemplateMissing { stack: String, searched: Vec<String> },
    #[error("recipe io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl RecipeError {
    pub fn code(&self) -> &'static str {
        match self {
            RecipeError::TemplateMissing { .. } => "RECIPE_TEMPLATE_MISSING",
            RecipeError::Io { .. } => "RECIPE_IO",
        }
    }
}

/// A recipe written into a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub path: PathBuf,
    /// Name of the template that was rendered.
    pub template: String,
    /// True when no stack-specific template existed.
    pub fallback: bool,
    /// Port the rendered recipe exposes.
    pub port: u16,
}

pub trait RecipeGenerator: Send + Sync {
    fn generate(&self, detection: &Detection, workspace: &Path) -> Result<Recipe, RecipeError>;
}

/// Where templates come from. A configured directory replaces the built-ins
/// entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    Builtin,
    Directory(PathBuf),
}

#[derive(Debug, Clone)]
pub struct TemplateRecipeGenerator {
    source: TemplateSource,
    default_port: u16,
}

impl TemplateRecipeGenerator {
    pub fn new(source: TemplateSource, default_port: u16) -> Self {
        Self {
            source,
            default_port,
        }
    }

    pub fn builtin(default_port: u16) -> Self {
        Self::new(TemplateSource::Builtin, default_port)
    }

    fn load(&self, name: &str) -> Result<Option<String>, RecipeError> {
        match &self.source {
            TemplateSource::Builtin => Ok(templates::builtin(name).map(str::to_string)),
            TemplateSource::Directory(dir) => {
                let path = dir.join(format!("{}.tpl", name));
                match fs::read_to_string(&path) {
                    Ok(text) => Ok(Some(text)),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(source) => Err(RecipeError::Io { path, source }),
                }
            }
        }
    }

    /// Stack template, then family template, then the default one.
    fn resolve(&self, detection: &Detection) -> Result<(String, String), RecipeError> {
        let stack = detection.stack_type.as_str();
        let mut searched: Vec<String> = Vec::new();
        for name in [
            stack,
            detection.stack_type.family().template_name(),
            DEFAULT_TEMPLATE,
        ] {
            if searched.iter().any(|s| s == name) {
                continue;
            }
            searched.push(name.to_string());
            if let Some(text) = self.load(name)? {
                return Ok((name.to_string(), text));
            }
        }
        Err(RecipeError::TemplateMissing {
            stack: stack.to_string(),
            searched,
        })
    }
}

impl RecipeGenerator for TemplateRecipeGenerator {
    fn generate(&self, detection: &Detection, workspace: &Path) -> Result<Recipe, RecipeError> {
        let (template, text) = self.resolve(detection)?;
        let port = detection.port.unwrap_or(self.default_port);
        let start_command = detection
            .start_command
            .clone()
            .unwrap_or_else(|| format!("python -m http.server {}", port));

        let rendered = render(&text, port, &start_command);
        let path = workspace.join(RECIPE_FILE);
        fs::write(&path, rendered).map_err(|source| RecipeError::Io {
            path: path.clone(),
            source,
        })?;

        let ignore = workspace.join(IGNORE_FILE);
        if !ignore.exists() {
            fs::write(&ignore, DEFAULT_IGNORE).map_err(|source| RecipeError::Io {
                path: ignore.clone(),
                source,
            })?;
        }

        let fallback = template != detection.stack_type.as_str();
        if fallback {
            debug!(stack = %detection.stack_type, template = %template, "using fallback template");
        }
        info!(workspace = %workspace.display(), template = %template, port, "recipe written");

        Ok(Recipe {
            path,
            template,
            fallback,
            port,
        })
    }
}

/// Substitutes `{{PORT}}`, `{{START_CMD}}` and `{{WORKDIR}}`. The start
/// command is inserted as a JSON string literal so it can sit inside an
/// exec-form `CMD`.
pub fn render(template: &str, port: u16, start_command: &str) -> String {
    let quoted = serde_json::to_string(start_command).unwrap_or_else(|_| "\"\"".to_string());
    template
        .replace("{{PORT}}", &port.to_string())
        .replace("{{START_CMD}}", &quoted)
        .replace("{{WORKDIR}}", CONTAINER_WORKDIR)
}
