use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Technology classification of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StackKind {
    Node,
    React,
    Next,
    Nestjs,
    Angular,
    Vue,
    Laravel,
    Php,
    Django,
    Flask,
    Python,
    Ml,
    Dl,
    Jupyter,
    ReactNativeMetro,
    ReactNativeCli,
    Expo,
    AndroidGradle,
    Unknown,
}

impl StackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackKind::Node => "node",
            StackKind::React => "react",
            StackKind::Next => "next",
            StackKind::Nestjs => "nestjs",
            StackKind::Angular => "angular",
            StackKind::Vue => "vue",
            StackKind::Laravel => "laravel",
            StackKind::Php => "php",
            StackKind::Django => "django",
            StackKind::Flask => "flask",
            StackKind::Python => "python",
            StackKind::Ml => "ml",
            StackKind::Dl => "dl",
            StackKind::Jupyter => "jupyter",
            StackKind::ReactNativeMetro => "react-native-metro",
            StackKind::ReactNativeCli => "react-native-cli",
            StackKind::Expo => "expo",
            StackKind::AndroidGradle => "android-gradle",
            StackKind::Unknown => "unknown",
        }
    }

    pub fn family(&self) -> StackFamily {
        match self {
            StackKind::Node
            | StackKind::React
            | StackKind::Next
            | StackKind::Nestjs
            | StackKind::Angular
            | StackKind::Vue
            | StackKind::ReactNativeMetro
            | StackKind::ReactNativeCli
            | StackKind::Expo => StackFamily::Node,
            StackKind::Laravel | StackKind::Php => StackFamily::Php,
            StackKind::Django
            | StackKind::Flask
            | StackKind::Python
            | StackKind::Ml
            | StackKind::Dl
            | StackKind::Jupyter => StackFamily::Python,
            StackKind::AndroidGradle => StackFamily::Android,
            StackKind::Unknown => StackFamily::Unknown,
        }
    }
}

impl fmt::Display for StackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StackFamily {
    Node,
    Php,
    Python,
    Android,
    Unknown,
}

impl StackFamily {
    /// Name of the family template (`android` maps onto the gradle one).
    pub fn template_name(&self) -> &'static str {
        match self {
            StackFamily::Node => "node",
            StackFamily::Php => "php",
            StackFamily::Python => "python",
            StackFamily::Android => "android-gradle",
            StackFamily::Unknown => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub stack_type: StackKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub rationale: Vec<String>,
}

impl Detection {
    fn new(stack_type: StackKind, start_command: impl Into<String>, reason: &str) -> Self {
        Self {
            stack_type,
            start_command: Some(start_command.into()),
            port: None,
            rationale: vec![reason.to_string()],
        }
    }

    fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn unknown() -> Self {
        Self {
            stack_type: StackKind::Unknown,
            start_command: None,
            port: None,
            rationale: vec!["no recognized markers".to_string()],
        }
    }
}

/// Classifies a workspace directory. Implementations never fail: anything
/// they cannot make sense of degrades to [`StackKind::Unknown`].
pub trait StackDetector: Send + Sync {
    fn detect(&self, workspace: &Path) -> Detection;
}

/// Marker-file heuristics over the workspace root.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerDetector;

impl MarkerDetector {
    pub fn new() -> Self {
        Self
    }
}

impl StackDetector for MarkerDetector {
    fn detect(&self, workspace: &Path) -> Detection {
        let entries = root_entries(workspace);
        let has = |name: &str| entries.contains(name);

        let detection = detect_node(workspace, &entries)
            .or_else(|| detect_php(workspace, &entries))
            .or_else(|| detect_python(workspace, &entries))
            .or_else(|| {
                (has("build.gradle") || has("gradlew") || (has("app") && has("android"))).then(
                    || {
                        Detection::new(
                            StackKind::AndroidGradle,
                            "./gradlew assembleDebug",
                            "android gradle project",
                        )
                    },
                )
            })
            .unwrap_or_else(Detection::unknown);

        debug!(
            workspace = %workspace.display(),
            stack = %detection.stack_type,
            "classified workspace"
        );
        detection
    }
}

fn root_entries(workspace: &Path) -> BTreeSet<String> {
    match fs::read_dir(workspace) {
        Ok(read) => read
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(err) => {
            debug!(workspace = %workspace.display(), error = %err, "workspace not readable");
            BTreeSet::new()
        }
    }
}

fn read_json(path: &Path) -> Value {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(Default::default()))
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn detect_node(workspace: &Path, entries: &BTreeSet<String>) -> Option<Detection> {
    if !entries.contains("package.json") {
        return None;
    }
    let pkg = read_json(&workspace.join("package.json"));
    let scripts = string_map(pkg.get("scripts"));
    let mut deps = string_map(pkg.get("dependencies"));
    deps.extend(string_map(pkg.get("devDependencies")));
    let name = pkg.get("name").and_then(Value::as_str).unwrap_or_default();

    let dep = |key: &str| deps.contains_key(key);
    let script = |key: &str| scripts.get(key).filter(|s| !s.is_empty()).cloned();
    let start = |fallback: &str| script("start").unwrap_or_else(|| fallback.to_string());

    let detection = if dep("next") || name.contains("next") {
        Detection::new(StackKind::Next, start("npm run dev"), "found next in package.json")
    } else if dep("@nestjs/core") || dep("nestjs") {
        Detection::new(StackKind::Nestjs, start("npm run start:prod"), "found @nestjs/core")
    } else if dep("react-scripts") || (name.contains("react") && !dep("react-native")) {
        Detection::new(StackKind::React, start("npm start"), "found react-scripts")
    } else if dep("vue") || dep("@vue/cli-service") {
        let command = script("serve").unwrap_or_else(|| start("npm run serve"));
        Detection::new(StackKind::Vue, command, "found vue")
    } else if dep("@angular/core") || entries.contains("angular.json") {
        Detection::new(StackKind::Angular, start("npm start"), "found @angular/core")
    } else if dep("react-native") && dep("expo") {
        Detection::new(StackKind::Expo, start("expo start --tunnel"), "found react-native & expo")
    } else if dep("react-native") {
        if scripts.contains_key("android") || scripts.contains_key("run-android") {
            Detection::new(
                StackKind::ReactNativeCli,
                start("npx react-native start"),
                "react-native with android script",
            )
        } else {
            Detection::new(
                StackKind::ReactNativeMetro,
                start("npx react-native start"),
                "react-native (metro)",
            )
        }
    } else if pkg.get("main").is_some()
        || scripts.contains_key("start")
        || dep("express")
        || dep("koa")
    {
        Detection::new(StackKind::Node, start("node index.js"), "generic node project")
    } else {
        return None;
    };
    Some(detection)
}

fn detect_php(workspace: &Path, entries: &BTreeSet<String>) -> Option<Detection> {
    if !entries.contains("composer.json") {
        return None;
    }
    let composer = read_json(&workspace.join("composer.json"));
    let requires_laravel = composer
        .get("require")
        .and_then(Value::as_object)
        .map(|req| req.keys().any(|k| k == "laravel" || k.starts_with("laravel/")))
        .unwrap_or(false);

    if entries.contains("artisan") || requires_laravel {
        Some(
            Detection::new(
                StackKind::Laravel,
                "php artisan serve --host=0.0.0.0 --port=8000",
                "laravel detected",
            )
            .with_port(8000),
        )
    } else {
        Some(
            Detection::new(
                StackKind::Php,
                "php -S 0.0.0.0:8080 -t public",
                "php project (composer.json)",
            )
            .with_port(8080),
        )
    }
}

static REQUIREMENT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z0-9][A-Za-z0-9._-]*)").expect("valid requirement regex"));

static QUOTED_REQUIREMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""([A-Za-z0-9][A-Za-z0-9._-]*)\s*(?:[<>=!~;\[][^"]*)?""#)
        .expect("valid quoted requirement regex")
});

/// Lowercased distribution names listed in a requirements file.
pub fn requirement_names(text: &str) -> BTreeSet<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .filter(|line| !line.trim_start().starts_with('-'))
        .filter_map(|line| REQUIREMENT_NAME.captures(line))
        .map(|caps| caps[1].to_ascii_lowercase())
        .collect()
}

fn pyproject_names(text: &str) -> BTreeSet<String> {
    QUOTED_REQUIREMENT
        .captures_iter(text)
        .map(|caps| caps[1].to_ascii_lowercase())
        .collect()
}

fn detect_python(workspace: &Path, entries: &BTreeSet<String>) -> Option<Detection> {
    let has = |name: &str| entries.contains(name);
    if !(has("manage.py") || has("requirements.txt") || has("pyproject.toml")) {
        return None;
    }

    let mut reqs = fs::read_to_string(workspace.join("requirements.txt"))
        .map(|text| requirement_names(&text))
        .unwrap_or_default();
    if let Ok(text) = fs::read_to_string(workspace.join("pyproject.toml")) {
        reqs.extend(pyproject_names(&text));
    }
    let req = |name: &str| reqs.contains(name);

    let detection = if has("manage.py") || req("django") {
        Detection::new(
            StackKind::Django,
            "python manage.py runserver 0.0.0.0:8000",
            "django detected",
        )
        .with_port(8000)
    } else if req("flask") || has("app.py") || has("wsgi.py") {
        Detection::new(
            StackKind::Flask,
            "gunicorn -w 1 -b 0.0.0.0:8000 app:app",
            "flask detected",
        )
        .with_port(8000)
    } else if req("numpy") || req("pandas") || req("scikit-learn") {
        Detection::new(StackKind::Ml, "python main.py", "python ML project")
    } else if req("torch") || req("tensorflow") {
        Detection::new(StackKind::Dl, "python main.py", "python DL project")
    } else if entries.iter().any(|e| e.ends_with(".ipynb")) {
        Detection::new(
            StackKind::Jupyter,
            "python notebook_to_script.py && python main.py",
            "jupyter detected",
        )
    } else {
        Detection::new(StackKind::Python, "python main.py", "generic python project")
    };
    Some(detection)
}
