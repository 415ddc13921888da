use capsules_stack::{MarkerDetector, StackDetector, StackFamily, StackKind};
use std::fs;
use tempfile::TempDir;

fn workspace(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, contents) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }
    dir
}

#[test]
fn given_express_with_start_script_when_detect_then_node_with_script() {
    let dir = workspace(&[(
        "package.json",
        r#"{"name":"api","scripts":{"start":"node server.js"},"dependencies":{"express":"^4.19.0"}}"#,
    )]);

    let detection = MarkerDetector::new().detect(dir.path());

    assert_eq!(detection.stack_type, StackKind::Node);
    assert_eq!(detection.stack_type.family(), StackFamily::Node);
    assert_eq!(detection.start_command.as_deref(), Some("node server.js"));
    assert_eq!(detection.port, None);
    assert_eq!(detection.rationale, vec!["generic node project".to_string()]);
}

#[test]
fn given_next_dependency_when_detect_then_next_with_dev_fallback() {
    let dir = workspace(&[(
        "package.json",
        r#"{"name":"site","dependencies":{"next":"14.0.0","react":"18.2.0"}}"#,
    )]);

    let detection = MarkerDetector::new().detect(dir.path());

    assert_eq!(detection.stack_type, StackKind::Next);
    assert_eq!(detection.start_command.as_deref(), Some("npm run dev"));
}

#[test]
fn given_react_native_without_expo_when_detect_then_metro_or_cli_by_scripts() {
    let metro = workspace(&[(
        "package.json",
        r#"{"name":"mobile","dependencies":{"react-native":"0.73.0"}}"#,
    )]);
    let cli = workspace(&[(
        "package.json",
        r#"{"name":"mobile","scripts":{"android":"react-native run-android"},"dependencies":{"react-native":"0.73.0"}}"#,
    )]);
    let expo = workspace(&[(
        "package.json",
        r#"{"name":"mobile","dependencies":{"react-native":"0.73.0","expo":"50.0.0"}}"#,
    )]);

    let detector = MarkerDetector::new();
    assert_eq!(detector.detect(metro.path()).stack_type, StackKind::ReactNativeMetro);
    assert_eq!(detector.detect(cli.path()).stack_type, StackKind::ReactNativeCli);
    assert_eq!(detector.detect(expo.path()).stack_type, StackKind::Expo);
}

#[test]
fn given_vue_serve_script_when_detect_then_serve_preferred() {
    let dir = workspace(&[(
        "package.json",
        r#"{"scripts":{"serve":"vue-cli-service serve","start":"other"},"devDependencies":{"@vue/cli-service":"5.0.0"}}"#,
    )]);

    let detection = MarkerDetector::new().detect(dir.path());

    assert_eq!(detection.stack_type, StackKind::Vue);
    assert_eq!(detection.start_command.as_deref(), Some("vue-cli-service serve"));
}

#[test]
fn given_composer_with_artisan_when_detect_then_laravel_on_8000() {
    let laravel = workspace(&[("composer.json", r#"{"require":{"php":"^8.2"}}"#), ("artisan", "")]);
    let plain = workspace(&[("composer.json", r#"{"require":{"php":"^8.2"}}"#)]);

    let detector = MarkerDetector::new();
    let detection = detector.detect(laravel.path());
    assert_eq!(detection.stack_type, StackKind::Laravel);
    assert_eq!(detection.port, Some(8000));

    let detection = detector.detect(plain.path());
    assert_eq!(detection.stack_type, StackKind::Php);
    assert_eq!(detection.port, Some(8080));
}

#[test]
fn given_requirements_when_detect_then_python_variants() {
    let detector = MarkerDetector::new();

    let django = workspace(&[("requirements.txt", "django>=4.2\n")]);
    assert_eq!(detector.detect(django.path()).stack_type, StackKind::Django);

    let flask = workspace(&[("requirements.txt", "Flask==3.0.0\n")]);
    let detection = detector.detect(flask.path());
    assert_eq!(detection.stack_type, StackKind::Flask);
    assert_eq!(detection.port, Some(8000));

    let ml = workspace(&[("requirements.txt", "pandas\nmatplotlib\n")]);
    assert_eq!(detector.detect(ml.path()).stack_type, StackKind::Ml);

    let dl = workspace(&[("requirements.txt", "torch==2.1\n")]);
    assert_eq!(detector.detect(dl.path()).stack_type, StackKind::Dl);

    let notebook = workspace(&[("requirements.txt", "requests\n"), ("analysis.ipynb", "{}")]);
    assert_eq!(detector.detect(notebook.path()).stack_type, StackKind::Jupyter);

    let generic = workspace(&[("pyproject.toml", "[project]\nname = \"tool\"\n")]);
    assert_eq!(detector.detect(generic.path()).stack_type, StackKind::Python);
}

#[test]
fn given_gradle_wrapper_when_detect_then_android() {
    let dir = workspace(&[("gradlew", "#!/bin/sh\n")]);
    let detection = MarkerDetector::new().detect(dir.path());
    assert_eq!(detection.stack_type, StackKind::AndroidGradle);
    assert_eq!(detection.start_command.as_deref(), Some("./gradlew assembleDebug"));
}

#[test]
fn given_no_markers_when_detect_then_unknown() {
    let dir = workspace(&[("index.html", "<h1>hi</h1>")]);
    let detection = MarkerDetector::new().detect(dir.path());
    assert_eq!(detection.stack_type, StackKind::Unknown);
    assert_eq!(detection.rationale, vec!["no recognized markers".to_string()]);
}

#[test]
fn given_malformed_package_json_when_detect_then_degrades_gracefully() {
    let dir = workspace(&[("package.json", "{ not json")]);
    let detection = MarkerDetector::new().detect(dir.path());
    assert_eq!(detection.stack_type, StackKind::Unknown);
}

#[test]
fn given_missing_workspace_when_detect_then_unknown() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("gone");
    assert_eq!(MarkerDetector::new().detect(&missing).stack_type, StackKind::Unknown);
}
