//! Configuration loading: file layering and environment overrides.

use evalsmith::domain::models::ConsistencyMethod;
use evalsmith::infrastructure::config::ConfigLoader;
use std::fs;
use tempfile::TempDir;

fn project_with(config_yaml: &str, local_yaml: Option<&str>) -> TempDir {
    let dir = TempDir::new().unwrap();
    let config_dir = dir.path().join(".evalsmith");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("config.yaml"), config_yaml).unwrap();
    if let Some(local) = local_yaml {
        fs::write(config_dir.join("local.yaml"), local).unwrap();
    }
    dir
}

#[test]
fn test_defaults_without_files() {
    let dir = TempDir::new().unwrap();
    temp_env::with_vars_unset(
        ["EVALSMITH_EXECUTION__MAX_CONCURRENCY", "EVALSMITH_LLM__PROVIDER"],
        || {
            let config = ConfigLoader::load_for_project(dir.path()).unwrap();
            assert_eq!(config.storage.spec_path, ".evalsmith/eval-spec.json");
            assert_eq!(config.llm.provider, "anthropic");
            assert!(config.execution.max_concurrency >= 1);
        },
    );
}

#[test]
fn test_local_file_overrides_project_file() {
    let dir = project_with(
        "execution:\n  max_concurrency: 4\nevaluation:\n  consistency_method: uniqueness\n",
        Some("execution:\n  max_concurrency: 8\n"),
    );
    temp_env::with_var_unset("EVALSMITH_EXECUTION__MAX_CONCURRENCY", || {
        let config = ConfigLoader::load_for_project(dir.path()).unwrap();
        assert_eq!(config.execution.max_concurrency, 8);
        assert_eq!(config.evaluation.consistency_method, ConsistencyMethod::Uniqueness);
    });
}

#[test]
fn test_environment_overrides_files() {
    let dir = project_with("execution:\n  max_concurrency: 4\n", None);
    temp_env::with_vars(
        [
            ("EVALSMITH_EXECUTION__MAX_CONCURRENCY", Some("12")),
            ("EVALSMITH_LLM__PROVIDER", Some("mock")),
        ],
        || {
            let config = ConfigLoader::load_for_project(dir.path()).unwrap();
            assert_eq!(config.execution.max_concurrency, 12);
            assert_eq!(config.llm.provider, "mock");
        },
    );
}

#[test]
fn test_invalid_values_are_rejected() {
    let dir = project_with("execution:\n  max_concurrency: 0\n", None);
    temp_env::with_var_unset("EVALSMITH_EXECUTION__MAX_CONCURRENCY", || {
        let err = ConfigLoader::load_for_project(dir.path()).unwrap_err();
        assert!(err.to_string().contains("max_concurrency"));
    });

    let dir = project_with("evaluation:\n  similarity_threshold: 1.5\n", None);
    let err = ConfigLoader::load_for_project(dir.path()).unwrap_err();
    assert!(err.to_string().contains("similarity_threshold"));
}
