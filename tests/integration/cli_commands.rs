//! CLI commands run against file-backed configuration.

use clap::Parser;
use tempfile::TempDir;

use grantflow::cli::{map_error, Cli, RunContext};
use grantflow::error::CliError;

const CONFIG: &str = r#"
[backend]
base_url = "http://127.0.0.1:9/api"
api_key = "top-secret"

[[catalog.sections]]
key = "summary"
display_name = "Summary"
expected_unit_count = 2
ordinal = 0

[[catalog.sections]]
key = "budget"
display_name = "Budget"
expected_unit_count = 1
ordinal = 1
"#;

fn context_for(temp_dir: &TempDir, args: &[&str]) -> (Cli, RunContext) {
    let config_path = temp_dir.path().join("grantflow.toml");
    std::fs::write(&config_path, CONFIG).unwrap();
    let workspace = temp_dir.path().to_string_lossy().to_string();
    let config = config_path.to_string_lossy().to_string();
    let mut argv = vec!["grantflow", "--workspace", workspace.as_str(), "--config", config.as_str()];
    argv.extend_from_slice(args);
    let cli = Cli::try_parse_from(argv).unwrap();
    let ctx = RunContext::new(cli.workspace.clone(), cli.config.clone()).unwrap();
    (cli, ctx)
}

#[tokio::test]
async fn catalog_command_uses_configured_sections() {
    let temp_dir = TempDir::new().unwrap();
    let (cli, ctx) = context_for(&temp_dir, &["catalog", "--format", "json"]);

    let out = ctx.execute(&cli.command).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
    let keys: Vec<&str> = parsed["sections"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["key"].as_str().unwrap())
        .collect();
    assert_eq!(keys, vec!["summary", "budget"]);
}

#[tokio::test]
async fn config_command_hides_credentials() {
    let temp_dir = TempDir::new().unwrap();
    let (cli, ctx) = context_for(&temp_dir, &["config"]);

    let out = ctx.execute(&cli.command).await.unwrap();
    assert!(out.contains("http://127.0.0.1:9/api"));
    assert!(!out.contains("top-secret"));
}

#[tokio::test]
async fn generate_reports_unreadable_context() {
    let temp_dir = TempDir::new().unwrap();
    let (cli, ctx) = context_for(&temp_dir, &["generate", "--context", "missing.json"]);

    let err = ctx.execute(&cli.command).await.unwrap_err();
    assert!(matches!(err, CliError::Read { .. }));
    assert!(map_error(&err).contains("missing.json"));
}

#[test]
fn invalid_config_file_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("grantflow.toml");
    std::fs::write(&config_path, "[generation]\npoll_interval_ms = 0\n").unwrap();
    assert!(RunContext::new(temp_dir.path().to_path_buf(), Some(config_path)).is_err());
}
