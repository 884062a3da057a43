use agent_conductor::logging::{init_tracing, LogFormat};
use agent_conductor::AppError;

#[derive(serde::Deserialize)]
struct Wrapper {
    log_format: LogFormat,
}

#[test]
fn log_format_parses_snake_case() {
    let text: Wrapper = toml::from_str("log_format = \"text\"").expect("text");
    assert_eq!(text.log_format, LogFormat::Text);

    let json: Wrapper = toml::from_str("log_format = \"json\"").expect("json");
    assert_eq!(json.log_format, LogFormat::Json);

    assert_eq!(LogFormat::default(), LogFormat::Text);
}

/// Only one global subscriber can be installed per process.
#[test]
fn second_init_is_config_error() {
    let _ = init_tracing(LogFormat::Text);

    match init_tracing(LogFormat::Json) {
        Err(AppError::Config(msg)) => assert!(msg.contains("failed to init tracing")),
        other => panic!("expected config error, got {other:?}"),
    }
}
