use super::*;
use tempfile::TempDir;

#[test]
fn test_level_parsing_accepts_common_spellings() {
    assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
    assert_eq!(" INFO ".parse::<LogLevel>().unwrap(), LogLevel::Info);
    assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
}

#[test]
fn test_unknown_level() {
    let err = "loud".parse::<LogLevel>().unwrap_err();
    assert!(matches!(err, TelemetryError::UnknownLevel(ref s) if s == "loud"));
}

#[test]
fn test_level_names_are_filter_syntax() {
    for level in [LogLevel::Trace, LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
        assert_eq!(level.as_str().parse::<LogLevel>().unwrap(), level);
        assert_eq!(level.to_string(), level.as_str());
    }
    assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
    assert!(LogLevel::Trace < LogLevel::Error);
}

#[test]
fn test_default_config() {
    let config = LogConfig::default();
    assert_eq!(config.level, LogLevel::Info);
    assert_eq!(config.format, LogFormat::Compact);
    assert_eq!(config.output, LogOutput::Stderr);
    assert!(config.directives.is_empty());
    assert!(config.include_thread_ids);
}

#[test]
fn test_bad_directive_is_rejected() {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    let config = LogConfig {
        directives: vec!["warp_agreement::arbiter=debug".into(), "warp_agreement=loudest".into()],
        ..Default::default()
    };
    let err = config.env_filter().unwrap_err();
    assert!(matches!(err, TelemetryError::BadDirective(_)));
}

#[test]
fn test_module_directive_parses() {
    let config = LogConfig {
        directives: vec!["warp_agreement::ordering=trace".into()],
        ..Default::default()
    };
    assert!(config.env_filter().is_ok());
}

#[test]
fn test_file_output_creates_parent_directories() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("site.log");
    let config = LogConfig {
        output: LogOutput::File(path.clone()),
        ..Default::default()
    };

    // The file is opened before installation, so it exists even when
    // another test already owns the global subscriber.
    let _ = init_logging(&config);
    assert!(path.exists());
}

#[test]
fn test_init_test_logging_is_idempotent() {
    init_test_logging();
    init_test_logging();
    tracing::info!(site = 0, "test logger installed");
}
