use ap_core::config::{Config, ExecutorConfig, RestWindow};

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.name, "autopilot");
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.general.log_format, "human");
    assert_eq!(cfg.engine.tick_interval_secs, 60);
    assert_eq!(cfg.supervisor.stall_threshold_secs, 600);
    assert_eq!(cfg.supervisor.cooldown_secs, 300);
    assert_eq!(cfg.supervisor.max_unproductive_restarts, 3);
    assert_eq!(cfg.dispatch.chain, vec!["shell".to_string()]);
    assert_eq!(cfg.approval.expiry_secs, 3600);
    assert_eq!(cfg.work_log.retention, 1000);
    assert!(cfg.risk.safe_action_types.contains(&"research".to_string()));
    assert!(matches!(
        cfg.executors.get("shell"),
        Some(ExecutorConfig::Command { .. })
    ));
    cfg.validate().expect("default config validates");
}

#[test]
fn config_roundtrip() {
    let mut cfg = Config::default();
    cfg.supervisor.rest_windows.push(RestWindow::new("23:00", "07:00"));
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("autopilot"));

    let parsed = Config::from_toml(&toml_str).expect("parse toml back");
    assert_eq!(parsed, cfg);
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[engine]
tick_interval_secs = 15

[supervisor]
stall_threshold_secs = 120
rest_windows = [{ start = "22:30", end = "06:00" }]
"#;
    let cfg = Config::from_toml(partial).expect("parse partial");
    assert_eq!(cfg.engine.tick_interval_secs, 15);
    assert_eq!(cfg.supervisor.stall_threshold_secs, 120);
    assert_eq!(cfg.supervisor.rest_windows.len(), 1);
    // defaults should fill in the rest
    assert_eq!(cfg.supervisor.cooldown_secs, 300);
    assert_eq!(cfg.general.log_level, "info");
    assert!(cfg.executors.contains_key("shell"));
}

#[test]
fn executor_chain_from_toml() {
    let text = r#"
[dispatch]
chain = ["primary", "backup"]
default_timeout_ms = 5000

[executors.primary]
kind = "command"
program = "/usr/local/bin/agent"
args = ["--json"]
rate_limited_exit_code = 75

[executors.backup]
kind = "stub"
reason = "not configured"
"#;
    let cfg = Config::from_toml(text).expect("parse executors");
    assert_eq!(cfg.dispatch.chain, vec!["primary", "backup"]);
    match cfg.executors.get("primary") {
        Some(ExecutorConfig::Command {
            program,
            args,
            rate_limited_exit_code,
            ..
        }) => {
            assert_eq!(program.as_deref(), Some("/usr/local/bin/agent"));
            assert_eq!(args, &vec!["--json".to_string()]);
            assert_eq!(*rate_limited_exit_code, Some(75));
        }
        other => panic!("unexpected executor config: {other:?}"),
    }
    assert!(matches!(
        cfg.executors.get("backup"),
        Some(ExecutorConfig::Stub { .. })
    ));
}

#[test]
fn unknown_executor_in_chain_fails_validation() {
    let mut cfg = Config::default();
    cfg.dispatch.chain.push("missing".into());
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("missing"));
}

#[test]
fn stall_threshold_must_exceed_tick() {
    let mut cfg = Config::default();
    cfg.supervisor.stall_threshold_secs = cfg.engine.tick_interval_secs;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("stall_threshold_secs"));
}

#[test]
fn heartbeat_is_quarter_of_stall_threshold() {
    let mut cfg = Config::default();
    cfg.supervisor.stall_threshold_secs = 2;
    assert_eq!(
        cfg.supervisor.heartbeat_interval(),
        std::time::Duration::from_millis(500)
    );
}

#[test]
fn load_from_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load_from(dir.path().join("nope.toml")).unwrap_err();
    assert!(err.to_string().starts_with("io:"));
}
