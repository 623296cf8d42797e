//! Unit tests for configuration and error mapping
//!
//! Tests cover:
//! - Config file loading with every section
//! - Validation failures surfacing as config exit codes
//! - Exit codes of the error kinds the CLI reports

use stagehand::config::Config;
use stagehand::errors::{
    get_exit_code, ProtocolError, SchedulingError, StagehandError, EXIT_CONFIG_ERROR,
    EXIT_NETWORK_ERROR, EXIT_SCHEDULING_ERROR,
};
use std::io::Write;

mod config_file_tests {
    use super::*;

    #[test]
    fn test_full_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[plugins]
repos = ["/studio/plugins", "/home/artist/plugins"]
default_require = ["studio_base>=1.0"]

[network]
host = "0.0.0.0"
port = 9100
rpc_timeout_secs = 5
registration_timeout_secs = 20

[scheduling]
default_scheduler = "remote"
liveness_timeout_secs = 30
max_concurrency = 2

[logging]
filter = "stagehand=trace"
json = true
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.plugins.repos.len(), 2);
        assert_eq!(config.plugins.default_require, vec!["studio_base>=1.0"]);
        assert_eq!(config.core_address(), "0.0.0.0:9100");
        assert_eq!(config.network.registration_timeout_secs, 20);
        assert_eq!(config.scheduling.default_scheduler, "remote");
        assert_eq!(config.scheduling.max_concurrency, 2);
        assert!(config.logging.json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nport = 7000").unwrap();

        let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.network.port, 7000);
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.scheduling.default_scheduler, "local");
        assert_eq!(config.scheduling.max_concurrency, 8);
    }
}

mod exit_code_tests {
    use super::*;

    #[test]
    fn test_invalid_config_maps_to_config_exit_code() {
        let mut config = Config::default();
        config.scheduling.max_concurrency = 0;
        let err: anyhow::Error = config.validate().unwrap_err().into();
        assert_eq!(get_exit_code(&err), EXIT_CONFIG_ERROR);
    }

    #[test]
    fn test_network_and_scheduling_exit_codes() {
        let err: anyhow::Error = StagehandError::Protocol(ProtocolError::Connect {
            address: "127.0.0.1:1".to_string(),
            message: "refused".to_string(),
        })
        .into();
        assert_eq!(get_exit_code(&err), EXIT_NETWORK_ERROR);

        let err: anyhow::Error = StagehandError::Scheduling(SchedulingError::NoProcessor {
            query: "nuke".to_string(),
        })
        .into();
        assert_eq!(get_exit_code(&err), EXIT_SCHEDULING_ERROR);
    }
}
