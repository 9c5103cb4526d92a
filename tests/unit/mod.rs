//! Unit tests for shard-keeper.
//!
//! These tests run without a coordination service or store and exercise the
//! public API of individual components.

mod payload_tests {
    use shard_keeper::membership::{PayloadError, ShardPayload, parse_shard_index};

    #[test]
    fn test_endpoint_payload() {
        assert_eq!(
            ShardPayload::parse(b"cache-7.internal:6380"),
            Ok(ShardPayload::Endpoint {
                host: "cache-7.internal".to_string(),
                port: 6380
            })
        );
    }

    #[test]
    fn test_sentinel_payload() {
        assert_eq!(ShardPayload::parse(b"0"), Ok(ShardPayload::Vacant));
        assert_eq!(ShardPayload::parse(b"0\n"), Ok(ShardPayload::Vacant));
    }

    #[test]
    fn test_double_zero_is_not_sentinel() {
        assert!(matches!(
            ShardPayload::parse(b"00"),
            Err(PayloadError::Format(_))
        ));
    }

    #[test]
    fn test_index_names() {
        assert_eq!(parse_shard_index("3"), Some(3));
        assert_eq!(parse_shard_index("03"), None);
        assert_eq!(parse_shard_index("lock"), None);
    }
}

mod state_machine_tests {
    use shard_keeper::membership::{WatchState, WatchStateMachine, WatchTrigger};

    #[test]
    fn test_valid_triggers_from_watching() {
        let sm = WatchStateMachine::new();
        let triggers = sm.valid_triggers(WatchState::Watching);
        assert!(triggers.contains(&WatchTrigger::Fired));
        assert!(triggers.contains(&WatchTrigger::Dropped));
        assert!(!triggers.contains(&WatchTrigger::Armed));
    }

    #[test]
    fn test_valid_triggers_from_firing() {
        let sm = WatchStateMachine::new();
        // Firing must be re-armed or dropped; it cannot fire again
        assert!(sm.can_transition(WatchState::Firing, WatchTrigger::Rearmed));
        assert!(sm.can_transition(WatchState::Firing, WatchTrigger::Dropped));
        assert!(!sm.can_transition(WatchState::Firing, WatchTrigger::Fired));
        assert!(!sm.can_transition(WatchState::Firing, WatchTrigger::Armed));
    }

    #[test]
    fn test_unwatched_cannot_drop_or_fire() {
        let sm = WatchStateMachine::new();
        assert!(!sm.can_transition(WatchState::Unwatched, WatchTrigger::Dropped));
        assert!(!sm.can_transition(WatchState::Unwatched, WatchTrigger::Fired));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(WatchState::Unwatched.to_string(), "Unwatched");
        assert_eq!(WatchState::Watching.to_string(), "Watching");
        assert_eq!(WatchState::Firing.to_string(), "Firing");
        assert_eq!(WatchTrigger::Rearmed.to_string(), "Rearmed");
    }
}

mod selector_tests {
    use shard_keeper::client::{Selector, byte_sum};

    #[test]
    fn test_reference_scenario() {
        assert_eq!(byte_sum(2, "abc"), 0);
    }

    #[test]
    fn test_selector_is_shareable() {
        let selector = Selector::byte_sum();
        let copy = selector.clone();
        assert_eq!(selector.select(5, "abc"), copy.select(5, "abc"));
        assert_eq!(format!("{selector:?}"), "Selector { name: \"byte-sum\" }");
    }
}

mod error_tests {
    use shard_keeper::Error;
    use shard_keeper::coordination::CoordinationError;

    #[test]
    fn test_error_is_retryable() {
        let unavailable = Error::ShardUnavailable {
            index: 1,
            shard_count: 1,
        };
        assert!(unavailable.is_retryable());
        assert!(unavailable.retry_after().is_some());

        let coordination: Error = CoordinationError::Unavailable("session expired".to_string()).into();
        assert!(coordination.is_retryable());

        assert!(!Error::NoRoutingKey.is_retryable());
        assert!(!Error::InvalidConfig("bad".to_string()).is_retryable());
        assert!(
            !Error::MalformedShardData {
                path: "/redis/servers/cluster/3".to_string(),
                reason: "Expected host:port".to_string(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_malformed_display() {
        let err = Error::MalformedShardData {
            path: "/redis/servers/cluster/3".to_string(),
            reason: "Invalid port \"70000\"".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Malformed shard data at /redis/servers/cluster/3: Invalid port \"70000\""
        );
    }
}

mod config_tests {
    use shard_keeper::config::{ENV_BACKEND_PASSWORD, ENV_COORDINATION_ADDRESS};
    use shard_keeper::{Error, KeeperConfig, VacantPolicy};

    #[test]
    fn test_config_from_file() {
        let dir = std::env::temp_dir().join(format!("shard-keeper-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("keeper.toml");
        std::fs::write(
            &path,
            "base_path = \"/kv\"\nvacant_policy = \"keep-stale\"\nhealth_port = 9100\n",
        )
        .unwrap();

        let config = KeeperConfig::load(&path).unwrap();
        assert_eq!(config.cluster_path(), "/kv/cluster");
        assert_eq!(config.vacant_policy, VacantPolicy::KeepStale);
        assert_eq!(config.health_port, 9100);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = KeeperConfig::load("/nonexistent/shard-keeper.toml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_overrides() {
        let config = KeeperConfig::default().with_overrides_from(|key| match key {
            ENV_COORDINATION_ADDRESS => Some("zk-a:2181,zk-b:2181".to_string()),
            ENV_BACKEND_PASSWORD => Some("hunter2".to_string()),
            _ => None,
        });
        assert_eq!(config.coordination_address, "zk-a:2181,zk-b:2181");
        assert_eq!(config.backend_config().password.as_deref(), Some("hunter2"));
        assert_eq!(config.base_path, "/redis/servers");
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let err = KeeperConfig::from_toml("[reconnect]\nmultiplier = 0.5\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
