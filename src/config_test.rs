use std::time::Duration;

use anyhow::Result;

use crate::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("RETRY_INTERVAL_MS".into(), "250".into()),
        ("RETRY_JITTER_MS".into(), "50".into()),
        ("INTAKE_QUEUE_CAPACITY".into(), "64".into()),
        ("MAX_CONCURRENT_MOVES".into(), "8".into()),
        ("REBALANCE_ON_JOIN".into(), "true".into()),
        ("SCENARIO_PATH".into(), "/etc/hadron/scenario.yaml".into()),
    ])?;
    config.validate()?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(
        config.retry_interval_ms == 250,
        "unexpected value parsed for RETRY_INTERVAL_MS, got {}, expected {}",
        config.retry_interval_ms,
        250
    );
    assert!(config.retry_jitter_ms == 50, "unexpected value parsed for RETRY_JITTER_MS, got {}, expected {}", config.retry_jitter_ms, 50);
    assert!(
        config.intake_queue_capacity == 64,
        "unexpected value parsed for INTAKE_QUEUE_CAPACITY, got {}, expected {}",
        config.intake_queue_capacity,
        64
    );
    assert!(
        config.max_concurrent_moves == 8,
        "unexpected value parsed for MAX_CONCURRENT_MOVES, got {}, expected {}",
        config.max_concurrent_moves,
        8
    );
    assert!(config.rebalance_on_join, "unexpected value parsed for REBALANCE_ON_JOIN, got false, expected true");
    assert!(
        config.scenario_path == "/etc/hadron/scenario.yaml",
        "unexpected value parsed for SCENARIO_PATH, got {}, expected {}",
        config.scenario_path,
        "/etc/hadron/scenario.yaml"
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![("RUST_LOG".into(), "info".into())])?;
    config.validate()?;

    assert!(
        config.retry_interval_ms == 5_000,
        "unexpected default for RETRY_INTERVAL_MS, got {}, expected {}",
        config.retry_interval_ms,
        5_000
    );
    assert!(config.retry_jitter_ms == 0, "unexpected default for RETRY_JITTER_MS, got {}, expected {}", config.retry_jitter_ms, 0);
    assert!(
        config.intake_queue_capacity == 1_000,
        "unexpected default for INTAKE_QUEUE_CAPACITY, got {}, expected {}",
        config.intake_queue_capacity,
        1_000
    );
    assert!(
        config.max_concurrent_moves == 32,
        "unexpected default for MAX_CONCURRENT_MOVES, got {}, expected {}",
        config.max_concurrent_moves,
        32
    );
    assert!(!config.rebalance_on_join, "unexpected default for REBALANCE_ON_JOIN, got true, expected false");
    assert!(config.scenario_path == "scenario.yaml", "unexpected default for SCENARIO_PATH, got {}", config.scenario_path);

    Ok(())
}

#[test]
fn config_rejects_zero_values() -> Result<()> {
    let config: Config = envy::from_iter(vec![("RUST_LOG".into(), "info".into()), ("MAX_CONCURRENT_MOVES".into(), "0".into())])?;
    let res = config.validate();
    assert!(res.is_err(), "expected validation to fail for MAX_CONCURRENT_MOVES=0");

    let config: Config = envy::from_iter(vec![("RUST_LOG".into(), "info".into()), ("RETRY_INTERVAL_MS".into(), "0".into())])?;
    let res = config.validate();
    assert!(res.is_err(), "expected validation to fail for RETRY_INTERVAL_MS=0");

    Ok(())
}

#[test]
fn retry_delay_stays_within_jitter_bounds() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "info".into()),
        ("RETRY_INTERVAL_MS".into(), "100".into()),
        ("RETRY_JITTER_MS".into(), "20".into()),
    ])?;

    for _ in 0..100 {
        let delay = config.retry_delay();
        assert!(
            delay >= Duration::from_millis(100) && delay <= Duration::from_millis(120),
            "expected retry delay within [100ms, 120ms], got {:?}",
            delay
        );
    }
    assert_eq!(config.retry_interval(), Duration::from_millis(100));

    Ok(())
}
