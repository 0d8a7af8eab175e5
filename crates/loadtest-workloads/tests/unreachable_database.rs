//! Builtin workloads against a database that refuses connections.
//!
//! Every checkout fails, so each worker records connection errors until it
//! gives up, and the driver reports the run as failed once all workers
//! have returned.

use loadtest_engine::{DatabaseConfig, Driver, EngineError, RunConfig, RunState, SetupMode};
use loadtest_workloads::builtins;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_connection_workload_fails_without_database() {
    let mut config = RunConfig::new("connection", 2, 2)
        .with_duration(Duration::from_secs(30))
        .with_operation_timeout(Duration::from_secs(2))
        .with_database(DatabaseConfig::from_url(
            "postgresql://pgstress@127.0.0.1:1/pgstress",
        ));
    config.workload_options.insert(
        "max_pool_failures".to_string(),
        serde_yaml::Value::Number(3u64.into()),
    );

    let factory = loadtest_engine::WorkloadFactory::new(&config, builtins()).unwrap();
    let workload = factory.get("connection").unwrap();
    let driver = Driver::new(config).unwrap();
    let pool = driver.build_pool().unwrap();

    let err = driver
        .run_with_pool(workload, &pool, SetupMode::Skip, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::RunFailed { .. }), "{err}");
    assert_eq!(driver.state(), RunState::Failed);
    factory.cleanup().unwrap();
}

#[tokio::test]
async fn test_execute_rejects_unreachable_database() {
    let config = RunConfig::new("simple", 1, 1)
        .with_operation_timeout(Duration::from_secs(2))
        .with_database(DatabaseConfig::from_url(
            "postgresql://pgstress@127.0.0.1:1/pgstress",
        ));
    let factory = loadtest_engine::WorkloadFactory::new(&config, builtins()).unwrap();
    let driver = Driver::new(config).unwrap();

    let err = driver
        .execute(
            factory.get("simple").unwrap(),
            SetupMode::Setup,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Pool(_)), "{err}");
    assert_eq!(driver.state(), RunState::Failed);
}
