//! Command implementations behind the CLI.

use crate::config::load_config;
use crate::report::{self, RunDocument};
use crate::{OutputFormat, PluginOpts, RunOpts};
use anyhow::Context;
use chrono::Utc;
use loadtest_engine::{
    pool, prepare, setup_shutdown_handler, DbPool, Driver, EngineError, RunConfig, RunContext,
    SetupMode, WorkloadFactory,
};
use tracing::{info, warn};

/// Schema maintenance outside a timed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Maintenance {
    Setup,
    Rebuild,
    Cleanup,
}

/// Build the workload factory from builtins and the configured plugins.
pub fn build_factory(config: &RunConfig) -> anyhow::Result<WorkloadFactory> {
    let factory = WorkloadFactory::new(config, loadtest_workloads::builtins())
        .context("Failed to register workloads")?;
    for failure in factory.load_failures() {
        warn!("Skipping plugin: {}", failure);
    }
    Ok(factory)
}

/// `pgstress run`: one timed run of the configured workload.
pub async fn run(opts: &RunOpts, mode: SetupMode, format: OutputFormat) -> anyhow::Result<()> {
    let config = load_config(opts)?;
    let factory = build_factory(&config)?;
    let result = run_workload(&factory, config, mode, format).await;
    finish(&factory, result)
}

async fn run_workload(
    factory: &WorkloadFactory,
    config: RunConfig,
    mode: SetupMode,
    format: OutputFormat,
) -> anyhow::Result<()> {
    // Unknown names fail before any connection is opened.
    factory.resolve(&config.workload)?;

    info!("Target database: {}", config.database.display_target());
    let driver = Driver::new(config)?;
    let pool = driver.build_pool()?;

    let outcome: anyhow::Result<_> = async {
        pool::probe(&pool).await?;
        factory.initialize(&pool).await?;
        let workload = factory.get(&driver.config().workload)?;
        let cancel = setup_shutdown_handler();
        let started_at = Utc::now();
        let report = driver.run_with_pool(workload, &pool, mode, cancel).await?;
        Ok((report, started_at, Utc::now()))
    }
    .await;
    pool.close();

    let (report, started_at, completed_at) =
        outcome.with_context(|| format!("Run of workload '{}' failed", driver.config().workload))?;
    match format {
        OutputFormat::Table => {
            println!("{}", report::format_table(&report, started_at, completed_at));
        }
        OutputFormat::Json => {
            let doc = RunDocument::new(&report, started_at, completed_at);
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    Ok(())
}

/// `pgstress setup` / `pgstress cleanup`.
pub async fn maintain(opts: &RunOpts, action: Maintenance) -> anyhow::Result<()> {
    let config = load_config(opts)?;
    let factory = build_factory(&config)?;
    let result = maintain_workload(&factory, &config, action).await;
    finish(&factory, result)
}

async fn maintain_workload(
    factory: &WorkloadFactory,
    config: &RunConfig,
    action: Maintenance,
) -> anyhow::Result<()> {
    factory.resolve(&config.workload)?;
    let pool = pool::build_pool(&config.database, config.connections, config.operation_timeout)?;
    let result = apply(factory, &pool, config, action).await;
    pool.close();
    result.with_context(|| format!("{action:?} of workload '{}' failed", config.workload))?;
    info!("{:?} of workload '{}' done", action, config.workload);
    Ok(())
}

async fn apply(
    factory: &WorkloadFactory,
    pool: &DbPool,
    config: &RunConfig,
    action: Maintenance,
) -> Result<(), EngineError> {
    pool::probe(pool).await?;
    factory.initialize(pool).await?;
    let workload = factory.get(&config.workload)?;
    let cancel = setup_shutdown_handler();
    match action {
        Maintenance::Setup => prepare(workload.as_ref(), pool, config, SetupMode::Setup, &cancel).await,
        Maintenance::Rebuild => {
            prepare(workload.as_ref(), pool, config, SetupMode::Rebuild, &cancel).await
        }
        Maintenance::Cleanup => {
            let ctx = RunContext::control(cancel.child_token(), config.operation_timeout);
            workload
                .cleanup(&ctx, pool, config)
                .await
                .map_err(|source| EngineError::Cleanup {
                    workload: config.workload.clone(),
                    source,
                })
        }
    }
}

/// `pgstress list`: every workload the binary and the plugins provide.
pub fn list(plugins: &PluginOpts, format: OutputFormat) -> anyhow::Result<()> {
    let mut config = RunConfig::new("list", 1, 1);
    config.plugin_dirs = plugins.plugin_dirs.clone();
    config.plugins = plugins.plugins.clone();

    let factory = build_factory(&config)?;
    let listing = report::workload_listing(&factory);
    match format {
        OutputFormat::Table => println!("{}", report::format_listing(&listing)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&listing)?),
    }
    factory.cleanup()?;
    Ok(())
}

/// Plugin cleanup always runs; a run error takes precedence over a cleanup error.
fn finish(factory: &WorkloadFactory, result: anyhow::Result<()>) -> anyhow::Result<()> {
    match (result, factory.cleanup()) {
        (Err(e), Err(cleanup)) => {
            warn!("Plugin cleanup failed: {}", cleanup);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), cleanup) => Ok(cleanup?),
    }
}
