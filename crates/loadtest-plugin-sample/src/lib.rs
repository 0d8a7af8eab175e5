//! Sample pgstress plugin.
//!
//! Provides `kv_mix`, a key/value get/put mix over `pgstress_kv`. Build it as
//! a `cdylib` and drop the library into a configured plugin directory:
//!
//! ```text
//! cargo build -p loadtest-plugin-sample --release
//! pgstress run --workload kv_mix --plugin-dir target/release
//! ```
//!
//! Options (`workload_options` in the run config):
//!
//! - `keys` - number of distinct keys per unit of scale (default 10000)
//! - `read_percent` - share of operations that are gets (default 80)
//! - `value_size` - bytes written per put (default 128)

use async_trait::async_trait;
use loadtest_engine::{
    declare_plugin, PluginDatabase, PluginHost, PluginMetadata, PluginWorker, PluginWorkload,
    RunConfig, WorkloadError, WorkloadPlugin,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

pub const KV_MIX: &str = "kv_mix";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS pgstress_kv (\
    key TEXT PRIMARY KEY, \
    value BYTEA NOT NULL)";

const DROP_TABLE: &str = "DROP TABLE IF EXISTS pgstress_kv";

const GET: &str = "SELECT value FROM pgstress_kv WHERE key = $1";

const PUT: &str = "INSERT INTO pgstress_kv (key, value) VALUES ($1, $2) \
    ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value";

/// Tuning for one `kv_mix` run, read from `workload_options`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvOptions {
    pub keys: u64,
    pub read_percent: u32,
    pub value_size: usize,
}

impl KvOptions {
    pub fn from_config(config: &RunConfig) -> Result<Self, WorkloadError> {
        let per_scale = config.option_u64("keys", 10_000);
        let read_percent = config.option_u64("read_percent", 80);
        if read_percent > 100 {
            return Err(WorkloadError::Config(format!(
                "read_percent must be within 0..=100, got {read_percent}"
            )));
        }
        Ok(Self {
            keys: config.scale.max(1).saturating_mul(per_scale).max(1),
            read_percent: read_percent as u32,
            value_size: config.option_u64("value_size", 128) as usize,
        })
    }
}

/// The `kv_mix` workload.
///
/// Everything here runs inside the plugin library: it only computes keys and
/// values and issues queries through the host's [`PluginDatabase`]. Timing,
/// timeouts and metrics stay with the host.
#[derive(Debug, Default)]
pub struct KvMixWorkload;

#[async_trait]
impl PluginWorkload for KvMixWorkload {
    async fn setup(&self, db: &dyn PluginDatabase, _: &RunConfig) -> Result<(), WorkloadError> {
        db.batch_execute(CREATE_TABLE).await?;
        info!("Table pgstress_kv ready");
        Ok(())
    }

    async fn cleanup(&self, db: &dyn PluginDatabase, _: &RunConfig) -> Result<(), WorkloadError> {
        db.batch_execute(DROP_TABLE).await?;
        db.batch_execute(CREATE_TABLE).await?;
        Ok(())
    }

    fn worker(
        &self,
        worker_id: usize,
        config: &RunConfig,
    ) -> Result<Box<dyn PluginWorker>, WorkloadError> {
        let options = KvOptions::from_config(config)?;
        debug!("kv_mix worker {} starting with {:?}", worker_id, options);
        Ok(Box::new(KvWorker::new(options, StdRng::from_entropy())))
    }
}

/// One worker's get/put generator.
pub struct KvWorker {
    options: KvOptions,
    rng: StdRng,
    value: Vec<u8>,
}

impl KvWorker {
    pub fn new(options: KvOptions, rng: StdRng) -> Self {
        let value = vec![0u8; options.value_size];
        Self { options, rng, value }
    }
}

#[async_trait]
impl PluginWorker for KvWorker {
    async fn operation(&mut self, db: &dyn PluginDatabase) -> Result<(), WorkloadError> {
        let key = format!("key-{}", self.rng.gen_range(0..self.options.keys));
        if self.rng.gen_range(0..100) < self.options.read_percent {
            db.query_opt(GET, &[&key]).await?;
        } else {
            self.rng.fill(self.value.as_mut_slice());
            db.execute(PUT, &[&key, &self.value]).await?;
        }
        Ok(())
    }
}

/// Plugin object exported to the host.
#[derive(Debug, Default)]
pub struct KvPlugin;

impl WorkloadPlugin for KvPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            name: "kv".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Key/value get/put mix".to_string(),
            author: "pgstress contributors".to_string(),
            workload_types: vec![KV_MIX.to_string()],
            required_extensions: Vec::new(),
            min_db_version: Some(12),
            homepage: None,
        }
    }

    fn create_workload(
        &self,
        workload_type: &str,
    ) -> Result<Box<dyn PluginWorkload>, WorkloadError> {
        match workload_type {
            KV_MIX => Ok(Box::new(KvMixWorkload)),
            other => Err(WorkloadError::Unsupported(other.to_string())),
        }
    }

    fn initialize(&self, _: &PluginHost) -> Result<(), WorkloadError> {
        info!("kv plugin initialized");
        Ok(())
    }

    fn cleanup(&self) -> Result<(), WorkloadError> {
        info!("kv plugin cleaned up");
        Ok(())
    }
}

declare_plugin!(KvPlugin::default);
