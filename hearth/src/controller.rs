use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use hearth_common::{Signal, internal, logging, tracing};
use hearth_delivery::{
    ChannelTransport, DeliveryPipeline, EncryptionProvider, LockService, MemoryLockService,
    Recovery, RetryPolicy,
};
use hearth_store::{MessageStore, StoreConfig};
use hearth_tracing::traced;
use serde::Deserialize;
use tokio::sync::broadcast;

const CONFIG_ENV: &str = "HEARTH_CONFIG";

const fn default_channel_capacity() -> usize {
    64
}

/// Top-level configuration
#[derive(Debug, Deserialize)]
pub struct Hearth {
    /// Persistent store backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Retry budget, backoff schedule and processor settings
    #[serde(default, alias = "retry")]
    pub recovery: RetryPolicy,

    /// Prefix for lease holder ids; unique per running instance
    ///
    /// Default: `process-<pid>`
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Buffered events per connected user before pushes are dropped
    ///
    /// Default: 64
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for Hearth {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            recovery: RetryPolicy::default(),
            instance_id: None,
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Everything a running instance is made of
///
/// Each instance owns its shutdown channel; stopping one leaves any other
/// instance in the process running.
#[derive(Debug)]
pub struct Services {
    pub store: Arc<dyn MessageStore>,
    pub locks: Arc<dyn LockService>,
    pub transport: Arc<ChannelTransport>,
    pub recovery: Arc<Recovery>,
    pub pipeline: Arc<DeliveryPipeline>,
    shutdown: broadcast::Sender<Signal>,
}

/// Find the configuration file using the following precedence:
/// 1. `HEARTH_CONFIG` environment variable
/// 2. ./hearth.config.ron (current working directory)
/// 3. /etc/hearth/hearth.config.ron (system-wide config)
///
/// # Errors
/// If `HEARTH_CONFIG` names a missing file, or no candidate exists
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    locate_config(
        std::env::var(CONFIG_ENV).ok().map(PathBuf::from),
        &[
            PathBuf::from("./hearth.config.ron"),
            PathBuf::from("/etc/hearth/hearth.config.ron"),
        ],
    )
}

fn locate_config(explicit: Option<PathBuf>, defaults: &[PathBuf]) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

#[traced(instrument(level = tracing::Level::TRACE))]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    Ok(())
}

impl Hearth {
    /// Parse a RON configuration
    ///
    /// # Errors
    /// If the text is not a valid configuration
    pub fn from_ron(config: &str) -> anyhow::Result<Self> {
        let hearth: Self = ron::from_str(config)?;
        hearth.recovery.validate()?;
        Ok(hearth)
    }

    /// # Errors
    /// If the file cannot be read or is not a valid configuration
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let config = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;
        Self::from_ron(&config)
    }

    /// Load the configuration found by [`find_config_file`]
    ///
    /// # Errors
    /// If no configuration can be found or parsed
    pub fn load() -> anyhow::Result<Self> {
        Self::from_file(&find_config_file()?)
    }

    /// Build an instance around `encryption` with the configured store and
    /// a process-local lock service
    ///
    /// Leases taken by such an instance are only visible inside this
    /// process. Instances sharing a store across processes must be built
    /// with [`Hearth::services_with`].
    ///
    /// # Errors
    /// If the recovery processor cannot be wired
    pub fn services(&self, encryption: Arc<dyn EncryptionProvider>) -> anyhow::Result<Services> {
        self.services_with(
            self.store.clone().into_store(),
            Arc::new(MemoryLockService::new()),
            encryption,
        )
    }

    /// Build an instance around externally provided collaborators
    ///
    /// The `store` section of the configuration is ignored.
    ///
    /// # Errors
    /// If the recovery processor cannot be wired
    pub fn services_with(
        &self,
        store: Arc<dyn MessageStore>,
        locks: Arc<dyn LockService>,
        encryption: Arc<dyn EncryptionProvider>,
    ) -> anyhow::Result<Services> {
        let transport = Arc::new(ChannelTransport::new(self.channel_capacity));

        let mut builder = Recovery::builder()
            .store(Arc::clone(&store))
            .locks(Arc::clone(&locks))
            .encryption(encryption)
            .transport(transport.clone())
            .policy(self.recovery.clone());
        if let Some(instance_id) = &self.instance_id {
            builder = builder.instance_id(instance_id.clone());
        }

        let recovery = Arc::new(builder.build()?);
        let pipeline = Arc::new(DeliveryPipeline::new(Arc::clone(&recovery)));
        let (shutdown, _receiver) = broadcast::channel(16);

        Ok(Services {
            store,
            locks,
            transport,
            recovery,
            pipeline,
            shutdown,
        })
    }

    /// Run a single instance until SIGINT or SIGTERM
    ///
    /// # Errors
    /// If wiring fails or the signal handlers cannot be installed
    pub async fn run(self, encryption: Arc<dyn EncryptionProvider>) -> anyhow::Result<()> {
        self.services(encryption)?.run().await
    }
}

impl Services {
    /// Run until SIGINT or SIGTERM
    ///
    /// # Errors
    /// If the signal handlers cannot be installed or the processor fails
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        self.serve(shutdown()).await
    }

    /// Receiver for this instance's shutdown signal
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.shutdown.subscribe()
    }

    /// Run the recovery processor until `stop` completes
    ///
    /// # Errors
    /// If `stop` or the processor fails
    pub async fn serve(
        &self,
        stop: impl Future<Output = anyhow::Result<()>>,
    ) -> anyhow::Result<()> {
        internal!(
            "Controller running as {}",
            self.recovery.instance_id()
        );

        let processor = tokio::spawn(Arc::clone(&self.recovery).serve(self.subscribe()));

        let ret = stop.await;

        internal!("Shutting down...");
        if self.shutdown.send(Signal::Shutdown).is_err() {
            tracing::debug!("No shutdown listeners left");
        }

        processor.await??;
        ret
    }
}
