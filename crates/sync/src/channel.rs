//! Channel construction and the polling loop.
//!
//! The factory turns a stored [`ChannelConfig`] into a live transport;
//! the polling channel drives one remote on a fixed interval, with
//! exponential backoff after failures and a hard stop once the failure
//! budget is spent.

use std::sync::Arc;

use async_trait::async_trait;
use strand_primitives::{ChannelConfig, ChannelType};
use strand_store::OperationStore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::config::SyncConfig;
use crate::transport::{ChannelTransport, CredentialProvider, HttpTransport, InProcessTransport};
use crate::SyncError;

/// Channel parameter carrying the remote endpoint for network channels.
pub const PARAM_URL: &str = "url";

/// Builds transports out of stored channel configs.
#[derive(Default)]
pub struct ChannelFactory {
    http: reqwest::Client,
    credentials: Option<Arc<dyn CredentialProvider>>,
    /// Store of a co-resident reactor, for in-process channels.
    in_process: Option<Arc<dyn OperationStore>>,
}

impl ChannelFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_in_process_peer(mut self, store: Arc<dyn OperationStore>) -> Self {
        self.in_process = Some(store);
        self
    }

    /// Validates the config and builds the transport. Registration calls
    /// this before anything is persisted, so a bad config never becomes a
    /// remote.
    pub fn create(&self, config: &ChannelConfig) -> Result<Arc<dyn ChannelTransport>, SyncError> {
        match config.channel_type {
            ChannelType::Network => {
                let raw = config.parameters.get(PARAM_URL).ok_or_else(|| {
                    SyncError::InvalidChannelConfig(format!(
                        "network channel requires a `{PARAM_URL}` parameter"
                    ))
                })?;

                let endpoint: Url = raw.parse().map_err(|err| {
                    SyncError::InvalidChannelConfig(format!("unparseable url {raw:?}: {err}"))
                })?;
                if endpoint.cannot_be_a_base() {
                    return Err(SyncError::InvalidChannelConfig(format!(
                        "url {raw:?} cannot carry a path"
                    )));
                }

                Ok(Arc::new(HttpTransport::new(
                    self.http.clone(),
                    endpoint,
                    self.credentials.clone(),
                )))
            }
            ChannelType::InProcess => {
                let store = self.in_process.clone().ok_or_else(|| {
                    SyncError::InvalidChannelConfig(
                        "no in-process peer store configured".to_owned(),
                    )
                })?;

                Ok(Arc::new(InProcessTransport::new(store)))
            }
        }
    }
}

/// One unit of sync work for a remote, plus what happens when the failure
/// budget runs out.
#[async_trait]
pub trait ChannelTick: Send + Sync {
    async fn tick(&self) -> Result<(), SyncError>;

    /// Consecutive failures hit the budget; polling is about to stop.
    async fn exhausted(&self);
}

/// Drives one remote's tick on a fixed interval. Ticks never overlap; a
/// tick that outlives its timeout counts as failed.
pub struct PollingChannel {
    name: String,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl PollingChannel {
    pub fn start(name: impl Into<String>, config: SyncConfig, tick: Arc<dyn ChannelTick>) -> Self {
        let name = name.into();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(poll_loop(
            name.clone(),
            config,
            tick,
            shutdown.clone(),
        ));

        Self {
            name,
            shutdown,
            handle,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _joined = self.handle.await;
    }
}

async fn poll_loop(
    name: String,
    config: SyncConfig,
    tick: Arc<dyn ChannelTick>,
    shutdown: CancellationToken,
) {
    let mut failures: u32 = 0;
    // First tick one full interval out, not immediately.
    let mut interval = tokio::time::interval_at(
        tokio::time::Instant::now() + config.poll_interval,
        config.poll_interval,
    );
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _instant = interval.tick() => {}
        }

        match tokio::time::timeout(config.tick_timeout, tick.tick()).await {
            Ok(Ok(())) => {
                failures = 0;
            }
            Ok(Err(err)) => {
                failures += 1;
                warn!(remote = %name, %err, failures, "Sync tick failed");
            }
            Err(_elapsed) => {
                failures += 1;
                warn!(remote = %name, failures, "Sync tick timed out");
            }
        }

        if failures >= config.max_failures {
            error!(remote = %name, failures, "Failure budget exhausted, polling stops");
            tick.exhausted().await;
            break;
        }

        if failures > 0 {
            let backoff = config.backoff(failures);
            debug!(remote = %name, ?backoff, "Backing off before next tick");

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(backoff) => {}
            }
        }
    }
}
