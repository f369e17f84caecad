//! [`Ioc`] – wires the registry, the status bridge, the command dispatcher
//! and the operator gateway into one process and tears them down together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use adr_bridge::{
    Backoff, CommandDispatcher, ControlChannel, DispatcherConfig, OperatorGateway, StartCyclePolicy,
    StatusBridge, StatusBridgeConfig, StatusConnector, ZmqControlChannel, ZmqSubscriber, tcp_endpoint,
    wait_for_shutdown,
};
use adr_registry::{DEFAULT_PREFIX, VariableRegistry};
use adr_types::AdrError;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How long stopped tasks get to finish before they are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to start an [`Ioc`].
#[derive(Debug, Clone, PartialEq)]
pub struct IocConfig {
    /// Host running the ADR controller.
    pub address: String,
    /// Status publisher port.
    pub sub_port: u16,
    /// Command endpoint port.
    pub control_port: u16,
    /// Prefix prepended to every variable name.
    pub prefix: String,
    pub read_timeout: Duration,
    pub max_silent_reads: u32,
    pub send_timeout: Duration,
    pub backoff: Backoff,
    pub start_cycle_policy: StartCyclePolicy,
    /// `None` disables the operator gateway.
    pub gateway_addr: Option<SocketAddr>,
}

impl Default for IocConfig {
    fn default() -> Self {
        let status = StatusBridgeConfig::default();
        let dispatch = DispatcherConfig::default();
        Self {
            address: "10.66.48.41".to_string(),
            sub_port: 5021,
            control_port: 5020,
            prefix: DEFAULT_PREFIX.to_string(),
            read_timeout: status.read_timeout,
            max_silent_reads: status.max_silent_reads,
            send_timeout: dispatch.send_timeout,
            backoff: Backoff::default(),
            start_cycle_policy: dispatch.start_cycle_policy,
            gateway_addr: Some(SocketAddr::from(([0, 0, 0, 0], 9090))),
        }
    }
}

impl IocConfig {
    pub fn status_endpoint(&self) -> String {
        tcp_endpoint(&self.address, self.sub_port)
    }

    pub fn control_endpoint(&self) -> String {
        tcp_endpoint(&self.address, self.control_port)
    }

    /// Reject settings that would leave the IOC running but useless.
    ///
    /// # Errors
    ///
    /// [`AdrError::Config`] for a zero read or send timeout.
    pub fn validate(&self) -> Result<(), AdrError> {
        if self.read_timeout.is_zero() {
            return Err(AdrError::Config("read timeout must be non-zero".to_string()));
        }
        if self.send_timeout.is_zero() {
            return Err(AdrError::Config("send timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// The running bridge between the ADR controller and its operators.
pub struct Ioc {
    config: IocConfig,
    registry: Arc<VariableRegistry>,
}

impl Ioc {
    pub fn new(config: IocConfig) -> Self {
        let registry = Arc::new(VariableRegistry::new(config.prefix.clone()));
        Self { config, registry }
    }

    pub fn config(&self) -> &IocConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<VariableRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run against the ZeroMQ endpoints from the config until `shutdown`.
    ///
    /// # Errors
    ///
    /// Startup failures only: an invalid config (see [`IocConfig::validate`]
    /// and [`CommandDispatcher::new`]) or a gateway address that cannot be
    /// bound.  Device-side faults are retried.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), AdrError> {
        let connector = ZmqSubscriber::new(self.config.status_endpoint());
        let channel = Arc::new(ZmqControlChannel::new(self.config.control_endpoint()));
        self.run_with(connector, channel, shutdown).await
    }

    /// [`Ioc::run`] over caller-supplied transports.
    pub async fn run_with<C>(
        &self,
        connector: C,
        channel: Arc<dyn ControlChannel>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), AdrError>
    where
        C: StatusConnector + 'static,
    {
        self.config.validate()?;
        let dispatcher = CommandDispatcher::new(
            channel,
            DispatcherConfig {
                send_timeout: self.config.send_timeout,
                start_cycle_policy: self.config.start_cycle_policy,
            },
        )?;
        let listener = match self.config.gateway_addr {
            Some(addr) => Some(bind_gateway(addr).await?),
            None => None,
        };

        let mut tasks = JoinSet::new();

        let writes = self.registry.subscribe_operator_writes();
        tasks.spawn(dispatcher.run(writes, shutdown.clone()));

        let bridge = StatusBridge::with_config(
            self.registry(),
            StatusBridgeConfig {
                read_timeout: self.config.read_timeout,
                max_silent_reads: self.config.max_silent_reads,
            },
        );
        let backoff = self.config.backoff.clone();
        let mut bridge_shutdown = shutdown.clone();
        tasks.spawn(async move {
            bridge
                .run_supervised(&connector, &backoff, &mut bridge_shutdown)
                .await;
        });

        if let Some(listener) = listener {
            let gateway = OperatorGateway::new(self.registry());
            tasks.spawn(gateway.serve(listener, shutdown.clone()));
        }

        info!(
            status = %self.config.status_endpoint(),
            control = %self.config.control_endpoint(),
            prefix = %self.config.prefix,
            gateway = ?self.config.gateway_addr,
            "ADR IOC running"
        );

        wait_for_shutdown(&mut shutdown).await;
        info!("shutting down");

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "IOC task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(grace_ms = SHUTDOWN_GRACE.as_millis() as u64, "tasks still running; aborting");
            tasks.abort_all();
        }
        debug!("IOC stopped");
        Ok(())
    }
}

async fn bind_gateway(addr: SocketAddr) -> Result<TcpListener, AdrError> {
    let listener = TcpListener::bind(addr).await.map_err(|e| AdrError::Transport {
        endpoint: addr.to_string(),
        details: format!("gateway bind error: {e}"),
    })?;
    info!(addr = %addr, "operator gateway listening");
    Ok(listener)
}
