use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use code_exec::backend::{
    BackendRegistry, ContainerBackend, ContainerConfig, ExecutionBackend, SubprocessBackend,
};
use code_exec::queue::{AckMode, MemoryQueue, QueueClient, RedisQueue};
use code_exec::store::{MemoryResultStore, RedisResultStore, ResultStore};
use code_exec::{
    ConnectionRegistry, ExecutionService, IngestionGateway, Language, Notifier, Orchestrator,
    OrchestratorConfig, ResourceLimits, SlidingWindowLimiter, WorkerConfig,
};
use code_exec_server::{create_app, run_server, serve_rpc, AppState};
use job_client::{ClusterConfig, JobClient, JobResources, ResourceQuantities};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/websocket/RPC front end and the result notifier
    Serve {
        #[command(flatten)]
        broker: BrokerArgs,
        #[command(flatten)]
        gateway: GatewayArgs,
    },
    /// Run execution workers consuming the intake queue
    Execute {
        #[command(flatten)]
        broker: BrokerArgs,
        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Run everything in one process on an in-memory queue and store
    Standalone {
        #[command(flatten)]
        queues: QueueArgs,
        #[command(flatten)]
        gateway: GatewayArgs,
        #[command(flatten)]
        worker: WorkerArgs,
    },
}

#[derive(Args, Debug)]
struct BrokerArgs {
    /// Redis connection URL used for queues and the result store
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Consumer name, unique per instance and stable across its restarts for
    /// redelivery. Defaults to $HOSTNAME, else a random id.
    #[arg(long, env = "CONSUMER_ID")]
    consumer_id: Option<String>,

    #[command(flatten)]
    queues: QueueArgs,
}

#[derive(Args, Debug)]
struct QueueArgs {
    /// Queue new submissions are published to
    #[arg(long, env = "INTAKE_QUEUE", default_value = "submissions")]
    intake_queue: String,

    /// Queue finished results are published to
    #[arg(long, env = "RESULT_QUEUE", default_value = "executions")]
    result_queue: String,

    /// How long results stay retrievable, in seconds
    #[arg(long, env = "RESULT_TTL_SECS", default_value = "3600")]
    result_ttl_secs: u64,
}

#[derive(Args, Debug)]
struct GatewayArgs {
    /// HTTP address to listen on
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:3000")]
    http_addr: SocketAddr,

    /// Address for the JSON-RPC submit listener
    #[arg(long, env = "RPC_ADDR")]
    rpc_addr: Option<SocketAddr>,

    /// Submissions admitted per window
    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS", default_value = "100")]
    rate_limit_max_requests: usize,

    /// Rate limit window in seconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value = "60")]
    rate_limit_window_secs: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Subprocess,
    Container,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Wall-clock limit per execution in seconds
    #[arg(long, env = "EXECUTION_TIMEOUT_SECS", default_value = "30")]
    execution_timeout_secs: u64,

    /// Submissions executed at the same time
    #[arg(long, env = "WORKER_CONCURRENCY", default_value = "1")]
    worker_concurrency: usize,

    /// on-receive or after-processing
    #[arg(long, env = "ACK_MODE", default_value = "on-receive")]
    ack_mode: AckMode,

    #[arg(long, env = "EXECUTION_BACKEND", value_enum, default_value_t = BackendKind::Subprocess)]
    backend: BackendKind,

    /// CPU time limit in seconds for subprocess executions
    #[arg(long, default_value = "30")]
    cpu_time_limit: u32,

    /// File size limit in bytes for subprocess executions
    #[arg(long, default_value = "10485760")] // 10MB
    file_size_limit: u64,

    #[command(flatten)]
    cluster: ClusterArgs,
}

#[derive(Args, Debug)]
struct ClusterArgs {
    /// Kubernetes API server URL; in-cluster configuration is used when absent
    #[arg(long, env = "KUBE_API_URL")]
    kube_api_url: Option<String>,

    #[arg(long, env = "KUBE_NAMESPACE")]
    kube_namespace: Option<String>,

    #[arg(long, env = "KUBE_TOKEN", hide_env_values = true)]
    kube_token: Option<String>,

    /// PEM bundle used to verify the API server
    #[arg(long, env = "KUBE_CA_CERT")]
    kube_ca_cert: Option<PathBuf>,

    /// Image override per language, e.g. python=python:3.11-slim
    #[arg(long = "job-image", env = "JOB_IMAGES", value_delimiter = ',', value_parser = parse_image)]
    job_images: Vec<(Language, String)>,

    #[arg(long, env = "JOB_CPU_LIMIT", default_value = "500m")]
    job_cpu_limit: String,

    #[arg(long, env = "JOB_MEMORY_LIMIT", default_value = "256Mi")]
    job_memory_limit: String,

    /// Job status poll interval in milliseconds
    #[arg(long, default_value = "2000")]
    job_poll_interval_ms: u64,
}

impl BrokerArgs {
    fn consumer_id(&self) -> String {
        let id = self.consumer_id.clone().unwrap_or_else(|| {
            RedisQueue::instance_consumer_id(std::env::var("HOSTNAME").ok().as_deref())
        });
        info!("Consumer id: {}", id);
        id
    }
}

fn parse_image(value: &str) -> Result<(Language, String), String> {
    let (language, image) = value
        .split_once('=')
        .ok_or_else(|| format!("expected <language>=<image>, got {}", value))?;
    Ok((language.trim().parse()?, image.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let (stop, stopped) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => {
                warn!("Failed to listen for the shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        }
        let _ = stop.send(true);
    });

    match cli.command {
        Command::Serve { broker, gateway } => serve(broker, gateway, stopped).await,
        Command::Execute { broker, worker } => execute(broker, worker, stopped).await,
        Command::Standalone {
            queues,
            gateway,
            worker,
        } => standalone(queues, gateway, worker, stopped).await,
    }
}

fn shutdown_signal(mut stopped: watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let _ = stopped.wait_for(|stop| *stop).await;
    }
}

async fn serve(
    broker: BrokerArgs,
    gateway: GatewayArgs,
    stopped: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let queue: Arc<dyn QueueClient> = Arc::new(
        RedisQueue::connect(&broker.redis_url, broker.consumer_id())
            .await
            .context("Failed to connect to the queue")?,
    );
    let store: Arc<dyn ResultStore> = Arc::new(
        RedisResultStore::connect(&broker.redis_url)
            .await
            .context("Failed to connect to the result store")?,
    );

    run_front_end(gateway, &broker.queues, queue, store, stopped).await
}

async fn execute(
    broker: BrokerArgs,
    worker: WorkerArgs,
    stopped: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let queue: Arc<dyn QueueClient> = Arc::new(
        RedisQueue::connect(&broker.redis_url, broker.consumer_id())
            .await
            .context("Failed to connect to the queue")?,
    );
    let store: Arc<dyn ResultStore> = Arc::new(
        RedisResultStore::connect(&broker.redis_url)
            .await
            .context("Failed to connect to the result store")?,
    );

    let service = execution_service(&worker, &broker.queues, queue, store)?;
    service.run(shutdown_signal(stopped)).await?;
    Ok(())
}

async fn standalone(
    queues: QueueArgs,
    gateway: GatewayArgs,
    worker: WorkerArgs,
    stopped: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let queue: Arc<dyn QueueClient> = Arc::new(MemoryQueue::new());
    let store: Arc<dyn ResultStore> = Arc::new(MemoryResultStore::new());

    let service = execution_service(&worker, &queues, queue.clone(), store.clone())?;
    let workers = tokio::spawn({
        let stopped = shutdown_signal(stopped.clone());
        async move { service.run(stopped).await }
    });

    run_front_end(gateway, &queues, queue, store, stopped).await?;
    workers.await??;
    Ok(())
}

/// Gateway, result routes, websocket registry, notifier and optional RPC
async fn run_front_end(
    args: GatewayArgs,
    queues: &QueueArgs,
    queue: Arc<dyn QueueClient>,
    store: Arc<dyn ResultStore>,
    stopped: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let limiter = Arc::new(SlidingWindowLimiter::new(
        args.rate_limit_max_requests,
        Duration::from_secs(args.rate_limit_window_secs),
    ));
    let gateway = Arc::new(IngestionGateway::new(
        limiter,
        queue.clone(),
        queues.intake_queue.clone(),
    ));
    let registry = Arc::new(ConnectionRegistry::new());

    let results = queue
        .consume(&queues.result_queue, AckMode::OnReceive)
        .await
        .context("Failed to subscribe to the result queue")?;
    let notifier = Notifier::new(registry.clone());
    let notifications = tokio::spawn({
        let stopped = shutdown_signal(stopped.clone());
        async move { notifier.run(results, stopped).await }
    });

    let rpc = match args.rpc_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind RPC listener on {}", addr))?;
            Some(tokio::spawn(serve_rpc(
                listener,
                gateway.clone(),
                shutdown_signal(stopped.clone()),
            )))
        }
        None => None,
    };

    let app = create_app(AppState {
        gateway,
        store,
        registry,
    });
    run_server(app, args.http_addr, shutdown_signal(stopped)).await?;

    notifications.await?;
    if let Some(rpc) = rpc {
        rpc.await?;
    }
    Ok(())
}

fn execution_service(
    args: &WorkerArgs,
    queues: &QueueArgs,
    queue: Arc<dyn QueueClient>,
    store: Arc<dyn ResultStore>,
) -> anyhow::Result<ExecutionService> {
    let backend = build_backend(args)?;
    info!("Using {} backend", backend.name());

    let orchestrator = Orchestrator::new(
        BackendRegistry::uniform(backend),
        store,
        queue.clone(),
        OrchestratorConfig::default()
            .with_timeout(Duration::from_secs(args.execution_timeout_secs))
            .with_result_ttl(Duration::from_secs(queues.result_ttl_secs))
            .with_result_queue(queues.result_queue.clone()),
    );

    let config = WorkerConfig::default()
        .with_queue(queues.intake_queue.clone())
        .with_concurrency(args.worker_concurrency)
        .with_ack_mode(args.ack_mode);

    Ok(ExecutionService::new(Arc::new(orchestrator), queue, config))
}

fn build_backend(args: &WorkerArgs) -> anyhow::Result<Arc<dyn ExecutionBackend>> {
    match args.backend {
        BackendKind::Subprocess => Ok(Arc::new(SubprocessBackend::new(ResourceLimits {
            cpu_time: args.cpu_time_limit,
            file_size: args.file_size_limit,
        }))),
        BackendKind::Container => {
            let cluster = &args.cluster;
            let mut config = match &cluster.kube_api_url {
                Some(url) => ClusterConfig::new(
                    url.clone(),
                    cluster.kube_namespace.clone().unwrap_or_else(|| "default".to_string()),
                ),
                None => ClusterConfig::in_cluster(cluster.kube_namespace.clone())
                    .context("Failed to load in-cluster Kubernetes configuration")?,
            };
            if let Some(token) = &cluster.kube_token {
                config = config.with_token(token.clone());
            }
            if let Some(path) = &cluster.kube_ca_cert {
                let pem = std::fs::read(path)
                    .with_context(|| format!("Failed to read CA certificate {}", path.display()))?;
                config = config.with_ca_cert(pem);
            }

            let client = JobClient::new(config).context("Failed to create Kubernetes client")?;

            let resources = JobResources {
                limits: ResourceQuantities::new(
                    cluster.job_cpu_limit.clone(),
                    cluster.job_memory_limit.clone(),
                ),
                ..JobResources::default()
            };
            let mut container = ContainerConfig::default()
                .with_resources(resources)
                .with_poll_interval(Duration::from_millis(cluster.job_poll_interval_ms));
            for (language, image) in &cluster.job_images {
                container = container.with_image(*language, image.clone());
            }

            Ok(Arc::new(ContainerBackend::new(Arc::new(client), container)))
        }
    }
}
