use anyhow::{Context, Result};
use armfluent::arm::client::ArmClient;
use armfluent::arm::http::format_arm_error;
use armfluent::arm::service::{ArmResourceService, ResourceService};
use armfluent::config::Config;
use armfluent::plan::Plan;
use armfluent::resource::{get_all_kind_keys, get_kind, StagedResource};
use armfluent::FluentError;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Apply staged edits to Azure resources
#[derive(Parser, Debug)]
#[command(name = "armfluent", version = armfluent::VERSION, about, long_about = None)]
struct Args {
    /// YAML plan describing the resource and the edits to stage
    #[arg(short, long)]
    plan: Option<PathBuf>,

    /// Subscription to use
    #[arg(short, long)]
    subscription: Option<String>,

    /// Resource group (overrides the plan)
    #[arg(short, long)]
    resource_group: Option<String>,

    /// Management endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Print the reconciled representation without writing it
    #[arg(long)]
    dry_run: bool,

    /// Remember the subscription in the config file
    #[arg(long)]
    save_subscription: bool,

    /// List registered resource kinds and exit
    #[arg(long)]
    list_kinds: bool,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off")]
    log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(level: LogLevel) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let tracing_level = level.to_tracing_level()?;

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Logging disabled, cannot open {:?}: {}", log_path, e);
            return None;
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_max_level(tracing_level)
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("armfluent started with log level: {:?}", level);
    tracing::info!("Log file: {:?}", log_path);

    Some(guard)
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = Config::config_dir() {
        return config_dir.join("armfluent.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".armfluent").join("armfluent.log");
    }
    PathBuf::from("armfluent.log")
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level);

    if let Err(err) = run(args).await {
        eprintln!("Error: {}", describe_error(&err));
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    if args.list_kinds {
        let mut keys = get_all_kind_keys();
        keys.sort_unstable();
        for key in keys {
            if let Some(kind) = get_kind(key) {
                println!("{:<32} {}", key, kind.display_name);
            }
        }
        return Ok(());
    }

    let plan_path = args
        .plan
        .as_deref()
        .context("No plan given. Use --plan <file>")?;
    let plan = Plan::load(plan_path)?;

    let mut config = Config::load();
    let subscription = config
        .effective_subscription(args.subscription.as_deref())
        .context("No subscription configured. Set AZURE_SUBSCRIPTION_ID or use --subscription")?;
    let resource_group = config
        .effective_resource_group(args.resource_group.as_deref().or(plan.resource_group.as_deref()))
        .context("No resource group given. Name one in the plan or use --resource-group")?;
    let token = config
        .effective_token()
        .with_context(|| format!("No access token. Set {}", config.token_env()))?;
    let endpoint = config.effective_endpoint(args.endpoint.as_deref());

    tracing::info!(
        "Using subscription: {}, resource group: {}, endpoint: {}",
        subscription,
        resource_group,
        endpoint
    );

    let kind = get_kind(&plan.kind)
        .ok_or_else(|| FluentError::UnknownResourceKind(plan.kind.clone()))?;
    let client = ArmClient::new(&endpoint, &subscription, &token)?;
    let service: Arc<dyn ResourceService> = Arc::new(ArmResourceService::for_kind(client, kind));

    let resource = if plan.create {
        StagedResource::define(&plan.kind, service, &resource_group, &plan.name)?
    } else {
        StagedResource::load(&plan.kind, service, &resource_group, &plan.name).await?
    };
    let mut resource = resource.with_subscription(&subscription);

    let staged = plan.apply(&mut resource)?;
    tracing::info!("Staged {} operations on {}", staged, plan.name);

    if args.dry_run {
        let (preview, report) = resource.preview();
        println!("{}", serde_json::to_string_pretty(&preview)?);
        eprintln!(
            "dry run: {} added, {} removed, {} updated, {} dangling references cleared",
            report.added, report.removed, report.updated, report.cleared_references
        );
    } else {
        let written = resource.commit().await?.clone();
        println!("{}", serde_json::to_string_pretty(&written)?);
        if let Some(outcome) = resource.last_commit() {
            eprintln!(
                "committed at {}: {} added, {} removed, {} updated, {} dependencies created",
                outcome.committed_at.to_rfc3339(),
                outcome.report.added,
                outcome.report.removed,
                outcome.report.updated,
                outcome.dependencies_created
            );
        }
    }

    if args.save_subscription {
        config.set_subscription(&subscription)?;
    }

    Ok(())
}

/// Render remote failures with the ARM error body, everything else with its
/// context chain.
fn describe_error(err: &anyhow::Error) -> String {
    match err.downcast_ref::<FluentError>() {
        Some(FluentError::RemoteOperation { operation, source }) => {
            format!("{} failed: {}", operation, format_arm_error(source))
        }
        Some(FluentError::DependencyExecution { key, source }) => {
            format!("dependency {} failed: {}", key, format_arm_error(source))
        }
        _ => format!("{:#}", err),
    }
}
