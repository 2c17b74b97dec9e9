use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use futures::StreamExt;
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

use lychee::capability::CapabilityRegistry;
use lychee::config::{create_sample_config, load_config, Settings};
use lychee::manifest::{load_manifest, Manifest, DEFAULT_MANIFEST};
use lychee::{
    ChangeWatcher, DefaultSchemaPipeline, EventKind, Orchestrator, ServiceOutcome, StartReport,
};

/// Wait for shutdown signal (CTRL+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}

/// Flags of the `dev` flow, also accepted without a subcommand
fn dev_args() -> [Arg; 3] {
    [
        Arg::new("services")
            .short('s')
            .long("services")
            .value_name("NAMES")
            .help("Comma-separated services to start (dependencies included)")
            .value_delimiter(','),
        Arg::new("no-watch")
            .long("no-watch")
            .help("Disable hot reload")
            .action(ArgAction::SetTrue),
        Arg::new("install")
            .long("install")
            .help("Install dependencies before starting each service")
            .action(ArgAction::SetTrue),
    ]
}

fn cli() -> Command {
    Command::new("lychee")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Lychee - run a project's services in dependency order with hot reload")
        .arg(
            Arg::new("manifest")
                .short('m')
                .long("manifest")
                .value_name("FILE")
                .help("Project manifest")
                .default_value(DEFAULT_MANIFEST)
                .global(true),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Settings file path")
                .default_value("lychee-settings.toml")
                .global(true),
        )
        .arg(
            Arg::new("grace-period-ms")
                .long("grace-period-ms")
                .value_name("MS")
                .help("Time a service gets to exit after SIGTERM")
                .global(true),
        )
        .arg(
            Arg::new("debounce-ms")
                .long("debounce-ms")
                .value_name("MS")
                .help("Quiet period before a change triggers a reload")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (error, warn, info, debug, trace)")
                .global(true),
        )
        .arg(
            Arg::new("sample-config")
                .long("sample-config")
                .value_name("FILE")
                .help("Write default settings to FILE and exit"),
        )
        .args(dev_args())
        .subcommand(
            Command::new("dev")
                .about("Start services, watch for changes and reload (default)")
                .args(dev_args()),
        )
        .subcommand(
            Command::new("install")
                .about("Install dependencies for services")
                .arg(
                    Arg::new("services")
                        .short('s')
                        .long("services")
                        .value_name("NAMES")
                        .help("Comma-separated services to install (default: all)")
                        .value_delimiter(','),
                ),
        )
        .subcommand(
            Command::new("schema")
                .about("Manage shared schemas")
                .subcommand_required(true)
                .subcommand(Command::new("generate").about("Compile every schema and refresh service mounts"))
                .subcommand(Command::new("list").about("List available schemas")),
        )
        .subcommand(
            Command::new("plugins")
                .about("Inspect runtime and schema compiler bindings")
                .subcommand_required(true)
                .subcommand(Command::new("list").about("List resolvable runtimes and compilers")),
        )
}

/// Innermost subcommand matches; global flags are visible there too
fn leaf_matches(matches: &ArgMatches) -> &ArgMatches {
    let mut current = matches;
    while let Some((_, sub)) = current.subcommand() {
        current = sub;
    }
    current
}

fn selected_services(matches: &ArgMatches) -> Option<Vec<String>> {
    matches
        .get_many::<String>("services")
        .map(|values| values.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
}

fn print_report(report: &StartReport) {
    for (service, outcome) in &report.outcomes {
        match outcome {
            ServiceOutcome::Running => println!("  {service:<20} running"),
            ServiceOutcome::Failed { reason } => println!("  {service:<20} failed: {reason}"),
            ServiceOutcome::NotStarted { state } => println!("  {service:<20} not started ({state})"),
        }
    }
}

/// Log state transitions and schema results; log lines are already logged by the supervisor
fn spawn_event_logger(orchestrator: &Orchestrator) {
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => match event.kind {
                    EventKind::StateChanged {
                        service,
                        to,
                        failure: Some(reason),
                        ..
                    } => warn!("[{service}] {to}: {reason}"),
                    EventKind::SchemaRegenerated {
                        resource,
                        error: None,
                    } => info!("Schema '{resource}' regenerated"),
                    EventKind::SchemaRegenerated {
                        resource,
                        error: Some(e),
                    } => error!("Schema '{resource}' failed to regenerate: {e}"),
                    _ => {}
                },
                Err(e) => warn!("Event stream lagged: {e}"),
            }
        }
    });
}

async fn run_dev(
    manifest: &Manifest,
    registry: Arc<CapabilityRegistry>,
    pipeline: Arc<DefaultSchemaPipeline>,
    settings: &Settings,
    matches: &ArgMatches,
) -> Result<()> {
    match pipeline.regenerate_all().await {
        Ok(resources) if !resources.is_empty() => info!("Generated schemas: {}", resources.join(", ")),
        Ok(_) => {}
        Err(e) => warn!("Schema generation failed: {e:#}"),
    }

    let orchestrator = Orchestrator::spawn(
        Arc::clone(&manifest.project),
        registry,
        pipeline,
        settings.clone(),
    )
    .context("Failed to start orchestrator")?;
    spawn_event_logger(&orchestrator);

    let report = match selected_services(matches) {
        Some(services) => orchestrator.start(services).await?,
        None => orchestrator.start_all().await?,
    };
    println!("Services:");
    print_report(&report);

    let watcher = if matches.get_flag("no-watch") {
        None
    } else {
        Some(ChangeWatcher::spawn(
            &manifest.project,
            settings.debounce(),
            orchestrator.change_sender(),
        )?)
    };

    info!("Lychee is running. Press Ctrl+C to shutdown.");
    shutdown_signal().await;

    if let Err(e) = orchestrator.shutdown().await {
        error!("Failed to shut down cleanly: {e}");
    }
    if let Some(watcher) = watcher {
        watcher.stop().await;
    }

    info!("Lychee shutdown complete");
    Ok(())
}

async fn run_install(manifest: &Manifest, registry: &CapabilityRegistry, matches: &ArgMatches) -> Result<()> {
    let project = &manifest.project;
    let specs = match selected_services(matches) {
        Some(names) => names
            .iter()
            .map(|name| {
                project
                    .get(name)
                    .with_context(|| format!("Unknown service: {name}"))
            })
            .collect::<Result<Vec<_>>>()?,
        None => project.services().collect(),
    };

    for spec in specs {
        let runtime = registry.resolve(&spec.kind)?;
        info!("Installing dependencies for '{}' ({})", spec.name, spec.kind);
        runtime
            .install(spec)
            .await
            .with_context(|| format!("Failed to install dependencies for '{}'", spec.name))?;
    }

    println!("All dependencies installed");
    Ok(())
}

async fn run_schema(pipeline: &DefaultSchemaPipeline, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("generate", _)) => {
            let resources = pipeline.regenerate_all().await?;
            println!("Generated {} schema(s)", resources.len());
            for resource in resources {
                println!("  {resource}");
            }
        }
        Some(("list", _)) => {
            for resource in pipeline.resources().await? {
                println!("{}", pipeline.schema_path(&resource).display());
            }
        }
        Some((other, _)) => bail!("Unknown schema command: {other}"),
        None => bail!("Missing schema command"),
    }
    Ok(())
}

fn run_plugins_list(registry: &CapabilityRegistry) {
    println!("Runtimes:");
    for kind in registry.kinds() {
        println!("  {kind}");
    }
    println!("Schema compilers:");
    for name in registry.compiler_names() {
        println!("  {name}");
    }
    for missing in registry.missing_bindings() {
        warn!("Configured binding '{missing}' was not found");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    if let Some(path) = matches.get_one::<String>("sample-config") {
        return create_sample_config(path);
    }

    let args = leaf_matches(&matches);
    let config_path = args.get_one::<String>("config");
    let settings = load_config(config_path.map(|s| s.as_str()), args)?;

    let level = settings.log_level.clone().unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    info!("Loaded settings: {settings:?}");

    let manifest_path = args
        .get_one::<String>("manifest")
        .map(String::as_str)
        .unwrap_or(DEFAULT_MANIFEST);
    let manifest = load_manifest(Path::new(manifest_path), &settings)?;

    let registry = Arc::new(CapabilityRegistry::new(&manifest.catalog(), &manifest.capabilities));
    let pipeline = Arc::new(DefaultSchemaPipeline::new(
        Arc::clone(&manifest.project),
        Arc::clone(&registry),
    ));

    match matches.subcommand() {
        None => run_dev(&manifest, registry, pipeline, &settings, &matches).await,
        Some(("dev", sub)) => run_dev(&manifest, registry, pipeline, &settings, sub).await,
        Some(("install", sub)) => run_install(&manifest, &registry, sub).await,
        Some(("schema", sub)) => run_schema(&pipeline, sub).await,
        Some(("plugins", _)) => {
            run_plugins_list(&registry);
            Ok(())
        }
        Some((other, _)) => bail!("Unknown command: {other}"),
    }
}
