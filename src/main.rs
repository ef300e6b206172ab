//! Binary entry point for the Machina CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::error;
use tracing_subscriber::EnvFilter;

use machina::config::{ConfigError, MachinaConfig};
use machina::ec2::{Ec2Error, Ec2Provider};
use machina::exec::{HostOutcome, RemoteEndpoint, RemoteExecutor};
use machina::launch::LaunchOverrides;
use machina::lifecycle::{self, LifecycleError};
use machina::profile::{ProfileError, ProfileStore};
use machina::registry::{InstanceRegistry, RegistryError};
use machina::shell::ProcessShell;
use machina::store::StoreError;

mod cli;
use cli::{Cli, CliCommand, CreateCommand, ExecAction, ExecCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError<Ec2Error>),
    #[error("image registration failed: {0}")]
    Provider(#[from] Ec2Error),
    #[error("no region selected: pass --region or set MACHINA_REGION")]
    MissingRegion,
    #[error("no target hosts: pass --host or --machine")]
    NoTargets,
    #[error("machine {name} has no reachable host")]
    MachineUnreachable { name: String },
    #[error("{failed} of {total} hosts reported errors")]
    RemoteFailures { failed: usize, total: usize },
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let Cli { region: region_flag, command } = cli;

    let config = MachinaConfig::load_without_cli_args()?;
    config.validate()?;
    let region = region_flag.or_else(|| config.region.clone());

    let registry_path = config.registry_document_path();
    let mut registry = InstanceRegistry::load(&registry_path)?;

    match command {
        CliCommand::Create(create) => {
            let region_name = region.ok_or(CliError::MissingRegion)?;
            let profiles = ProfileStore::load(&config.profile_document_path())?;
            let profile = profiles.lookup(&region_name, &create.profile)?.clone();
            let provider = Arc::new(Ec2Provider::from_env(Some(region_name)).await);
            let overrides = launch_overrides(&create);

            let outcome = lifecycle::create_instances(
                &provider,
                &mut registry,
                &profile,
                &overrides,
                &create.name,
            )
            .await;
            persist_registry(&registry, &registry_path);
            outcome?;
            Ok(())
        }
        CliCommand::Adopt(adopt) => {
            let outcome =
                lifecycle::adopt_generic_host(&mut registry, &adopt.name, &adopt.host, adopt.alt_names);
            persist_registry(&registry, &registry_path);
            outcome?;
            Ok(())
        }
        CliCommand::Start(start) => {
            let provider = Arc::new(Ec2Provider::from_env(region).await);
            let outcome = lifecycle::start_instances(&provider, &mut registry, &start.names).await;
            persist_registry(&registry, &registry_path);
            outcome?;
            Ok(())
        }
        CliCommand::Stop(stop) => {
            let provider = Arc::new(Ec2Provider::from_env(region).await);
            let outcome = lifecycle::stop_instances(&provider, &mut registry, &stop.names).await;
            persist_registry(&registry, &registry_path);
            outcome?;
            Ok(())
        }
        CliCommand::Rm(rm) => {
            let provider = Arc::new(Ec2Provider::from_env(region).await);
            let outcome = lifecycle::remove_instances(&provider, &mut registry, &rm.names).await;
            persist_registry(&registry, &registry_path);
            outcome?;
            Ok(())
        }
        CliCommand::Reboot(reboot) => {
            let provider = Arc::new(Ec2Provider::from_env(region).await);
            lifecycle::reboot_instances(&provider, &registry, &reboot.names).await?;
            Ok(())
        }
        CliCommand::RegisterImage(image) => {
            let provider = Arc::new(Ec2Provider::from_env(region).await);
            let image_id =
                lifecycle::register_image(&provider, &image.instance_id, &image.name, &image.desc)
                    .await?;
            writeln!(io::stdout(), "{image_id}").ok();
            Ok(())
        }
        CliCommand::Exec(exec) => run_exec(&config, &registry, exec).await,
    }
}

/// Persists the registry, logging rather than masking any failure so the
/// operation's own outcome stays authoritative.
fn persist_registry(registry: &InstanceRegistry, path: &Utf8Path) {
    if let Err(err) = registry.dump(path) {
        error!(error = %err, path = %path, "failed to persist instance registry");
    }
}

fn launch_overrides(create: &CreateCommand) -> LaunchOverrides {
    LaunchOverrides {
        image_id: create.image_id.clone(),
        key_name: create.key_name.clone(),
        instance_type: create.instance_type.clone(),
        count: create.count,
        iam_role: create.iam_role.clone(),
        root_size_gib: create.root_size,
        volume_sizes_gib: create.volume_sizes.clone(),
        subnet_id: create.subnet_id.clone(),
        private_subnet: create.subnet_private,
        security_groups: create.groups.clone(),
        tags: create.tags.clone(),
    }
}

async fn run_exec(
    config: &MachinaConfig,
    registry: &InstanceRegistry,
    exec: ExecCommand,
) -> Result<(), CliError> {
    let mut endpoints: Vec<RemoteEndpoint> = exec
        .hosts
        .iter()
        .map(|host| config.endpoint_for(host))
        .collect();
    for name in &exec.machines {
        let host = registry
            .get(name)
            .and_then(|instance| instance.host.clone())
            .ok_or_else(|| CliError::MachineUnreachable { name: name.clone() })?;
        endpoints.push(config.endpoint_for(&host));
    }
    if endpoints.is_empty() {
        return Err(CliError::NoTargets);
    }

    let executor = RemoteExecutor::new(Arc::new(ProcessShell::new()));
    let outcomes = match exec.action {
        ExecAction::Run { command } => {
            let rendered = render_remote_command(&command);
            executor.run_command(&endpoints, &rendered).await
        }
        ExecAction::Script { scripts } => {
            let paths: Vec<Utf8PathBuf> = scripts.into_iter().map(Utf8PathBuf::from).collect();
            executor.run_scripts(&endpoints, &paths, exec.sudo).await
        }
    };
    report_outcomes(&outcomes)
}

fn report_outcomes(outcomes: &[HostOutcome]) -> Result<(), CliError> {
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let mut failed = 0usize;
    for outcome in outcomes {
        match outcome.result {
            Ok(ref output) => {
                writeln!(stdout, "{} - {}", outcome.host, output.trim_end()).ok();
            }
            Err(ref err) => {
                failed += 1;
                writeln!(stderr, "{} - {}", outcome.host, err).ok();
            }
        }
    }
    if failed > 0 {
        return Err(CliError::RemoteFailures {
            failed,
            total: outcomes.len(),
        });
    }
    Ok(())
}

fn render_remote_command(args: &[String]) -> String {
    let escaped: Vec<String> = args
        .iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect();
    escaped.join(" ")
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
