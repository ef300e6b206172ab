//! Command-line interface definitions for the `machina` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page. It
//! deliberately depends on nothing but clap: the build script compiles it
//! standalone.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `machina` binary.
#[derive(Debug, Parser)]
#[command(
    name = "machina",
    about = "Provision and operate container-engine hosts on EC2 and over SSH",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Provider region; falls back to the configured default.
    #[arg(long, global = true, value_name = "REGION")]
    pub(crate) region: Option<String>,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

/// Subcommands exposed by the binary.
#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Launch instances from a synced profile and track them by name.
    Create(CreateCommand),
    /// Adopt an SSH-reachable host into the registry.
    Adopt(AdoptCommand),
    /// Start stopped instances and wait for them to become reachable.
    Start(NamesCommand),
    /// Stop running instances.
    Stop(NamesCommand),
    /// Remove and terminate instances.
    Rm(NamesCommand),
    /// Reboot instances without a stop/start cycle.
    Reboot(NamesCommand),
    /// Register a machine image from an existing instance.
    RegisterImage(RegisterImageCommand),
    /// Invoke a command or scripts on remote hosts over SSH.
    Exec(ExecCommand),
}

/// Arguments for the `create` subcommand.
#[derive(Args, Debug)]
pub(crate) struct CreateCommand {
    /// Registry name for the new machine; batches append `-1`..`-N`.
    pub(crate) name: String,
    /// Profile to launch from, within the selected region.
    #[arg(long, default_value = "default")]
    pub(crate) profile: String,
    /// Explicit machine image id; defaults to the profile's first AMI.
    #[arg(long = "ami-id", value_name = "AMI")]
    pub(crate) image_id: Option<String>,
    /// Explicit SSH key pair; defaults to the profile's first key pair.
    #[arg(long = "ssh-key", value_name = "KEY")]
    pub(crate) key_name: Option<String>,
    /// Instance type to request.
    #[arg(long = "type", default_value = "t2.micro", value_name = "TYPE")]
    pub(crate) instance_type: String,
    /// Number of instances to launch in this request.
    #[arg(long, default_value_t = 1)]
    pub(crate) count: i32,
    /// IAM role to attach, as an ARN or a bare name.
    #[arg(long = "iam-role", default_value = "", value_name = "ROLE")]
    pub(crate) iam_role: String,
    /// Root volume size in GiB; zero omits the root mapping.
    #[arg(long = "root-size", default_value_t = 16, value_name = "GIB")]
    pub(crate) root_size: i32,
    /// Extra volume sizes in GiB; repeat for multiple volumes.
    #[arg(long = "volume-size", value_name = "GIB")]
    pub(crate) volume_sizes: Vec<i32>,
    /// Launch into a specific subnet instead of selecting one.
    #[arg(long = "subnet-id", value_name = "SUBNET")]
    pub(crate) subnet_id: Option<String>,
    /// Select among the profile's private subnets.
    #[arg(long = "subnet-private")]
    pub(crate) subnet_private: bool,
    /// Security group names resolved against the profile; repeatable.
    #[arg(long = "group", value_name = "NAME")]
    pub(crate) groups: Vec<String>,
    /// Instance tag in the form key=value; repeatable.
    #[arg(long = "tag", value_name = "KEY=VALUE")]
    pub(crate) tags: Vec<String>,
}

/// Arguments for the `adopt` subcommand.
#[derive(Args, Debug)]
pub(crate) struct AdoptCommand {
    /// Registry name for the adopted host.
    pub(crate) name: String,
    /// Address of the host to adopt.
    #[arg(long)]
    pub(crate) host: String,
    /// Alternative names for the host; repeatable.
    #[arg(long = "altname", value_name = "NAME")]
    pub(crate) alt_names: Vec<String>,
}

/// Name list shared by the power-state subcommands.
#[derive(Args, Debug)]
pub(crate) struct NamesCommand {
    /// Registry names to operate on.
    #[arg(required = true)]
    pub(crate) names: Vec<String>,
}

/// Arguments for the `register-image` subcommand.
#[derive(Args, Debug)]
pub(crate) struct RegisterImageCommand {
    /// Instance to image.
    #[arg(long = "instance-id", value_name = "ID")]
    pub(crate) instance_id: String,
    /// Image name.
    #[arg(long)]
    pub(crate) name: String,
    /// Image description.
    #[arg(long, default_value = "")]
    pub(crate) desc: String,
}

/// Arguments for the `exec` subcommand.
#[derive(Args, Debug)]
pub(crate) struct ExecCommand {
    /// Remote host to target; repeatable.
    #[arg(long = "host", value_name = "HOST")]
    pub(crate) hosts: Vec<String>,
    /// Registry name whose host should be targeted; repeatable.
    #[arg(long = "machine", value_name = "NAME")]
    pub(crate) machines: Vec<String>,
    /// Run scripts through sudo.
    #[arg(long)]
    pub(crate) sudo: bool,
    /// What to execute on the targets.
    #[command(subcommand)]
    pub(crate) action: ExecAction,
}

/// Execution modes for `exec`.
#[derive(Debug, Subcommand)]
pub(crate) enum ExecAction {
    /// Invoke a single command on every target.
    Run {
        /// Command to execute (use -- to separate flags).
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Copy each script to every target and run them in order.
    Script {
        /// Local script paths, executed in the given order.
        #[arg(required = true)]
        scripts: Vec<String>,
    },
}
