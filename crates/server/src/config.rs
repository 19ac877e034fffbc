//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::coordinator::CoordinatorConfig;
use crate::formatter::FormatOptions;
use crate::tailer::TailerConfig;

/// With no subcommand the bridge starts, taking the `start` flags directly.
#[derive(Debug, Parser)]
#[command(
    name = "codexcord",
    version,
    about = "Mirror Codex sessions into Discord threads",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    /// Data directory for the database, lock and logs
    #[arg(long, global = true, env = "CODEXCORD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub start: StartArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the bridge until interrupted
    Start(StartArgs),
    /// Show lock owner, database and mapping counts
    Status,
    /// List mapped projects
    Projects,
    /// Drop one project mapping with its threads and messages
    ForgetProject {
        /// Project directory, any spelling
        path: String,
    },
}

#[derive(Debug, Clone, Args)]
pub struct StartArgs {
    /// Codex sessions root (default: $CODEX_HOME/sessions or ~/.codex/sessions)
    #[arg(long, env = "CODEX_SESSIONS_DIR")]
    pub sessions_dir: Option<PathBuf>,

    #[arg(long, env = "DISCORD_BOT_TOKEN", hide_env_values = true)]
    pub discord_token: Option<String>,

    #[arg(long, env = "DISCORD_GUILD_ID")]
    pub guild_id: Option<String>,

    /// Category new project channels are created under
    #[arg(long, env = "DISCORD_CATEGORY_ID")]
    pub category_id: Option<String>,

    #[arg(long, env = "DISCORD_API_BASE", default_value = "https://discord.com/api/v10")]
    pub discord_api_base: String,

    #[arg(long, env = "CODEX_BIN", default_value = "codex")]
    pub codex_bin: PathBuf,

    /// Model for new projects until a session reports one
    #[arg(long, env = "CODEXCORD_DEFAULT_MODEL")]
    pub default_model: Option<String>,

    #[arg(long, env = "CODEXCORD_APPROVAL_POLICY")]
    pub approval_policy: Option<String>,

    #[arg(long, default_value_t = 1500)]
    pub debounce_ms: u64,

    #[arg(long, default_value_t = 3)]
    pub poll_interval_secs: u64,

    /// Stop the fallback poll this long after the last change to a file
    #[arg(long, default_value_t = 21_600)]
    pub poll_window_secs: u64,

    #[arg(long, default_value_t = 2000)]
    pub buffer_cap: usize,

    #[arg(long, default_value_t = 8000)]
    pub echo_ttl_ms: u64,

    #[arg(long, default_value_t = 3000)]
    pub ingress_poll_ms: u64,

    /// Also post reasoning summaries
    #[arg(long, env = "CODEXCORD_SHOW_REASONING")]
    pub show_reasoning: bool,
}

impl StartArgs {
    pub fn tailer_config(&self) -> TailerConfig {
        TailerConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            poll_window: Duration::from_secs(self.poll_window_secs),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            buffer_cap: self.buffer_cap,
            format: FormatOptions {
                show_reasoning: self.show_reasoning,
            },
            default_model: self.default_model.clone(),
            default_approval_policy: self.approval_policy.clone(),
        }
    }

    pub fn echo_ttl(&self) -> Duration {
        Duration::from_millis(self.echo_ttl_ms)
    }

    pub fn ingress_interval(&self) -> Duration {
        Duration::from_millis(self.ingress_poll_ms.max(250))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_means_start() {
        let cli = Cli::try_parse_from(["codexcord", "--buffer-cap", "50"]).expect("parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.start.buffer_cap, 50);
        assert_eq!(cli.start.debounce_ms, 1500);
    }

    #[test]
    fn start_flags_feed_component_configs() {
        let cli = Cli::try_parse_from([
            "codexcord",
            "--data-dir",
            "/tmp/cc",
            "start",
            "--debounce-ms",
            "250",
            "--buffer-cap",
            "10",
            "--show-reasoning",
            "--default-model",
            "gpt-5-codex",
        ])
        .expect("parse");
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/cc")));
        let Some(Command::Start(args)) = cli.command else {
            panic!("expected start");
        };

        let tailer = args.tailer_config();
        assert_eq!(tailer.debounce, Duration::from_millis(250));
        assert_eq!(tailer.poll_window, Duration::from_secs(21_600));

        let coordinator = args.coordinator_config();
        assert_eq!(coordinator.buffer_cap, 10);
        assert!(coordinator.format.show_reasoning);
        assert_eq!(coordinator.default_model.as_deref(), Some("gpt-5-codex"));
    }

    #[test]
    fn forget_project_takes_a_path() {
        let cli = Cli::try_parse_from(["codexcord", "forget-project", "/srv/api/"]).expect("parse");
        match cli.command {
            Some(Command::ForgetProject { path }) => assert_eq!(path, "/srv/api/"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
