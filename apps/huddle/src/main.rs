use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use huddle_core::config::HuddleConfig;
use huddle_core::media::DeviceProfile;
use huddle_core::simulate::{self, SimulationOptions};
use huddle_core::telemetry::logging::{self, Component, LogConfig, LogLevel};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "huddle", about = "Peer-to-peer video call session manager", author, version)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "HUDDLE_CONFIG",
        value_name = "PATH",
        help = "TOML configuration file"
    )]
    config: Option<PathBuf>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "HUDDLE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "HUDDLE_LOG_FILE",
        help = "Write logs to the specified file"
    )]
    file: Option<PathBuf>,

    #[arg(
        long = "verbose",
        global = true,
        value_enum,
        value_delimiter = ',',
        value_name = "COMPONENT",
        env = "HUDDLE_LOG_VERBOSE",
        help = "Log these components one level louder (session, peer, signaling, media, monitor, loopback, simulate)"
    )]
    verbose: Vec<Component>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
            verbose: self.verbose.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run several participants in one room over the in-process network
    Simulate(SimulateArgs),
    /// Load, validate and print the effective configuration
    CheckConfig,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[arg(long, short = 'n', default_value_t = 3, help = "Number of participants")]
    participants: usize,

    #[arg(long, default_value_t = 8, help = "Seconds to hold the full room")]
    seconds: u64,

    #[arg(long, default_value_t = 500, help = "Milliseconds between participants joining")]
    stagger_ms: u64,

    #[arg(long, help = "Room to join (overrides the configuration)")]
    room: Option<String>,

    #[arg(
        long,
        help = "Use WebSocket signaling at the configured signaling URL instead of the in-process server"
    )]
    external_signaling: bool,

    #[arg(long, help = "Simulate Android phones instead of desktops")]
    mobile: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    let mut config = HuddleConfig::resolve(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::CheckConfig => {
            config.validate().context("configuration is invalid")?;
            let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
            println!("{rendered}");
        }
        Command::Simulate(args) => {
            if let Some(room) = args.room {
                config.session.room_id = room;
            }
            let template = config.session_config().context("configuration is invalid")?;
            let options = SimulationOptions {
                participants: args.participants.max(1),
                stagger: Duration::from_millis(args.stagger_ms),
                hold: Duration::from_secs(args.seconds),
                external_signaling: args.external_signaling,
                profile: if args.mobile {
                    DeviceProfile::android_phone()
                } else {
                    DeviceProfile::default()
                },
                ..SimulationOptions::default()
            };
            let report = simulate::run(template, options).await.context("simulation failed")?;
            print!("{}", report.render());
            if !report.fully_meshed() {
                anyhow::bail!("not every participant saw the full room");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_components_are_comma_separated() {
        let cli = Cli::try_parse_from([
            "huddle",
            "--log-level",
            "info",
            "--verbose",
            "peer,media",
            "check-config",
        ])
        .unwrap();
        let config = cli.logging.to_config();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.verbose, vec![Component::Peer, Component::Media]);
        assert!(matches!(cli.command, Command::CheckConfig));
    }

    #[test]
    fn unknown_component_is_rejected() {
        assert!(Cli::try_parse_from(["huddle", "--verbose", "audio", "check-config"]).is_err());
    }
}
