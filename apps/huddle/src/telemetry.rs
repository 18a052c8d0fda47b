pub mod logging {
    //! Subscriber setup for the `huddle` binary.
    //!
    //! One base level applies to every huddle crate. Individual subsystems can
    //! be turned up with `--verbose peer,media` without flooding the output with
    //! the rest of the call, and `HUDDLE_LOG` replaces the computed directives
    //! entirely.

    use clap::ValueEnum;
    use std::fmt;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    pub const FILTER_ENV: &str = "HUDDLE_LOG";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        fn louder(self) -> LogLevel {
            if self >= LogLevel::Debug {
                LogLevel::Trace
            } else {
                LogLevel::Debug
            }
        }
    }

    impl fmt::Display for LogLevel {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// Parts of a call that log under their own module.
    #[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
    pub enum Component {
        Session,
        Peer,
        Signaling,
        Media,
        Monitor,
        Loopback,
        Simulate,
    }

    impl Component {
        fn name(self) -> &'static str {
            match self {
                Component::Session => "session",
                Component::Peer => "peer",
                Component::Signaling => "signaling",
                Component::Media => "media",
                Component::Monitor => "monitor",
                Component::Loopback => "loopback",
                Component::Simulate => "simulate",
            }
        }

        /// Module path the component's events are recorded under.
        pub fn module(self) -> String {
            format!("{}::{}", env!("CARGO_CRATE_NAME"), self.name())
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
        pub verbose: Vec<Component>,
    }

    impl LogConfig {
        /// `EnvFilter` directives for this configuration. Third-party crates
        /// never log louder than `warn`; verbose components sit one step above
        /// the base level.
        pub fn directives(&self) -> String {
            let level = self.level;
            let mut directives = vec![level.min(LogLevel::Warn).as_str().to_string()];
            for krate in [env!("CARGO_CRATE_NAME"), "huddle", "huddle_proto"] {
                directives.push(format!("{krate}={level}"));
            }
            for component in &self.verbose {
                directives.push(format!("{}={}", component.module(), level.louder()));
            }
            directives.join(",")
        }

        fn filter(&self) -> Result<EnvFilter, InitError> {
            match std::env::var(FILTER_ENV) {
                Ok(custom) if !custom.trim().is_empty() => {
                    EnvFilter::try_new(&custom).map_err(|err| InitError::Filter {
                        directives: custom,
                        reason: err.to_string(),
                    })
                }
                _ => Ok(EnvFilter::new(self.directives())),
            }
        }
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("invalid HUDDLE_LOG directives {directives:?}: {reason}")]
        Filter { directives: String, reason: String },
        #[error("a global logger is already installed: {0}")]
        AlreadySet(String),
    }

    /// Installs the global subscriber. Keep the guard alive until exit so
    /// buffered lines reach the writer.
    pub fn init(config: &LogConfig) -> Result<WorkerGuard, InitError> {
        let filter = config.filter()?;
        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.level >= LogLevel::Debug || !config.verbose.is_empty())
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|err| InitError::AlreadySet(err.to_string()))?;
        Ok(guard)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn default_directives_keep_everything_at_warn() {
            let config = LogConfig::default();
            assert_eq!(
                config.directives(),
                "warn,huddle_core=warn,huddle=warn,huddle_proto=warn"
            );
        }

        #[test]
        fn dependencies_never_exceed_warn() {
            let quiet = LogConfig {
                level: LogLevel::Error,
                ..LogConfig::default()
            };
            assert!(quiet.directives().starts_with("error,huddle_core=error"));

            let loud = LogConfig {
                level: LogLevel::Info,
                ..LogConfig::default()
            };
            assert!(loud.directives().starts_with("warn,huddle_core=info"));
        }

        #[test]
        fn verbose_components_get_their_own_directive() {
            let config = LogConfig {
                level: LogLevel::Info,
                verbose: vec![Component::Peer, Component::Media],
                ..LogConfig::default()
            };
            let directives = config.directives();
            assert!(directives.ends_with(",huddle_core::peer=debug,huddle_core::media=debug"));
            assert!(EnvFilter::try_new(&directives).is_ok());

            let tracing = LogConfig {
                level: LogLevel::Debug,
                verbose: vec![Component::Session],
                ..LogConfig::default()
            };
            assert!(tracing.directives().ends_with(",huddle_core::session=trace"));
        }

        #[test]
        fn component_modules_match_the_crate_layout() {
            assert_eq!(Component::Signaling.module(), "huddle_core::signaling");
            assert_eq!(Component::Monitor.module(), "huddle_core::monitor");
            assert_eq!(
                Component::from_str("loopback", true).map(Component::module),
                Ok("huddle_core::loopback".to_string())
            );
        }

        #[test]
        fn level_names_parse_through_clap() {
            for level in LogLevel::value_variants() {
                assert_eq!(LogLevel::from_str(level.as_str(), true), Ok(*level));
            }
        }
    }
}
