//! Command-line interface for the controller binary.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

pub const DEFAULT_CONFIG_PATH: &str = "kyco.toml";

/// Command line arguments; every option except the config path overrides
/// the matching setting from the configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub core_napps_dir: Option<PathBuf>,
    pub napps_dir: Option<PathBuf>,
    pub bind_address: Option<String>,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

impl CliArgs {
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    pub fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
            core_napps_dir: matches.get_one::<String>("core-napps").map(PathBuf::from),
            napps_dir: matches.get_one::<String>("napps").map(PathBuf::from),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

pub fn command() -> Command {
    Command::new("kyco")
        .version(env!("CARGO_PKG_VERSION"))
        .about("SDN controller core: switch connections in, NApp decisions out")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("core-napps")
                .long("core-napps")
                .value_name("DIR")
                .help("Core NApps directory"),
        )
        .arg(
            Arg::new("napps")
                .short('n')
                .long("napps")
                .value_name("DIR")
                .help("Ordinary NApps directory"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Bind address (e.g., 127.0.0.1:6633)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(clap::ArgAction::SetTrue),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let matches = command().try_get_matches_from(["kyco"]).expect("no arguments is valid");
        let args = CliArgs::from_matches(&matches);

        assert_eq!(args.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(args.napps_dir, None);
        assert!(!args.json_logs);
    }

    #[test]
    fn test_overrides() {
        let matches = command()
            .try_get_matches_from([
                "kyco",
                "--config",
                "/etc/kyco.toml",
                "--core-napps",
                "/opt/core",
                "-n",
                "/opt/apps",
                "--bind",
                "0.0.0.0:6653",
                "-l",
                "debug",
                "--json-logs",
            ])
            .expect("valid arguments");

        assert_eq!(
            CliArgs::from_matches(&matches),
            CliArgs {
                config_path: PathBuf::from("/etc/kyco.toml"),
                core_napps_dir: Some(PathBuf::from("/opt/core")),
                napps_dir: Some(PathBuf::from("/opt/apps")),
                bind_address: Some("0.0.0.0:6653".to_string()),
                log_level: Some("debug".to_string()),
                json_logs: true,
            }
        );
    }
}
