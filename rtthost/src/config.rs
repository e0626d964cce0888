use anyhow::{bail, Context, Result};
use figment::providers::{Env, Format as _, Json, Serialized, Toml, Yaml};
use figment::Figment;
use rtt_relay::{BridgeConfig, PushMode, ReadConfig, ScanConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;

/// Base name of the config files picked up from the working directory.
const CONFIG_FILE: &str = ".rtthost";

/// Prefix of environment variables overriding the config. Nested keys are separated by `__`,
/// e.g. `RTTHOST_BRIDGE__PORT`.
const ENV_PREFIX: &str = "RTTHOST_";

/// The complete configuration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Index of the debug probe to use.
    pub probe: usize,
    /// Target chip, auto-detected if unset.
    pub chip: Option<String>,
    /// RAM window scanned for the control block.
    pub scan: ScanConfig,
    /// Address of the device identification register.
    pub idcode_address: u64,
    /// Channel number of the console. Up data goes to stdout, stdin goes to the down channel.
    pub console_channel: usize,
    pub bridge: BridgeOptions,
    pub read: ReadConfig,
    pub push_mode: PushMode,
    /// Log the duration of every poll cycle.
    pub show_cycle_time: bool,
    /// Level of the stderr log, `RUST_LOG` applies if unset.
    #[serde(with = "crate::logging::level_filter")]
    pub log_level: Option<LevelFilter>,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            probe: 0,
            chip: None,
            scan: ScanConfig::default(),
            idcode_address: 0xE004_2000,
            console_channel: 0,
            bridge: BridgeOptions::default(),
            read: ReadConfig::default(),
            push_mode: PushMode::default(),
            show_cycle_time: false,
            log_level: None,
            log_file: None,
        }
    }
}

/// Settings of the SystemView relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeOptions {
    pub enabled: bool,
    /// RTT channel tunneled to the client.
    pub channel: usize,
    #[serde(flatten)]
    pub server: BridgeConfig,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: 1,
            server: BridgeConfig::default(),
        }
    }
}

/// Values given on the command line. They take precedence over everything else.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub probe: Option<usize>,
    pub chip: Option<String>,
    pub ram_start: Option<u64>,
    pub ram_size_kib: Option<usize>,
    pub console_channel: Option<usize>,
    pub bridge: bool,
    pub bridge_channel: Option<usize>,
    pub bridge_port: Option<u16>,
    pub show_cycle_time: bool,
    pub log_level: Option<LevelFilter>,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Loads the configuration.
    ///
    /// Layers, from lowest to highest priority: built-in defaults, the config file (either
    /// `config_file` or `.rtthost.{toml,json,yaml,yml}` in the working directory), `RTTHOST_`
    /// environment variables and finally the command line.
    pub fn load(config_file: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let mut config = Self::figment(config_file)?
            .extract::<Self>()
            .context("Failed to load the configuration")?;
        config.apply(overrides);
        Ok(config)
    }

    fn figment(config_file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        match config_file {
            Some(path) => {
                if !path.is_file() {
                    bail!("Config file {} does not exist", path.display());
                }

                figment = match path.extension().and_then(|e| e.to_str()) {
                    Some("toml") => figment.merge(Toml::file(path)),
                    Some("json") => figment.merge(Json::file(path)),
                    Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                    _ => bail!(
                        "Unknown config file format of {}, expected toml, json or yaml",
                        path.display()
                    ),
                };
            }
            None => {
                figment = figment
                    .merge(Toml::file(format!("{CONFIG_FILE}.toml")))
                    .merge(Json::file(format!("{CONFIG_FILE}.json")))
                    .merge(Yaml::file(format!("{CONFIG_FILE}.yaml")))
                    .merge(Yaml::file(format!("{CONFIG_FILE}.yml")));
            }
        }

        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    fn apply(&mut self, overrides: Overrides) {
        let Overrides {
            probe,
            chip,
            ram_start,
            ram_size_kib,
            console_channel,
            bridge,
            bridge_channel,
            bridge_port,
            show_cycle_time,
            log_level,
            log_file,
        } = overrides;

        if let Some(probe) = probe {
            self.probe = probe;
        }
        if chip.is_some() {
            self.chip = chip;
        }
        if let Some(start) = ram_start {
            self.scan.ram_start = start;
        }
        if let Some(kib) = ram_size_kib {
            self.scan.ram_size = kib * 1024;
        }
        if let Some(channel) = console_channel {
            self.console_channel = channel;
        }
        self.bridge.enabled |= bridge;
        if let Some(channel) = bridge_channel {
            self.bridge.channel = channel;
        }
        if let Some(port) = bridge_port {
            self.bridge.server.port = port;
        }
        self.show_cycle_time |= show_cycle_time;
        if log_level.is_some() {
            self.log_level = log_level;
        }
        if log_file.is_some() {
            self.log_file = log_file;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults() {
        Jail::expect_with(|_jail| {
            let config = Config::load(None, Overrides::default()).unwrap();
            assert_eq!(config, Config::default());
            assert_eq!(config.scan.ram_start, 0x2000_0000);
            assert_eq!(config.scan.ram_size, 16 * 1024);
            assert_eq!(config.bridge.channel, 1);
            assert_eq!(config.bridge.server.port, 19111);
            assert_eq!(config.bridge.server.chunk_size, 1400);
            assert!(!config.bridge.enabled);
            Ok(())
        });
    }

    #[test]
    fn file_then_env_then_cli() {
        Jail::expect_with(|jail| {
            jail.create_file(
                ".rtthost.toml",
                r#"
                    chip = "nRF52840_xxAA"
                    console_channel = 2
                    push_mode = "modified-range"

                    [scan]
                    ram_size = 65536

                    [bridge]
                    enabled = true
                    port = 2000
                "#,
            )?;
            jail.set_env("RTTHOST_CONSOLE_CHANNEL", "3");
            jail.set_env("RTTHOST_BRIDGE__PORT", "3000");

            let config = Config::load(
                None,
                Overrides {
                    bridge_port: Some(4000),
                    ..Default::default()
                },
            )
            .unwrap();

            assert_eq!(config.chip.as_deref(), Some("nRF52840_xxAA"));
            assert_eq!(config.scan.ram_size, 65536);
            assert_eq!(config.push_mode, PushMode::ModifiedRange);
            assert!(config.bridge.enabled);
            assert_eq!(config.console_channel, 3);
            assert_eq!(config.bridge.server.port, 4000);
            Ok(())
        });
    }

    #[test]
    fn explicit_yaml_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "host.yaml",
                "log_level: DEBUG\nbridge:\n  channel: 4\n  chunk_size: 512\n",
            )?;

            let config = Config::load(Some(Path::new("host.yaml")), Overrides::default()).unwrap();
            assert_eq!(config.log_level, Some(LevelFilter::DEBUG));
            assert_eq!(config.bridge.channel, 4);
            assert_eq!(config.bridge.server.chunk_size, 512);
            Ok(())
        });
    }

    #[test]
    fn missing_or_unknown_file() {
        Jail::expect_with(|jail| {
            assert!(Config::load(Some(Path::new("nope.toml")), Overrides::default()).is_err());

            jail.create_file("host.ini", "chip = x")?;
            assert!(Config::load(Some(Path::new("host.ini")), Overrides::default()).is_err());
            Ok(())
        });
    }

    #[test]
    fn ram_size_in_kib() {
        let mut config = Config::default();
        config.apply(Overrides {
            ram_start: Some(0x2400_0000),
            ram_size_kib: Some(64),
            bridge: true,
            ..Default::default()
        });

        assert_eq!(config.scan.ram_start, 0x2400_0000);
        assert_eq!(config.scan.ram_size, 64 * 1024);
        assert!(config.bridge.enabled);
    }
}
