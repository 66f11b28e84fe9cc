use std::collections::{HashMap, HashSet};
use std::time::Duration;

use clap::Parser;
use itertools::Itertools;

use config::{Config, ConfigError, Environment, File};

use hostsniff::{ReadMode, SnifferConfig, MAX_PROBE_SIZE};

use crate::rules::{normalize_host, Condition, RouteTable};

const DEFAULT_SNIFF_TIMEOUT_MS: u64 = 3000;

/// Environment variables `HOSTSNIFF_<SECTION>__<KEY>` override the file, so
/// every key is spelled with underscores.
const ENV_PREFIX: &str = "hostsniff";

/// Forwards TCP connections to an upstream picked by the TLS SNI or HTTP
/// `Host` found in the client's first bytes.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// YAML file with the listen address, sniff options, upstreams and rules
    #[clap(short, long, default_value = "config.yaml")]
    config: String,

    /// Directory to enter before the config path is resolved
    #[clap(short, long, default_value = ".")]
    work_dir: String,
}

#[derive(Debug)]
pub struct Settings {
    pub debug: bool,
    pub listen: String,
    pub sniff: SnifferConfig,
    /// Upper bound on the time spent waiting for the client's first bytes.
    pub sniff_timeout: Duration,
    pub routes: RouteTable,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let args = Args::parse();
        std::env::set_current_dir(&args.work_dir).map_err(|e| {
            ConfigError::Message(format!("cannot enter work dir {}: {}", args.work_dir, e))
        })?;

        let mut s = Config::new();
        s.merge(File::with_name(&args.config))?;
        s.merge(env_overrides())?;

        Self::from_config(&s)
    }

    pub fn from_config(s: &Config) -> Result<Self, ConfigError> {
        /* 1. Parse the upstreams section */
        let mut routes = RouteTable::default();
        for upstream_value in optional(s.get_array("upstreams"))?.unwrap_or_default() {
            let upstream = upstream_value.into_table()?;

            let name = upstream
                .get("name")
                .ok_or_else(|| ConfigError::Message("Not found the name of upstream.".to_owned()))?
                .clone()
                .into_str()?;
            let addr = upstream
                .get("addr")
                .ok_or_else(|| {
                    ConfigError::Message(format!("Not found the addr of upstream {}.", name))
                })?
                .clone()
                .into_str()?;

            routes.add(name, addr);
        }

        /* 2. Parse the actual rules. */
        parse_route_rules(s, &mut routes)?;

        /* 3. Parse the sniffer knobs. */
        let sniff = parse_sniffer_config(s)?;
        let sniff_timeout = Duration::from_millis(
            optional(s.get::<u64>("sniff.timeout"))?.unwrap_or(DEFAULT_SNIFF_TIMEOUT_MS),
        );

        Ok(Settings {
            debug: optional(s.get_bool("debug"))?.unwrap_or(false),
            listen: s.get_str("listen")?,
            sniff,
            sniff_timeout,
            routes,
        })
    }
}

fn env_overrides() -> Environment {
    Environment::with_prefix(ENV_PREFIX).separator("__")
}

/// Absent keys fall back to a default; present but malformed ones are errors.
fn optional<T>(value: Result<T, ConfigError>) -> Result<Option<T>, ConfigError> {
    match value {
        Ok(v) => Ok(Some(v)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn parse_sniffer_config(s: &Config) -> Result<SnifferConfig, ConfigError> {
    let probe_size = match optional(s.get_int("sniff.probe_size"))? {
        Some(size) if size >= 1 && size <= MAX_PROBE_SIZE as i64 => size as usize,
        Some(size) => {
            return Err(ConfigError::Message(format!(
                "sniff.probe_size must be within 1..={}, got {}.",
                MAX_PROBE_SIZE, size
            )))
        }
        None => MAX_PROBE_SIZE,
    };

    let read_mode = match optional(s.get_str("sniff.read_mode"))? {
        Some(mode) => mode.parse::<ReadMode>().map_err(ConfigError::Message)?,
        None => ReadMode::default(),
    };

    Ok(SnifferConfig {
        probe_size,
        read_mode,
        case_insensitive_host: optional(s.get_bool("sniff.case_insensitive_host"))?
            .unwrap_or(false),
    })
}

fn parse_route_rules(s: &Config, route: &mut RouteTable) -> Result<(), ConfigError> {
    let mut domain_dict: HashMap<String, (HashSet<String>, HashSet<String>)> = HashMap::new();

    for rule in optional(s.get_array("rules"))?.unwrap_or_default() {
        let rule = rule.into_str()?;
        let (keyword, param, upstream_name) = rule
            .split(',')
            .map(|v| v.trim())
            .collect_tuple::<(_, _, _)>()
            .ok_or_else(|| {
                ConfigError::Message(format!(
                    "Expect a (keyword, param, upstream) tuple, got `{}`.",
                    rule
                ))
            })?;

        let upstream = &route
            .upstream_dict
            .get(upstream_name)
            .ok_or_else(|| {
                ConfigError::Message(format!("Upstream {} is not found.", upstream_name))
            })?
            .0;

        match keyword {
            "DEFAULT" => {
                route.default = Some(upstream.clone());
            }
            tag @ ("DOMAIN" | "DOMAIN-SUFFIX") => {
                if param.is_empty() {
                    return Err(ConfigError::Message(format!("{} rule needs a domain.", tag)));
                }
                let (domains, suffix_domains) =
                    domain_dict.entry(upstream_name.to_owned()).or_default();
                match tag {
                    "DOMAIN" => domains.insert(normalize_host(param)),
                    _ => suffix_domains.insert(normalize_host(param)),
                };
            }
            e => {
                return Err(ConfigError::Message(format!(
                    "{} is not a valid rule keyword.",
                    e
                )));
            }
        }
    }

    for (name, (domains, suffix_domains)) in domain_dict {
        if let Some(rule) = route.upstream_dict.get_mut(&name) {
            rule.1 = Some(Condition {
                domains,
                suffix_domains,
            });
        }
    }

    Ok(())
}
