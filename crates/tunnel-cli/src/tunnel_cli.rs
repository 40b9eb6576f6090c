use std::{env, time::Duration};

use anyhow::{Result, anyhow, bail};
use clap::{ArgAction, Parser};
use tracing::level_filters::LevelFilter;
use tunnel_core::{TunnelConfig, logging::level_from_verbosity};

use crate::redirect::{parse_redirect, split_redirect_list};

/// Environment variable holding extra redirects, separated by `/`.
pub const REDIRECTS_ENV: &str = "SSH_REDIRECTS";

#[derive(Debug, Parser)]
#[command(
    name = "sshtunnel",
    version,
    about = "Expose local services on a remote SSH server over a single connection"
)]
pub struct TunnelArgs {
    /// Private key file, or @passphrase to derive an Ed25519 key
    #[arg(long, env = "SSH_PRIVATE_KEY", value_name = "KEY", hide_env_values = true)]
    key: Option<String>,
    /// SSH server as host or host:port (port defaults to 22)
    #[arg(long, env = "SSH_REMOTE_HOST", value_name = "HOST")]
    host: Option<String>,
    /// Remote username (defaults to the current user)
    #[arg(long, env = "USER", value_name = "USER")]
    user: Option<String>,
    /// Expected server key blueprint; learned on first contact when absent
    #[arg(long, env = "SSH_KEY_BLUEPRINT", value_name = "BLUEPRINT")]
    blueprint: Option<String>,
    /// Print the server key blueprint and exit
    #[arg(long, action = ArgAction::SetTrue)]
    show_blueprint: bool,
    /// Send keepalive probes every N seconds; 0 disables them
    #[arg(long = "keepalive-interval", value_name = "SECONDS", default_value_t = 30)]
    keepalive_interval: u64,
    /// More log output (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// Less log output (repeatable)
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "verbose")]
    quiet: u8,
    /// Redirects in [remoteHost:]remotePort:[localHost:]localPort form
    #[arg(value_name = "REDIRECT")]
    redirects: Vec<String>,
}

impl TunnelArgs {
    pub fn parse_config() -> Result<(TunnelConfig, LevelFilter)> {
        let args = TunnelArgs::parse();
        let level = args.log_level();
        Ok((TunnelConfig::try_from(args)?, level))
    }

    pub fn log_level(&self) -> LevelFilter {
        level_from_verbosity(self.verbose, self.quiet)
    }
}

impl TryFrom<TunnelArgs> for TunnelConfig {
    type Error = anyhow::Error;

    fn try_from(args: TunnelArgs) -> Result<Self> {
        let TunnelArgs {
            key,
            host,
            user,
            blueprint,
            show_blueprint,
            keepalive_interval,
            verbose: _,
            quiet: _,
            redirects,
        } = args;

        let key = non_empty(key).ok_or_else(|| anyhow!("no private key defined; use --key or SSH_PRIVATE_KEY"))?;
        let host = non_empty(host).ok_or_else(|| anyhow!("no remote host defined; use --host or SSH_REMOTE_HOST"))?;
        let user = non_empty(user)
            .or_else(fallback_username)
            .ok_or_else(|| anyhow!("no user defined; use --user or USER"))?;

        let from_env = env::var(REDIRECTS_ENV).unwrap_or_default();
        let redirects = redirects
            .iter()
            .map(String::as_str)
            .chain(split_redirect_list(&from_env))
            .map(parse_redirect)
            .collect::<Result<Vec<_>>>()?;
        if redirects.is_empty() && !show_blueprint {
            bail!("no redirects are defined, no reason to start");
        }

        let keepalive_interval = (keepalive_interval > 0).then(|| Duration::from_secs(keepalive_interval));

        Ok(TunnelConfig {
            user,
            host,
            key,
            blueprint: non_empty(blueprint),
            show_blueprint,
            redirects,
            keepalive_interval,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn fallback_username() -> Option<String> {
    for key in ["LOGNAME", "USERNAME"] {
        if let Ok(value) = env::var(key)
            && !value.is_empty()
        {
            return Some(value);
        }
    }
    let current = whoami::username();
    if current.is_empty() { None } else { Some(current) }
}
