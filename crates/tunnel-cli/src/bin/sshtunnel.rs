use anyhow::Result;
use tunnel_cli::{init_tracing, tunnel_cli::TunnelArgs};
use tunnel_core::run_tunnel;

#[tokio::main]
async fn main() -> Result<()> {
    let (config, level) = TunnelArgs::parse_config()?;
    init_tracing(level);
    tracing::debug!(?config, "starting tunnel");
    run_tunnel(config).await?;
    Ok(())
}
