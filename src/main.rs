use trinity_cluster::config::{CliArgs, NodeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = match CliArgs::parse(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(e) => {
            let program = std::env::args().next().unwrap_or_else(|| "trinity-node".into());
            eprintln!("{}", e);
            eprintln!(
                "Usage: {} [--config <file>] [--bind <ip:port>] [--store <path>]",
                program
            );
            eprintln!("Example: {} --bind 127.0.0.1:5556 --store node2.json", program);
            std::process::exit(1);
        }
    };

    let config = NodeConfig::from_cli(&cli)?;

    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level()?)
        .init();

    tracing::info!("Starting node on {}", config.bind_addr);
    let node = trinity_cluster::node::start(&config).await?;
    tracing::info!("Press Ctrl+C to shutdown");

    tokio::signal::ctrl_c().await?;
    node.shutdown().await?;

    Ok(())
}
