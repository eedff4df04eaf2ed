use std::io::Write;

use passage_proxy::{
    DnsResolver, ProxyServer, ProxyServerConfig, ResolverConfig, TransferConfig,
};
use passage_settings::{ConfigLoader, PassageConfig};
use tracing::info;

use crate::cli::ServeArgs;
use crate::error::CliError;

pub async fn serve(args: ServeArgs) -> Result<(), CliError> {
    let mut config = ConfigLoader::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.proxy.bind_addr = bind;
    }
    config.validate()?;

    let resolver = DnsResolver::spawn(ResolverConfig {
        cache_cleanup_period: config.dns.cache_cleanup_period(),
    });
    let server = ProxyServer::new(server_config(&config), resolver)?;
    let handle = server.start().await?;

    // The actual address matters when port 0 was requested; print it where
    // scripts can read it.
    println!("listening on {}", handle.local_addr());
    std::io::stdout().flush().ok();
    info!(addr = %handle.local_addr(), "proxy started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await?;
    Ok(())
}

fn server_config(config: &PassageConfig) -> ProxyServerConfig {
    ProxyServerConfig {
        bind_addr: config.proxy.bind_addr,
        connect_timeout: config.proxy.connect_timeout(),
        max_connections: config.proxy.max_connections,
        bytes_per_tick: config.proxy.bytes_per_tick,
        transfer: TransferConfig {
            io_chunk_size: config.proxy.io_chunk_size,
            idle_connection_timeout: config.proxy.idle_connection_timeout(),
            tick_interval: config.proxy.tick_interval(),
        },
    }
}
