use passage_settings::ConfigLoader;

use crate::cli::CheckArgs;
use crate::error::CliError;

pub async fn check(args: CheckArgs) -> Result<(), CliError> {
    let config = ConfigLoader::load(args.config.as_deref())?;
    config.validate()?;

    println!("Configuration OK");
    println!("Proxy: {}", config.proxy.bind_addr);
    println!(
        "Idle timeout: {}s, chunk size: {} bytes",
        config.proxy.idle_connection_timeout_secs, config.proxy.io_chunk_size
    );
    println!(
        "DNS cache sweep: every {}s",
        config.dns.cache_cleanup_period_secs
    );
    Ok(())
}
