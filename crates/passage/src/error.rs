#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Proxy(#[from] passage_proxy::ProxyError),

    #[error("{0}")]
    Settings(#[from] passage_settings::SettingsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
