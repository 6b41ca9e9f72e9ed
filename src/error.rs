use thiserror::Error;

/// Фатальные ошибки сессии; пер-пировые сбои сюда не попадают,
/// они логируются и соединение с остальными участниками продолжает жить
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid signaling endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    #[error("unsupported signaling endpoint scheme: {0}")]
    Scheme(String),

    #[error("bad ICE server config: {0}")]
    IceConfig(String),

    #[error("signaling connection failed: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}
