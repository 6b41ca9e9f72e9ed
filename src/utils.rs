use crate::error::SessionError;
use crate::peer::types::ServerConfig;
use rand::Rng;
use url::Url;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    // Если url уже начинается с "turn:" или "stun:", возвращаем как есть
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        // В зависимости от типа сервера добавляем нужную схему
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Приводит адрес сигнального сервера к ws/wss
pub fn normalize_ws_url(endpoint: &str) -> Result<Url, SessionError> {
    let mut url = Url::parse(endpoint)?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => return Err(SessionError::Scheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| SessionError::Scheme(endpoint.to_string()))?;
    Ok(url)
}

/// Проверка пользовательских ICE серверов перед созданием сессии
pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), SessionError> {
    for server in servers {
        if server.url.is_empty() {
            return Err(SessionError::IceConfig(format!(
                "server '{}' has an empty URL",
                server.id
            )));
        }
        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(SessionError::IceConfig(format!(
                "TURN server '{}' requires username and credential",
                server.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "utils_test.rs"]
mod utils_test;
