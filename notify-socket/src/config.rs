//! 连接配置

use std::path::PathBuf;
use std::time::Duration;

/// TLS 配置
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA 证书路径
    pub ca_cert_path: Option<PathBuf>,
    /// 客户端证书路径 (PEM 或 P12)
    pub client_cert_path: Option<PathBuf>,
    /// 客户端私钥路径 (PEM)，P12 时不需要
    pub client_key_path: Option<PathBuf>,
    /// P12 密码（如果使用 PKCS#12 格式）
    pub client_p12_password: Option<String>,
    /// 是否跳过服务器证书验证（仅开发用）
    pub danger_accept_invalid_certs: bool,
}

impl TlsConfig {
    /// 没有任何自定义项时直接用系统默认
    pub fn is_default(&self) -> bool {
        self.ca_cert_path.is_none()
            && self.client_cert_path.is_none()
            && !self.danger_accept_invalid_certs
    }
}

/// 会话配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket 地址 (ws:// 或 wss://)
    pub url: String,
    /// TLS 配置
    pub tls: TlsConfig,
    /// 从打开连接到收到 ready 的最长等待
    pub handshake_timeout: Duration,
    /// 出站队列长度，满了就丢（心跳下一拍会再发）
    pub outbound_buffer: usize,
}

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

impl Default for SessionConfig {
    fn default() -> Self {
        // 从环境变量读取配置，默认 localhost:10005
        let host = std::env::var("NOTIFY_SERVER_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("NOTIFY_SERVER_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(10005);
        let scheme = if std::env::var("NOTIFY_USE_TLS").map(|v| v == "true").unwrap_or(true) {
            "wss"
        } else {
            "ws"
        };
        let path = std::env::var("NOTIFY_SOCKET_PATH").unwrap_or_else(|_| "/events".to_string());

        Self {
            url: format!("{}://{}:{}{}", scheme, host, port, path),
            tls: TlsConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            outbound_buffer: 64,
        }
    }
}

impl SessionConfig {
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert!(config.url.starts_with("ws"));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert!(config.tls.is_default());
    }

    #[test]
    fn test_with_url_keeps_defaults() {
        let config = SessionConfig::with_url("ws://127.0.0.1:9000/events");
        assert_eq!(config.url, "ws://127.0.0.1:9000/events");
        assert_eq!(config.outbound_buffer, 64);
    }
}
