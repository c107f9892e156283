// Configuration manager module
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::director::RetransmitPolicy;
use crate::error::GossipError;
use crate::limiter::LimiterConfig;

/// トランスポート種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
        }
    }

    /// Via ヘッダ用の大文字表記
    pub fn via_token(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = GossipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("udp") {
            Ok(TransportKind::Udp)
        } else if s.eq_ignore_ascii_case("tcp") {
            Ok(TransportKind::Tcp)
        } else {
            Err(GossipError::ConfigError(format!("unknown transport: {}", s)))
        }
    }
}

/// A transport-qualified address, written `udp/host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(kind: TransportKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
        }
    }

    /// `udp/127.0.0.1:5060` 形式の文字列をパースする
    pub fn parse(s: &str) -> Result<Self, GossipError> {
        let (kind, addr) = s
            .split_once('/')
            .ok_or_else(|| GossipError::ConfigError(format!("endpoint without transport: {}", s)))?;
        let kind: TransportKind = kind.trim().parse()?;
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| GossipError::ConfigError(format!("endpoint without port: {}", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(GossipError::ConfigError(format!("endpoint without host: {}", s)));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| GossipError::ConfigError(format!("invalid port in endpoint: {}", s)))?;
        Ok(Self::new(kind, host, port))
    }

    pub fn from_socket_addr(kind: TransportKind, addr: std::net::SocketAddr) -> Self {
        Self::new(kind, addr.ip().to_string(), addr.port())
    }

    /// `host:port`
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.addr())
    }
}

impl FromStr for Endpoint {
    type Err = GossipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

/// メイン設定構造体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 全シナリオを無限に繰り返す
    pub continuous: bool,
    pub loops: u32,
    /// 1秒あたりのシナリオ開始数。0 のときは 1/s
    pub rate: u32,
    /// 同時実行シナリオ数の上限。未指定なら無制限
    #[serde(alias = "concurrentMax")]
    pub concurrent: Option<usize>,
    pub local: Vec<String>,
    pub remote: Vec<String>,
    pub grace_ms: u64,
    pub retransmit_t1_ms: u64,
    pub retransmit_t2_ms: u64,
    pub route_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            continuous: false,
            loops: 1,
            rate: 1,
            concurrent: None,
            local: vec!["udp/0.0.0.0:5065".to_string()],
            remote: vec!["udp/localhost:5060".to_string()],
            grace_ms: 100,
            retransmit_t1_ms: 500,
            retransmit_t2_ms: 4000,
            route_queue_capacity: 8,
        }
    }
}

impl Config {
    /// 設定値のバリデーション
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.loops == 0 && !self.continuous {
            errors.push("loops must be greater than 0".to_string());
        }
        if self.concurrent == Some(0) {
            errors.push("concurrent must be greater than 0".to_string());
        }
        if self.local.is_empty() {
            errors.push("at least one local endpoint is required".to_string());
        }
        if self.remote.is_empty() {
            errors.push("at least one remote endpoint is required".to_string());
        }
        for ep in self.local.iter().chain(self.remote.iter()) {
            if let Err(e) = Endpoint::parse(ep) {
                errors.push(e.to_string());
            }
        }
        if self.retransmit_t1_ms == 0 {
            errors.push("retransmit_t1_ms must be greater than 0".to_string());
        }
        if self.retransmit_t2_ms < self.retransmit_t1_ms {
            errors.push("retransmit_t2_ms must be >= retransmit_t1_ms".to_string());
        }
        // 1件はプローブ用に空けておく必要がある
        if self.route_queue_capacity < 2 {
            errors.push("route_queue_capacity must be at least 2".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn local_endpoints(&self) -> Result<Vec<Endpoint>, GossipError> {
        self.local.iter().map(|s| Endpoint::parse(s)).collect()
    }

    pub fn remote_endpoints(&self) -> Result<Vec<Endpoint>, GossipError> {
        self.remote.iter().map(|s| Endpoint::parse(s)).collect()
    }

    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            concurrent_max: self.concurrent,
            rate: self.rate,
        }
    }

    pub fn retransmit_policy(&self) -> RetransmitPolicy {
        RetransmitPolicy {
            t1: Duration::from_millis(self.retransmit_t1_ms),
            t2: Duration::from_millis(self.retransmit_t2_ms),
        }
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// YAML文字列から設定を読み込み、バリデーションを実行する
pub fn load_from_str(yaml: &str) -> Result<Config, GossipError> {
    let config: Config = if yaml.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(yaml)
            .map_err(|e| GossipError::ConfigError(format!("YAML parse error: {}", e)))?
    };

    config.validate().map_err(|errors| {
        GossipError::ConfigError(format!("Validation errors: {}", errors.join("; ")))
    })?;

    Ok(config)
}

/// YAMLファイルから設定を読み込み、バリデーションを実行する
pub fn load_from_file(path: &Path) -> Result<Config, GossipError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        GossipError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    load_from_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();
        assert!(!config.continuous);
        assert_eq!(config.loops, 1);
        assert_eq!(config.rate, 1);
        assert_eq!(config.concurrent, None);
        assert_eq!(config.local, vec!["udp/0.0.0.0:5065".to_string()]);
        assert_eq!(config.remote, vec!["udp/localhost:5060".to_string()]);
        assert_eq!(config.grace(), Duration::from_millis(100));
    }

    #[test]
    fn test_validate_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_load_from_str_empty_uses_defaults() {
        assert_eq!(load_from_str("").unwrap(), Config::default());
        assert_eq!(load_from_str("{}").unwrap(), Config::default());
    }

    #[test]
    fn test_load_from_str_partial_config_uses_defaults() {
        let yaml = "loops: 3\nrate: 20\nconcurrent: 4\nremote:\n  - tcp/10.0.0.1:5060\n";
        let loaded = load_from_str(yaml).unwrap();
        assert_eq!(loaded.loops, 3);
        assert_eq!(loaded.rate, 20);
        assert_eq!(loaded.concurrent, Some(4));
        assert_eq!(loaded.remote, vec!["tcp/10.0.0.1:5060".to_string()]);
        assert_eq!(loaded.local, Config::default().local);
    }

    #[test]
    fn test_load_from_str_accepts_concurrent_max_alias() {
        let loaded = load_from_str("concurrentMax: 2\n").unwrap();
        assert_eq!(loaded.concurrent, Some(2));
    }

    #[test]
    fn test_load_from_str_invalid_yaml() {
        let err = load_from_str("loops: [unclosed").unwrap_err();
        match &err {
            GossipError::ConfigError(msg) => assert!(msg.contains("YAML")),
            _ => panic!("Expected ConfigError, got {:?}", err),
        }
        assert!(err.is_fatal());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let config = Config {
            loops: 0,
            concurrent: Some(0),
            remote: vec!["bogus".to_string()],
            route_queue_capacity: 1,
            ..Config::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.len() >= 4, "errors: {:?}", errors);
        assert!(errors.iter().any(|e| e.contains("loops")));
        assert!(errors.iter().any(|e| e.contains("concurrent")));
        assert!(errors.iter().any(|e| e.contains("bogus")));
        assert!(errors.iter().any(|e| e.contains("route_queue_capacity")));
    }

    #[test]
    fn test_continuous_allows_zero_loops() {
        let config = Config {
            continuous: true,
            loops: 0,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_valid_config() {
        let mut tmpfile = NamedTempFile::new().unwrap();
        tmpfile
            .write_all(b"continuous: true\nlocal:\n  - udp/127.0.0.1:5070\n")
            .unwrap();
        tmpfile.flush().unwrap();

        let loaded = load_from_file(tmpfile.path()).unwrap();
        assert!(loaded.continuous);
        assert_eq!(loaded.local_endpoints().unwrap()[0].port, 5070);
    }

    #[test]
    fn test_load_from_file_nonexistent_file() {
        let result = load_from_file(Path::new("/tmp/nonexistent_gossip_12345.cfg"));
        match result {
            Err(GossipError::ConfigError(msg)) => assert!(msg.contains("read")),
            other => panic!("Expected ConfigError, got {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_parse() {
        let ep = Endpoint::parse("udp/127.0.0.1:5060").unwrap();
        assert_eq!(ep.kind, TransportKind::Udp);
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 5060);
        assert_eq!(ep.addr(), "127.0.0.1:5060");
        assert_eq!(ep.to_string(), "udp/127.0.0.1:5060");

        let ep: Endpoint = "TCP/localhost:5061".parse().unwrap();
        assert_eq!(ep.kind, TransportKind::Tcp);
        assert_eq!(ep.host, "localhost");
    }

    #[test]
    fn test_endpoint_parse_ipv6() {
        let ep = Endpoint::parse("udp/[::1]:5060").unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.addr(), "[::1]:5060");
    }

    #[test]
    fn test_endpoint_parse_errors() {
        assert!(Endpoint::parse("127.0.0.1:5060").is_err());
        assert!(Endpoint::parse("sctp/127.0.0.1:5060").is_err());
        assert!(Endpoint::parse("udp/127.0.0.1").is_err());
        assert!(Endpoint::parse("udp/:5060").is_err());
        assert!(Endpoint::parse("udp/host:99999").is_err());
    }

    #[test]
    fn test_retransmit_policy_from_config() {
        let policy = Config::default().retransmit_policy();
        assert_eq!(policy.t1, Duration::from_millis(500));
        assert_eq!(policy.t2, Duration::from_secs(4));
    }
}
