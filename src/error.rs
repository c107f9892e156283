use crate::template::TemplateError;

#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("SIP parse error: {0}")]
    ParseError(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Scenario file error in {path}: {message}")]
    ScenarioFile { path: String, message: String },
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
    #[error("Too many {0} headers")]
    DuplicateHeader(String),
    #[error("Unknown step alias: {0}")]
    UnknownAlias(String),
    #[error("No transport for endpoint {0}")]
    NoTransport(String),
    #[error("Transport closed: {0}")]
    TransportClosed(String),
    #[error("Party task failed: {0}")]
    TaskFailed(String),
    #[error("{context}: {source}")]
    Scenario {
        context: String,
        #[source]
        source: Box<GossipError>,
    },
}

impl GossipError {
    /// Wrap an error with the location of the failing step.
    pub fn in_scenario(context: impl Into<String>, source: GossipError) -> Self {
        GossipError::Scenario {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// 設定やシナリオ定義の欠陥によるエラーかどうか。
    /// この種のエラーはプロセス全体を異常終了させる。
    pub fn is_fatal(&self) -> bool {
        match self {
            GossipError::ConfigError(_)
            | GossipError::ScenarioFile { .. }
            | GossipError::Template(_)
            | GossipError::DuplicateHeader(_)
            | GossipError::UnknownAlias(_)
            | GossipError::NoTransport(_) => true,
            GossipError::Scenario { source, .. } => source.is_fatal(),
            GossipError::ParseError(_)
            | GossipError::NetworkError(_)
            | GossipError::TransportClosed(_)
            | GossipError::TaskFailed(_) => false,
        }
    }
}
