pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid annotation value for key {key:?}: {value}")]
    InvalidAnnotation { key: String, value: String },

    #[error("MeshConfig sidecar.{0} not set")]
    MissingImage(&'static str),

    #[error("failed to issue bootstrap certificate for {cn_prefix}: {source}")]
    Certificate {
        cn_prefix: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to persist bootstrap secret {name}: {source}")]
    Secret {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("bootstrap secret {0} not found")]
    MissingBootstrap(String),

    #[error("bootstrap secret {name} is malformed: {reason}")]
    MalformedBootstrap { name: String, reason: String },

    #[error("failed to encode workload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to encode bootstrap config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// === impl Error ===

impl Error {
    pub(crate) fn invalid_annotation(key: impl ToString, value: impl ToString) -> Self {
        Self::InvalidAnnotation {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    /// A coarse classification used to label error metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidAnnotation { .. } => "annotation",
            Self::MissingImage(_) => "image",
            Self::Certificate { .. } => "certificate",
            Self::Secret { .. } | Self::MissingBootstrap(_) | Self::MalformedBootstrap { .. } => {
                "bootstrap"
            }
            Self::Json(_) | Self::Yaml(_) => "encoding",
        }
    }
}
