use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Panel unreachable, timed out or answered with an unreadable body.
    #[error("panel transport error: {0}")]
    Transport(String),

    /// The panel answered but the body carries a failure marker.
    #[error("panel rejected request: {0}")]
    PanelRejection(String),

    /// Routing resources could not be enumerated. Aborts the current pass only.
    #[error("unable to list routing resources: {0}")]
    ClusterList(#[source] kube::Error),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The site listing could not be trusted, so no deletion may be derived from it.
    #[error("ambiguous panel state: {0}")]
    AmbiguousPanelState(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid Ingress manifest: {0}")]
    Manifest(#[from] serde_yaml::Error),

    /// The Ingress exists but does not carry the sync annotation.
    #[error("Ingress {0} is not managed by kube-bt-sync")]
    NotManaged(String),
}

impl Error {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn rejection(msg: impl Into<String>) -> Self {
        Self::PanelRejection(msg.into())
    }

    pub fn ambiguous(msg: impl Into<String>) -> Self {
        Self::AmbiguousPanelState(msg.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
