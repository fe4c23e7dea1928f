#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to create runtime path {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] crate::dispatch::DispatchError),
    #[error("failed to spawn {worker} thread: {source}")]
    Spawn {
        worker: String,
        #[source]
        source: std::io::Error,
    },
    #[error("runtime is already stopped")]
    NotRunning,
}
