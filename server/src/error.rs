use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("socket setup failed: {0}")]
    SocketSetup(#[source] io::Error),
    #[error("failed to start worker loops: {0}")]
    WorkerStart(#[source] io::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
