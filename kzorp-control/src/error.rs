#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] kzorp_proto::ProtocolError),
}

pub type Result<T> = std::result::Result<T, ControlError>;
