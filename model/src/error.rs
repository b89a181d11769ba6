use thiserror::Error;

#[derive(Error, Debug)]
pub enum CapsNetError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch for '{name}': expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("checkpoint is missing tensor '{0}'")]
    MissingTensor(String),

    #[error("checkpoint contains unknown tensor '{0}'")]
    UnexpectedTensor(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backward called before forward on layer '{0}'")]
    NoForwardCache(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, CapsNetError>;

impl From<bincode::Error> for CapsNetError {
    fn from(e: bincode::Error) -> Self {
        CapsNetError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CapsNetError {
    fn from(e: serde_json::Error) -> Self {
        CapsNetError::Serialization(e.to_string())
    }
}
