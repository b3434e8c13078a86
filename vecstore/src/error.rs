use thiserror::Error;

#[derive(Error, Debug)]
pub enum VecError {
    #[error("vecstore: dimension mismatch: got {got}, want {want}")]
    DimensionMismatch { got: usize, want: usize },

    #[error("vecstore: unknown index kind {0:?}")]
    UnknownIndexKind(String),

    #[error("vecstore: dimension must be positive")]
    ZeroDimension,
}
