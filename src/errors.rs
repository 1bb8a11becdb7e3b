use thiserror::Error;

#[derive(Error, Debug)]
pub enum MorphoError {
    #[error("incompatible shapes: expected {expected:?}, found {found:?}")]
    ShapeMismatch { expected: Vec<usize>, found: Vec<usize> },
    #[error("mesh carries no elements of grade {0}")]
    MissingGrade(usize),
    #[error("element {element} of grade {grade} has {found} vertices, expected {expected}")]
    ElementArity { grade: usize, element: usize, expected: usize, found: usize },
    #[error("degenerate element {element} of grade {grade}")]
    DegenerateElement { grade: usize, element: usize },
    #[error("singular linear system in {0}")]
    Singular(&'static str),
    #[error("index {index} out of bounds for {what} of length {len}")]
    OutOfBounds { what: &'static str, index: usize, len: usize },
    #[error("field layout mismatch: {0}")]
    FieldLayout(String),
    #[error("functional `{0}` does not consume a field")]
    NoField(String),
    #[error("no descending bracket found after {0} expansions")]
    Bracketing(u32),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("user callback failed: {0}")]
    Callback(#[from] anyhow::Error),
}

pub type MorphoResult<T> = Result<T, MorphoError>;
