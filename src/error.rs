use thiserror::Error;

use crate::circuit::CircuitCreationError;

pub type Result<T> = std::result::Result<T, SimError>;

/// Everything that can go wrong while evaluating a circuit.
///
/// Apart from [`SimError::Gpu`], all of these are programmer errors: they are raised
/// immediately where they are detected and never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    #[error("Expected a power of two, got {0}")]
    NotPowerOfTwo(usize),

    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Pixel type mismatch in {context}: expected {expected:?}, got {actual:?}")]
    PixelTypeMismatch {
        context: &'static str,
        expected: crate::backend::PixelType,
        actual: crate::backend::PixelType,
    },

    #[error("Zero-size buffer was {0}")]
    ZeroSizeBuffer(&'static str),

    #[error("Buffer was read before anything was rendered into it")]
    ReadBeforeRender,

    #[error("Shader {0} needs an input buffer")]
    MissingInput(&'static str),

    #[error("Operation spanning {span} qubits exceeds the limit of {max} qubits")]
    TooExpensive { span: u32, max: u32 },

    #[error("Mapping over {span} qubits is not a bijection: {reason}")]
    NotABijection { span: u32, reason: String },

    #[error("Controls conflict on wire {wire}")]
    ControlConflict { wire: u32 },

    #[error("Missing custom context value '{0}'")]
    MissingContext(String),

    #[error("Circuit with {wires} wires exceeds the limit of {max} wires")]
    TooManyWires { wires: u32, max: u32 },

    #[error("Matrix operation failed: {0}")]
    Matrix(String),

    #[error(transparent)]
    Circuit(#[from] CircuitCreationError),

    #[error("Failed to build thread pool: {0}")]
    ThreadPool(String),

    #[error("GPU failure: {0}")]
    Gpu(String),
}

impl SimError {
    pub fn dimension_mismatch(context: &'static str, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            actual,
        }
    }

    pub fn matrix(msg: impl Into<String>) -> Self {
        Self::Matrix(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_context() {
        let err = SimError::dimension_mismatch("ket input", 16, 8);
        let msg = err.to_string();
        assert!(msg.contains("ket input"));
        assert!(msg.contains("16"));
        assert!(msg.contains('8'));

        let err = SimError::TooExpensive { span: 5, max: 4 };
        assert!(err.to_string().contains('5'));
    }
}
