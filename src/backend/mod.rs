//! The render primitive everything else is built on.
//!
//! A [`Backend`] evaluates a [`Shader`] once per texel of a target buffer. All buffers
//! are flat arrays of `f32`, with [`PixelType::channels`] values per texel, and the
//! texel at address `i` holds the value for basis index `i`.

use num_complex::Complex;

use crate::{
    error::{Result, SimError},
    pool::Buffer,
};

pub mod cpu;
#[cfg(feature = "gpu")]
pub mod gpu;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PixelType {
    /// Masks and probabilities.
    Float,
    /// Amplitudes, as `(re, im)`.
    Complex,
    /// Two complex values per texel, used for density terms.
    Quad,
}
impl PixelType {
    pub fn channels(self) -> usize {
        match self {
            PixelType::Float => 1,
            PixelType::Complex => 2,
            PixelType::Quad => 4,
        }
    }
}

/// The pool bucket a buffer belongs to.
///
/// An `order` of `None` stands for a buffer with no texels at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferShape {
    order: Option<u32>,
    pixel_type: PixelType,
}
impl BufferShape {
    pub fn new(order: u32, pixel_type: PixelType) -> Self {
        BufferShape {
            order: Some(order),
            pixel_type,
        }
    }

    pub fn degenerate(pixel_type: PixelType) -> Self {
        BufferShape {
            order: None,
            pixel_type,
        }
    }

    /// The smallest shape holding at least `texels` texels.
    pub fn for_capacity(texels: usize, pixel_type: PixelType) -> Self {
        if texels == 0 {
            return Self::degenerate(pixel_type);
        }
        Self::new(texels.next_power_of_two().trailing_zeros(), pixel_type)
    }

    pub fn order(&self) -> Option<u32> {
        self.order
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn is_degenerate(&self) -> bool {
        self.order.is_none()
    }

    pub fn texel_count(&self) -> usize {
        self.order.map_or(0, |o| 1 << o)
    }

    pub fn float_count(&self) -> usize {
        self.texel_count() * self.pixel_type.channels()
    }

    /// The width of the 2D layout, `x = i % width`.
    pub fn width(&self) -> usize {
        self.order.map_or(0, |o| 1 << o.div_ceil(2))
    }

    pub fn height(&self) -> usize {
        self.order.map_or(0, |o| 1 << (o / 2))
    }

    pub fn with_pixel_type(&self, pixel_type: PixelType) -> Self {
        BufferShape { pixel_type, ..*self }
    }
}

/// What a [`Shader::Ket`] does to the sub-block of `span` wires starting at its row.
#[derive(Debug, Clone, PartialEq)]
pub enum KetKind {
    /// Row-major `2^span x 2^span` coefficients.
    Matrix {
        span: u32,
        coefficients: Vec<Complex<f32>>,
    },
    /// `sources[k]` is the sub-block value whose amplitude moves to `k`.
    Permutation { span: u32, sources: Vec<u32> },
    /// Multiplies sub-block value `k` by `factors[k]`.
    Phase {
        span: u32,
        factors: Vec<Complex<f32>>,
    },
    /// Adds `sign` times the value of another wire range to the sub-block, modulo `2^span`.
    Offset {
        span: u32,
        input_offset: u32,
        input_length: u32,
        sign: i32,
    },
}
impl KetKind {
    pub fn span(&self) -> u32 {
        match self {
            KetKind::Matrix { span, .. }
            | KetKind::Permutation { span, .. }
            | KetKind::Phase { span, .. }
            | KetKind::Offset { span, .. } => *span,
        }
    }
}

/// The vocabulary of per-texel programs.
///
/// Shaders that transform a state read it as the implicit input passed beside the
/// shader to [`Backend::render`]. Any other buffer they need is borrowed here.
pub enum Shader<'a, B: Backend> {
    /// Every texel gets the first `channels` values.
    Uniform([f32; 4]),
    /// A one in the first channel at `index`, zero elsewhere.
    Basis { index: u64 },
    /// 1.0 where bit `bit` of the texel address equals `desired`, else 0.0.
    ControlBit { bit: u32, desired: bool },
    /// Pointwise product of the input and `other`.
    Product { other: &'a Buffer<B> },
    /// A ket operation on the input, applied only where `control` is set.
    Ket {
        control: &'a Buffer<B>,
        row: u32,
        kind: KetKind,
    },
    /// Exchanges two wires of the input where `control` is set.
    Swap {
        control: &'a Buffer<B>,
        bit_a: u32,
        bit_b: u32,
    },
    /// Products `a_r * conj(a_c)` of the `span` wires at `row`, grouped by the other wires.
    DensityTerms {
        control: &'a Buffer<B>,
        row: u32,
        span: u32,
    },
    /// Probabilities (or amplitudes) with the `span` wires at `row` moved to the lowest bits.
    ProbabilityTerms {
        control: &'a Buffer<B>,
        row: u32,
        span: u32,
        amplitudes: bool,
    },
    /// Adds the upper half of the input onto its lower half.
    FoldSum,
}

impl<B: Backend> Shader<'_, B> {
    pub fn name(&self) -> &'static str {
        match self {
            Shader::Uniform(_) => "uniform",
            Shader::Basis { .. } => "basis",
            Shader::ControlBit { .. } => "control bit",
            Shader::Product { .. } => "product",
            Shader::Ket { .. } => "ket",
            Shader::Swap { .. } => "swap",
            Shader::DensityTerms { .. } => "density terms",
            Shader::ProbabilityTerms { .. } => "probability terms",
            Shader::FoldSum => "fold sum",
        }
    }

    /// Checks the shapes of the input, the borrowed buffers and the target against each other.
    pub fn validate(&self, input: Option<BufferShape>, target: BufferShape) -> Result<()> {
        let name = self.name();
        if target.is_degenerate() {
            return Err(SimError::ZeroSizeBuffer("rendered into"));
        }
        let input_shape = || input.ok_or(SimError::MissingInput(name));
        match self {
            Shader::Uniform(_) | Shader::Basis { .. } => Ok(()),
            Shader::ControlBit { .. } => expect_pixel_type(name, target, PixelType::Float),
            Shader::Product { other } => {
                let input = input_shape()?;
                expect_pixel_type(name, target, PixelType::Float)?;
                expect_shape(name, target, input)?;
                expect_shape(name, target, other.shape())
            }
            Shader::Ket {
                control, row, kind, ..
            } => {
                let input = input_shape()?;
                expect_pixel_type(name, target, PixelType::Complex)?;
                expect_shape(name, target, input)?;
                expect_control(name, target, control)?;
                if let KetKind::Offset {
                    input_offset,
                    input_length,
                    ..
                } = kind
                {
                    expect_range(name, target, *input_offset, *input_length)?;
                }
                expect_range(name, target, *row, kind.span())
            }
            Shader::Swap {
                control,
                bit_a,
                bit_b,
            } => {
                let input = input_shape()?;
                expect_pixel_type(name, target, PixelType::Complex)?;
                expect_shape(name, target, input)?;
                expect_control(name, target, control)?;
                expect_range(name, target, *bit_a, 1)?;
                expect_range(name, target, *bit_b, 1)
            }
            Shader::DensityTerms { control, row, span } => {
                let input = input_shape()?;
                expect_pixel_type(name, input, PixelType::Complex)?;
                expect_pixel_type(name, target, PixelType::Quad)?;
                expect_range(name, input, *row, *span)?;
                expect_control(name, input, control)?;
                let n = order_of(input);
                let expected = n - span + (2 * span - 1);
                expect_order(name, target, expected)
            }
            Shader::ProbabilityTerms {
                control,
                row,
                span,
                amplitudes,
            } => {
                let input = input_shape()?;
                expect_pixel_type(name, input, PixelType::Complex)?;
                let pixel_type = if *amplitudes {
                    PixelType::Complex
                } else {
                    PixelType::Float
                };
                expect_pixel_type(name, target, pixel_type)?;
                expect_range(name, input, *row, *span)?;
                expect_control(name, input, control)?;
                expect_order(name, target, order_of(input))
            }
            Shader::FoldSum => {
                let input = input_shape()?;
                expect_pixel_type(name, target, input.pixel_type())?;
                let n = order_of(input);
                if n == 0 {
                    return Err(SimError::dimension_mismatch(name, 2, 1));
                }
                expect_order(name, target, n - 1)
            }
        }
    }
}

fn order_of(shape: BufferShape) -> u32 {
    shape.order().unwrap_or(0)
}

fn expect_pixel_type(context: &'static str, shape: BufferShape, expected: PixelType) -> Result<()> {
    if shape.pixel_type() != expected {
        return Err(SimError::PixelTypeMismatch {
            context,
            expected,
            actual: shape.pixel_type(),
        });
    }
    Ok(())
}

fn expect_order(context: &'static str, shape: BufferShape, expected: u32) -> Result<()> {
    if shape.order() != Some(expected) {
        return Err(SimError::dimension_mismatch(
            context,
            1 << expected,
            shape.texel_count(),
        ));
    }
    Ok(())
}

fn expect_shape(context: &'static str, target: BufferShape, other: BufferShape) -> Result<()> {
    if other.is_degenerate() {
        return Err(SimError::ZeroSizeBuffer("used as shader input"));
    }
    expect_pixel_type(context, other, target.pixel_type())?;
    if other.order() != target.order() {
        return Err(SimError::dimension_mismatch(
            context,
            target.texel_count(),
            other.texel_count(),
        ));
    }
    Ok(())
}

fn expect_control<B: Backend>(
    context: &'static str,
    target: BufferShape,
    control: &Buffer<B>,
) -> Result<()> {
    expect_shape(context, target.with_pixel_type(PixelType::Float), control.shape())
}

fn expect_range(context: &'static str, shape: BufferShape, row: u32, span: u32) -> Result<()> {
    let order = order_of(shape);
    if span == 0 || row + span > order {
        return Err(SimError::dimension_mismatch(
            context,
            order as usize,
            (row + span) as usize,
        ));
    }
    Ok(())
}

/// A device that can hold buffers and run shaders over them.
pub trait Backend: Sized {
    type Storage;

    fn name(&self) -> &'static str;

    /// A fresh buffer of `shape`. Its contents are unspecified.
    fn allocate(&self, shape: BufferShape) -> Result<Self::Storage>;

    /// Evaluates `shader` once per texel of `target`.
    ///
    /// The caller has already validated the shapes, so `input` is present whenever the
    /// shader reads one.
    fn render(
        &self,
        shader: &Shader<'_, Self>,
        input: Option<&Self::Storage>,
        shape: BufferShape,
        target: &mut Self::Storage,
    ) -> Result<()>;

    fn read_pixels(&self, storage: &Self::Storage, shape: BufferShape) -> Result<Vec<f32>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_layout() {
        let shape = BufferShape::new(5, PixelType::Complex);
        assert_eq!(shape.texel_count(), 32);
        assert_eq!(shape.float_count(), 64);
        assert_eq!(shape.width(), 8);
        assert_eq!(shape.height(), 4);

        let shape = BufferShape::new(0, PixelType::Quad);
        assert_eq!(shape.texel_count(), 1);
        assert_eq!((shape.width(), shape.height()), (1, 1));

        let shape = BufferShape::degenerate(PixelType::Float);
        assert!(shape.is_degenerate());
        assert_eq!(shape.texel_count(), 0);
        assert_eq!(shape.width(), 0);
    }

    #[test]
    fn capacity_rounds_up() {
        assert_eq!(
            BufferShape::for_capacity(5, PixelType::Float),
            BufferShape::new(3, PixelType::Float)
        );
        assert_eq!(
            BufferShape::for_capacity(8, PixelType::Float),
            BufferShape::new(3, PixelType::Float)
        );
        assert_eq!(
            BufferShape::for_capacity(1, PixelType::Float),
            BufferShape::new(0, PixelType::Float)
        );
        assert!(BufferShape::for_capacity(0, PixelType::Float).is_degenerate());
    }

    #[test]
    fn kind_span() {
        let kind = KetKind::Permutation {
            span: 2,
            sources: vec![1, 0, 3, 2],
        };
        assert_eq!(kind.span(), 2);
    }
}
