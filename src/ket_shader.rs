//! Turning gate effects into [`KetKind`] operations and applying them to a state.

use num_complex::Complex;

use crate::{
    backend::{Backend, KetKind, Shader},
    context::EvalContext,
    error::{Result, SimError},
    matrix::{Matrix, DEFAULT_EPSILON},
    pool::{Buffer, BufferPool},
};

/// Classifies `matrix` into the cheapest kind of ket operation that reproduces it.
pub fn matrix_operation(matrix: &Matrix, max_span: u32) -> Result<KetKind> {
    let span = matrix
        .qubit_span()
        .ok_or(SimError::NotPowerOfTwo(matrix.width().max(matrix.height())))?;
    if span == 0 {
        return Err(SimError::matrix("a ket operation must span at least one qubit"));
    }
    if let Some(sources) = matrix.permutation_sources(DEFAULT_EPSILON) {
        return Ok(KetKind::Permutation { span, sources });
    }
    if let Some(factors) = matrix.phase_factors(DEFAULT_EPSILON) {
        return Ok(KetKind::Phase {
            span,
            factors: factors.into_iter().map(to_f32).collect(),
        });
    }
    if span > max_span {
        return Err(SimError::TooExpensive {
            span,
            max: max_span,
        });
    }
    Ok(KetKind::Matrix {
        span,
        coefficients: matrix.entries().iter().copied().map(to_f32).collect(),
    })
}

/// A permutation of the `2^span` sub-block values, given by where each value goes.
pub fn permutation_operation(span: u32, forward: impl Fn(u32) -> u32) -> Result<KetKind> {
    let size = 1u32 << span;
    let mut sources = vec![None; size as usize];
    for k in 0..size {
        let target = forward(k);
        if target >= size {
            return Err(SimError::NotABijection {
                span,
                reason: format!("{k} maps to {target}, outside of 0..{size}"),
            });
        }
        if let Some(other) = sources[target as usize].replace(k) {
            return Err(SimError::NotABijection {
                span,
                reason: format!("both {other} and {k} map to {target}"),
            });
        }
    }
    Ok(KetKind::Permutation {
        span,
        // Every slot is filled, `size` values went into `size` distinct slots.
        sources: sources.into_iter().flatten().collect(),
    })
}

/// Multiplies each sub-block value `k` by `phase(k)`, which must have unit magnitude.
pub fn phase_operation(span: u32, phase: impl Fn(u32) -> Complex<f64>) -> Result<KetKind> {
    let factors: Vec<Complex<f32>> = (0..1u32 << span)
        .map(|k| {
            let factor = phase(k);
            if (factor.norm() - 1.0).abs() > 1e-6 {
                return Err(SimError::matrix(format!(
                    "phase factor {factor} for {k} does not have unit magnitude"
                )));
            }
            Ok(to_f32(factor))
        })
        .collect::<Result<_>>()?;
    Ok(KetKind::Phase { span, factors })
}

/// Adds `sign` times the value of the wires `input` onto the sub-block.
pub fn offset_operation(span: u32, input: (u32, u32), sign: i32) -> KetKind {
    let (input_offset, input_length) = input;
    KetKind::Offset {
        span,
        input_offset,
        input_length,
        sign,
    }
}

/// Applies `kind` to `state` at `ctx.row`, wherever `ctx.controls_texture` is set.
pub fn apply_ket<B: Backend>(
    pool: &mut BufferPool<B>,
    ctx: &EvalContext<'_, B>,
    state: Buffer<B>,
    kind: KetKind,
) -> Result<Buffer<B>> {
    let shader = Shader::Ket {
        control: ctx.controls_texture,
        row: ctx.row,
        kind,
    };
    pool.trade(state, &shader)
}

fn to_f32(c: Complex<f64>) -> Complex<f32> {
    Complex::new(c.re as f32, c.im as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{cpu::CpuBackend, BufferShape, PixelType},
        context::CustomContext,
        controls::Controls,
    };

    #[test]
    fn classification() {
        assert!(matches!(
            matrix_operation(&Matrix::pauli_x(), 4),
            Ok(KetKind::Permutation { span: 1, ref sources }) if sources == &[1, 0]
        ));
        assert!(matches!(
            matrix_operation(&Matrix::pauli_z(), 4),
            Ok(KetKind::Phase { span: 1, .. })
        ));
        assert!(matches!(
            matrix_operation(&Matrix::hadamard(), 4),
            Ok(KetKind::Matrix { span: 1, .. })
        ));
        let big = Matrix::hadamard();
        let big = big.tensor_product(&big).tensor_product(&big);
        assert_eq!(
            matrix_operation(&big, 2),
            Err(SimError::TooExpensive { span: 3, max: 2 })
        );
        // Cheap kinds are allowed past the cap.
        let x3 = Matrix::pauli_x().tensor_product(&Matrix::pauli_x());
        assert!(matrix_operation(&x3, 1).is_ok());

        let not_square = Matrix::zero(2, 4);
        assert!(matches!(
            matrix_operation(&not_square, 4),
            Err(SimError::NotPowerOfTwo(4))
        ));
    }

    #[test]
    fn permutation_inverts_forward_map() {
        let kind = permutation_operation(2, |k| (k + 1) % 4).unwrap();
        assert_eq!(
            kind,
            KetKind::Permutation {
                span: 2,
                sources: vec![3, 0, 1, 2]
            }
        );

        assert!(matches!(
            permutation_operation(2, |k| k / 2),
            Err(SimError::NotABijection { span: 2, .. })
        ));
        assert!(matches!(
            permutation_operation(1, |k| k + 1),
            Err(SimError::NotABijection { .. })
        ));
    }

    #[test]
    fn phases_must_be_unit() {
        assert!(phase_operation(1, |k| Complex::from_polar(1.0, k as f64)).is_ok());
        assert!(phase_operation(1, |_| Complex::new(0.5, 0.0)).is_err());
    }

    #[test]
    fn controlled_matrix_leaves_blocked_amplitudes_untouched() {
        let mut pool = BufferPool::new(CpuBackend::new(2).unwrap(), 16);
        let shape = BufferShape::new(2, PixelType::Complex);
        let state = pool
            .render_new(shape, &Shader::Uniform([0.5, 0.0, 0.0, 0.0]), None)
            .unwrap();
        let mask = crate::mask::render_controls_mask(&mut pool, Controls::bit(1, true), 2).unwrap();
        let custom_context = CustomContext::new();
        let ctx = EvalContext {
            time: 0.0,
            row: 0,
            wire_count: 2,
            controls: Controls::bit(1, true),
            controls_texture: &mask,
            custom_context: &custom_context,
        };
        let kind = matrix_operation(&Matrix::hadamard(), 4).unwrap();
        let state = apply_ket(&mut pool, &ctx, state, kind).unwrap();
        let pixels = pool.read_pixels(&state).unwrap();
        // Wire 1 clear: untouched.
        assert_eq!(&pixels[0..4], &[0.5, 0.0, 0.5, 0.0]);
        // Wire 1 set: H(|0> + |1>)/2 = |0>/sqrt(2).
        assert!((pixels[4] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!(pixels[6].abs() < 1e-6);
        pool.deposit(state);
        pool.deposit(mask);
        assert_eq!(pool.outstanding(), 0);
    }
}
