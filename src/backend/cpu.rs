use num_complex::Complex;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use super::{Backend, BufferShape, KetKind, Shader};
use crate::error::{Result, SimError};

/// Evaluates shaders texel-by-texel on its own rayon pool.
pub struct CpuBackend {
    threads: ThreadPool,
}
impl CpuBackend {
    pub fn new(threads: usize) -> Result<Self> {
        let threads = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ketflow-cpu-{i}"))
            .build()
            .map_err(|e| SimError::ThreadPool(e.to_string()))?;
        debug!(threads = threads.current_num_threads(), "Created CPU backend");
        Ok(CpuBackend { threads })
    }
}

impl Backend for CpuBackend {
    type Storage = Vec<f32>;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn allocate(&self, shape: BufferShape) -> Result<Vec<f32>> {
        Ok(vec![0.0; shape.float_count()])
    }

    fn render(
        &self,
        shader: &Shader<'_, Self>,
        input: Option<&Vec<f32>>,
        shape: BufferShape,
        target: &mut Vec<f32>,
    ) -> Result<()> {
        let program = Program::resolve(shader, input.map(Vec::as_slice), shape)?;
        let channels = shape.pixel_type().channels();
        self.threads.install(|| {
            target
                .par_chunks_mut(channels)
                .enumerate()
                .for_each(|(t, out)| program.shade(t, out));
        });
        Ok(())
    }

    fn read_pixels(&self, storage: &Vec<f32>, shape: BufferShape) -> Result<Vec<f32>> {
        if storage.len() != shape.float_count() {
            return Err(SimError::dimension_mismatch(
                "read pixels",
                shape.float_count(),
                storage.len(),
            ));
        }
        Ok(storage.clone())
    }
}

/// A shader with every buffer it touches resolved to a plain slice.
enum Program<'r> {
    Uniform([f32; 4]),
    Basis(u64),
    ControlBit {
        bit: u32,
        desired: bool,
    },
    Product {
        input: &'r [f32],
        other: &'r [f32],
    },
    Ket {
        input: &'r [f32],
        control: &'r [f32],
        row: u32,
        kind: &'r KetKind,
    },
    Swap {
        input: &'r [f32],
        control: &'r [f32],
        bit_a: u32,
        bit_b: u32,
    },
    DensityTerms {
        input: &'r [f32],
        control: &'r [f32],
        row: u32,
        span: u32,
    },
    ProbabilityTerms {
        input: &'r [f32],
        control: &'r [f32],
        row: u32,
        span: u32,
        amplitudes: bool,
    },
    FoldSum {
        input: &'r [f32],
        half: usize,
    },
}

impl<'r> Program<'r> {
    fn resolve(
        shader: &'r Shader<'_, CpuBackend>,
        input: Option<&'r [f32]>,
        shape: BufferShape,
    ) -> Result<Self> {
        let input = || input.ok_or(SimError::MissingInput(shader.name()));
        Ok(match shader {
            Shader::Uniform(value) => Program::Uniform(*value),
            Shader::Basis { index } => Program::Basis(*index),
            Shader::ControlBit { bit, desired } => Program::ControlBit {
                bit: *bit,
                desired: *desired,
            },
            Shader::Product { other } => Program::Product {
                input: input()?,
                other: other.storage()?,
            },
            Shader::Ket { control, row, kind } => Program::Ket {
                input: input()?,
                control: control.storage()?,
                row: *row,
                kind,
            },
            Shader::Swap {
                control,
                bit_a,
                bit_b,
            } => Program::Swap {
                input: input()?,
                control: control.storage()?,
                bit_a: *bit_a,
                bit_b: *bit_b,
            },
            Shader::DensityTerms { control, row, span } => Program::DensityTerms {
                input: input()?,
                control: control.storage()?,
                row: *row,
                span: *span,
            },
            Shader::ProbabilityTerms {
                control,
                row,
                span,
                amplitudes,
            } => Program::ProbabilityTerms {
                input: input()?,
                control: control.storage()?,
                row: *row,
                span: *span,
                amplitudes: *amplitudes,
            },
            Shader::FoldSum => Program::FoldSum {
                input: input()?,
                half: shape.texel_count(),
            },
        })
    }

    /// Writes texel `t` into `out`.
    fn shade(&self, t: usize, out: &mut [f32]) {
        match *self {
            Program::Uniform(value) => out.copy_from_slice(&value[..out.len()]),
            Program::Basis(index) => {
                out.fill(0.0);
                if t as u64 == index {
                    out[0] = 1.0;
                }
            }
            Program::ControlBit { bit, desired } => {
                out[0] = if ((t >> bit) & 1 == 1) == desired {
                    1.0
                } else {
                    0.0
                };
            }
            Program::Product { input, other } => out[0] = input[t] * other[t],
            Program::Ket {
                input,
                control,
                row,
                kind,
            } => {
                if control[t] == 0.0 {
                    out.copy_from_slice(&input[2 * t..2 * t + 2]);
                } else {
                    write_amp(out, 0, ket_value(input, t, row, kind));
                }
            }
            Program::Swap {
                input,
                control,
                bit_a,
                bit_b,
            } => {
                let differ = ((t >> bit_a) ^ (t >> bit_b)) & 1 == 1;
                let source = if control[t] != 0.0 && differ {
                    t ^ ((1 << bit_a) | (1 << bit_b))
                } else {
                    t
                };
                out.copy_from_slice(&input[2 * source..2 * source + 2]);
            }
            Program::DensityTerms {
                input,
                control,
                row,
                span,
            } => {
                let piece_bits = 2 * span - 1;
                let piece = t & ((1 << piece_bits) - 1);
                let base = insert_zero_bits(t >> piece_bits, row, span);
                let span_mask = (1 << span) - 1;
                for h in 0..2 {
                    let e = 2 * piece + h;
                    let r = base | ((e >> span) << row);
                    let c = base | ((e & span_mask) << row);
                    let a_r = amp(input, r) * control[r];
                    let a_c = amp(input, c) * control[c];
                    write_amp(out, h, a_r * a_c.conj());
                }
            }
            Program::ProbabilityTerms {
                input,
                control,
                row,
                span,
                amplitudes,
            } => {
                let k = t & ((1 << span) - 1);
                let i = insert_zero_bits(t >> span, row, span) | (k << row);
                let a = amp(input, i) * control[i];
                if amplitudes {
                    write_amp(out, 0, a);
                } else {
                    out[0] = a.norm_sqr();
                }
            }
            Program::FoldSum { input, half } => {
                let channels = out.len();
                for (c, value) in out.iter_mut().enumerate() {
                    *value = input[t * channels + c] + input[(t + half) * channels + c];
                }
            }
        }
    }
}

fn ket_value(input: &[f32], i: usize, row: u32, kind: &KetKind) -> Complex<f32> {
    let span = kind.span();
    let size = 1usize << span;
    let mask = size - 1;
    let k = (i >> row) & mask;
    let base = i & !(mask << row);
    let at = |j: usize| amp(input, base | (j << row));
    match kind {
        KetKind::Matrix { coefficients, .. } if span == 1 => {
            coefficients[2 * k] * at(0) + coefficients[2 * k + 1] * at(1)
        }
        KetKind::Matrix { coefficients, .. } => (0..size)
            .map(|j| coefficients[k * size + j] * at(j))
            .sum(),
        KetKind::Permutation { sources, .. } => at(sources[k] as usize),
        KetKind::Phase { factors, .. } => factors[k] * amp(input, i),
        KetKind::Offset {
            input_offset,
            input_length,
            sign,
            ..
        } => {
            let a = (i >> input_offset) & ((1 << input_length) - 1);
            let shift = a & mask;
            let source = if *sign >= 0 {
                (k + size - shift) & mask
            } else {
                (k + shift) & mask
            };
            at(source)
        }
    }
}

fn amp(input: &[f32], i: usize) -> Complex<f32> {
    Complex::new(input[2 * i], input[2 * i + 1])
}

fn write_amp(out: &mut [f32], slot: usize, value: Complex<f32>) {
    out[2 * slot] = value.re;
    out[2 * slot + 1] = value.im;
}

/// Spreads `value` apart, opening a gap of `count` zero bits at `position`.
pub(crate) fn insert_zero_bits(value: usize, position: u32, count: u32) -> usize {
    let low = value & ((1 << position) - 1);
    let high = value >> position;
    low | (high << (position + count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PixelType;

    fn render_plain(
        shader: &Shader<'_, CpuBackend>,
        input: Option<&Vec<f32>>,
        shape: BufferShape,
    ) -> Vec<f32> {
        let backend = CpuBackend::new(2).unwrap();
        let mut target = backend.allocate(shape).unwrap();
        backend.render(shader, input, shape, &mut target).unwrap();
        backend.read_pixels(&target, shape).unwrap()
    }

    #[test]
    fn gap_insertion() {
        assert_eq!(insert_zero_bits(0b1011, 1, 2), 0b101001);
        assert_eq!(insert_zero_bits(0b11, 0, 1), 0b110);
        assert_eq!(insert_zero_bits(0b11, 2, 3), 0b11);
    }

    #[test]
    fn uniform_and_basis() {
        let shape = BufferShape::new(2, PixelType::Complex);
        let out = render_plain(&Shader::Uniform([0.5, -1.0, 9.0, 9.0]), None, shape);
        assert_eq!(out, [0.5, -1.0].repeat(4));

        let out = render_plain(&Shader::Basis { index: 2 }, None, shape);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn control_bit() {
        let shape = BufferShape::new(3, PixelType::Float);
        let out = render_plain(
            &Shader::ControlBit {
                bit: 1,
                desired: true,
            },
            None,
            shape,
        );
        assert_eq!(out, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn fold_sum_halves() {
        let input = vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0];
        let out = render_plain(
            &Shader::FoldSum,
            Some(&input),
            BufferShape::new(1, PixelType::Complex),
        );
        assert_eq!(out, vec![11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn missing_input() {
        let backend = CpuBackend::new(1).unwrap();
        let shape = BufferShape::new(1, PixelType::Float);
        let mut target = backend.allocate(shape).unwrap();
        assert_eq!(
            backend.render(&Shader::FoldSum, None, shape, &mut target),
            Err(SimError::MissingInput("fold sum"))
        );
    }

    #[test]
    fn offset_wraps_around() {
        // Sub-block of 2 wires at row 0, input A on wires 2..4.
        let kind = KetKind::Offset {
            span: 2,
            input_offset: 2,
            input_length: 2,
            sign: 1,
        };
        let mut input = vec![0.0; 32];
        // |A=3, k=2>
        input[2 * 0b1110] = 1.0;
        let control = vec![1.0; 16];
        let program = Program::Ket {
            input: &input,
            control: &control,
            row: 0,
            kind: &kind,
        };
        let mut out = [0.0; 2];
        // 2 + 3 = 1 (mod 4)
        program.shade(0b1101, &mut out);
        assert_eq!(out, [1.0, 0.0]);
        program.shade(0b1110, &mut out);
        assert_eq!(out, [0.0, 0.0]);
    }
}
