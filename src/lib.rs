//! Column-by-column simulation of quantum circuits over a render backend.
//!
//! The state of `n` wires is a buffer of `2^n` complex amplitudes. Each column of a
//! [`Circuit`] is evaluated by rendering a handful of per-texel [`Shader`]s into pooled
//! buffers, on the CPU or (with the `gpu` feature) through `wgpu` compute kernels.

pub use backend::{cpu::CpuBackend, Backend, BufferShape, KetKind, PixelType, Shader};
#[cfg(feature = "gpu")]
pub use backend::gpu::GpuBackend;
pub use circuit::{circuit_gate, Circuit, CircuitCreationError};
pub use context::{ContextValue, CustomContext, EvalContext, INPUT_RANGE_A};
pub use controls::Controls;
pub use engine::{simulate_circuit, Engine, EngineConfig};
pub use error::{Result, SimError};
pub use gate::{CustomStat, DisplayKind, Gate, GateEffect, StatMaker, StatValue};
pub use matrix::Matrix;
pub use pool::{Buffer, BufferPool, Trader};
pub use stats::CircuitStats;

pub mod backend;
pub mod circuit;
mod compute;
pub mod context;
pub mod controls;
pub mod engine;
pub mod error;
pub mod gate;
pub mod gates;
pub mod ket_shader;
pub mod mask;
pub mod matrix;
pub mod pool;
#[cfg(feature = "python")]
mod python;
pub mod stats;

#[cfg(feature = "python")]
pub use python::python_module;
