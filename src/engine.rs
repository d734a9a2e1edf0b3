use num_complex::Complex;
use tracing::{debug, error};

#[cfg(feature = "gpu")]
use crate::backend::gpu::GpuBackend;
use crate::{
    backend::{cpu::CpuBackend, Backend, BufferShape, PixelType, Shader},
    circuit::Circuit,
    compute::advance_state,
    context::{CustomContext, EvalContext},
    controls::Controls,
    error::{Result, SimError},
    mask::render_controls_mask,
    pool::{Buffer, BufferPool},
    stats::{decohere, density_matrix, CircuitStats, StatsCollector},
};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Dense matrices spanning more qubits than this are rejected.
    /// Permutations and phases are not limited.
    pub max_matrix_span: u32,
    /// Outstanding pool buffers above which a leak warning is logged.
    pub leak_warning_threshold: usize,
    /// Worker threads of the CPU backend.
    pub threads: usize,
    pub max_wire_count: u32,
}
impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_matrix_span: 4,
            leak_warning_threshold: 1000,
            threads: num_cpus::get(),
            max_wire_count: 20,
        }
    }
}

/// Owns a backend, its buffer pool and everything compiled for it.
pub struct Engine<B: Backend> {
    pool: BufferPool<B>,
    config: EngineConfig,
}

impl Engine<CpuBackend> {
    pub fn cpu() -> Result<Self> {
        Self::cpu_with_config(EngineConfig::default())
    }

    pub fn cpu_with_config(config: EngineConfig) -> Result<Self> {
        let backend = CpuBackend::new(config.threads)?;
        Ok(Self::new(backend, config))
    }
}

#[cfg(feature = "gpu")]
impl Engine<GpuBackend> {
    pub fn gpu() -> Result<Self> {
        Self::gpu_with_config(EngineConfig::default())
    }

    pub fn gpu_with_config(config: EngineConfig) -> Result<Self> {
        let backend = pollster::block_on(GpuBackend::new())?;
        Ok(Self::new(backend, config))
    }
}

impl<B: Backend> Engine<B> {
    pub fn new(backend: B, config: EngineConfig) -> Self {
        let pool = BufferPool::new(backend, config.leak_warning_threshold);
        Engine { pool, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &BufferPool<B> {
        &self.pool
    }

    /// Evaluates `circuit` at `time`, substituting [`CircuitStats::nan`] if anything fails.
    pub fn circuit_stats(&mut self, circuit: &Circuit, time: f64) -> CircuitStats {
        match self.try_circuit_stats(circuit, time) {
            Ok(stats) => stats,
            Err(error) => {
                error!(
                    %error,
                    wires = circuit.wire_count(),
                    cols = circuit.num_cols(),
                    time,
                    "Circuit evaluation failed"
                );
                CircuitStats::nan(
                    circuit.wire_count(),
                    circuit.num_cols(),
                    time,
                    self.config.max_wire_count,
                )
            }
        }
    }

    pub fn try_circuit_stats(&mut self, circuit: &Circuit, time: f64) -> Result<CircuitStats> {
        let mut collector = StatsCollector::new(circuit.wire_count(), circuit.num_cols());
        let final_state = self.evaluate(circuit, time, Some(&mut collector))?;
        Ok(collector.finish(circuit.wire_count(), time, final_state))
    }

    /// The amplitudes after the last column, without any statistics.
    pub fn final_state(&mut self, circuit: &Circuit, time: f64) -> Result<Vec<Complex<f32>>> {
        self.evaluate(circuit, time, None)
    }

    fn evaluate(
        &mut self,
        circuit: &Circuit,
        time: f64,
        mut stats: Option<&mut StatsCollector>,
    ) -> Result<Vec<Complex<f32>>> {
        let wire_count = circuit.wire_count();
        if wire_count > self.config.max_wire_count {
            return Err(SimError::TooManyWires {
                wires: wire_count,
                max: self.config.max_wire_count,
            });
        }
        let pool = &mut self.pool;
        let shape = BufferShape::new(wire_count, PixelType::Complex);
        let state = pool.render_new(shape, &Shader::Basis { index: 0 }, None)?;
        let mask = match render_controls_mask(pool, Controls::NONE, wire_count) {
            Ok(mask) => mask,
            Err(e) => {
                pool.deposit(state);
                return Err(e);
            }
        };

        let custom_context = CustomContext::new();
        let ctx = EvalContext {
            time,
            row: 0,
            wire_count,
            controls: Controls::NONE,
            controls_texture: &mask,
            custom_context: &custom_context,
        };
        let result = advance_state(pool, &self.config, &ctx, circuit, state, stats.as_deref_mut())
            .and_then(|state| {
                let read = finish(pool, circuit, &state, &mask, stats);
                pool.deposit(state);
                read
            });
        pool.deposit(mask);
        debug!(
            outstanding = pool.outstanding(),
            allocations = pool.allocations(),
            reuses = pool.reuses(),
            "Finished circuit evaluation"
        );
        result
    }
}

/// Records the uncontrolled per-wire densities of the final state and reads it back.
fn finish<B: Backend>(
    pool: &mut BufferPool<B>,
    circuit: &Circuit,
    state: &Buffer<B>,
    all_ones: &Buffer<B>,
    stats: Option<&mut StatsCollector>,
) -> Result<Vec<Complex<f32>>> {
    if let Some(stats) = stats {
        let col = circuit.num_cols();
        let measured = circuit.col_is_measured_mask(col);
        for wire in 0..circuit.wire_count() {
            let raw = density_matrix(pool, state, all_ones, wire, 1)?;
            stats.set_qubit_density(col, wire, decohere(&raw, (measured >> wire) & 1));
        }
    }
    let pixels = pool.read_pixels(state)?;
    Ok(pixels
        .chunks_exact(2)
        .map(|c| Complex::new(c[0], c[1]))
        .collect())
}

/// Evaluates `circuit` at `time` on a fresh CPU engine.
pub fn simulate_circuit(circuit: &Circuit, time: f64) -> CircuitStats {
    match Engine::cpu() {
        Ok(mut engine) => engine.circuit_stats(circuit, time),
        Err(error) => {
            error!(%error, "Failed to create CPU engine");
            CircuitStats::nan(
                circuit.wire_count(),
                circuit.num_cols(),
                time,
                EngineConfig::default().max_wire_count,
            )
        }
    }
}
