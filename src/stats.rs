use std::collections::BTreeMap;

use num_complex::Complex;

use crate::{
    backend::{Backend, BufferShape, PixelType, Shader},
    error::Result,
    gate::{StatMaker, StatValue},
    matrix::Matrix,
    pool::{Buffer, BufferPool, Trader},
};

/// Everything a circuit evaluation reports.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    wire_count: u32,
    num_cols: usize,
    time: f64,
    final_state: Vec<Complex<f32>>,
    /// `qubit_densities[col][wire]`, with one extra column for the final state.
    qubit_densities: Vec<Vec<Option<Matrix>>>,
    pair_densities: BTreeMap<(usize, u32), Matrix>,
    custom_stats: BTreeMap<(usize, u32), StatValue>,
    survival_rate: f64,
}

impl CircuitStats {
    /// The result reported when an evaluation fails: every number is NaN.
    ///
    /// The final state is empty for circuits wider than `max_state_wires`.
    pub fn nan(wire_count: u32, num_cols: usize, time: f64, max_state_wires: u32) -> Self {
        let nan = Complex::new(f32::NAN, f32::NAN);
        let state_len = if wire_count <= max_state_wires {
            1 << wire_count
        } else {
            0
        };
        CircuitStats {
            wire_count,
            num_cols,
            time,
            final_state: vec![nan; state_len],
            qubit_densities: vec![vec![None; wire_count as usize]; num_cols + 1],
            pair_densities: BTreeMap::new(),
            custom_stats: BTreeMap::new(),
            survival_rate: f64::NAN,
        }
    }

    pub fn wire_count(&self) -> u32 {
        self.wire_count
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// The amplitudes after the last column, indexed by basis state.
    pub fn final_state(&self) -> &[Complex<f32>] {
        &self.final_state
    }

    /// The trace-normalized density matrix of `wire` at `col`.
    ///
    /// Columns at or past [`Self::num_cols`] give the final state. Wires without a display
    /// in `col`, and columns whose controls are never satisfied, give a NaN matrix.
    pub fn qubit_density_matrix(&self, col: usize, wire: u32) -> Matrix {
        let col = col.min(self.num_cols);
        self.qubit_densities
            .get(col)
            .and_then(|wires| wires.get(wire as usize))
            .and_then(Option::as_ref)
            .map_or_else(|| nan_matrix(2), normalized)
    }

    pub fn bloch_vector(&self, col: usize, wire: u32) -> [f64; 3] {
        self.qubit_density_matrix(col, wire)
            .qubit_density_matrix_to_bloch_vector()
            .unwrap_or([f64::NAN; 3])
    }

    /// The trace-normalized density matrix of the wire pair displayed at `(col, row)`.
    pub fn pair_density_matrix(&self, col: usize, row: u32) -> Option<Matrix> {
        self.pair_densities.get(&(col, row)).map(normalized)
    }

    pub fn custom_stat(&self, col: usize, row: u32) -> Option<&StatValue> {
        self.custom_stats.get(&(col, row))
    }

    /// The norm of the final state; below one when post-selection discarded states.
    pub fn survival_rate(&self) -> f64 {
        self.survival_rate
    }
}

fn nan_matrix(size: usize) -> Matrix {
    Matrix::generate(size, size, |_, _| Complex::new(f64::NAN, f64::NAN))
}

fn normalized(m: &Matrix) -> Matrix {
    let trace = m.trace();
    if trace.norm() == 0.0 {
        return nan_matrix(m.width());
    }
    m.scaled_by(trace.inv())
}

/// Zeroes the coherence between values that differ on a measured wire.
///
/// `measured` holds one bit per wire of the density matrix, lowest wire first.
pub fn decohere(density: &Matrix, measured: u64) -> Matrix {
    Matrix::generate(density.width(), density.height(), |r, c| {
        if (r ^ c) as u64 & measured != 0 {
            Complex::new(0.0, 0.0)
        } else {
            density.get(r, c)
        }
    })
}

/// Accumulates the statistics of a running evaluation.
#[derive(Debug)]
pub(crate) struct StatsCollector {
    qubit_densities: Vec<Vec<Option<Matrix>>>,
    pair_densities: BTreeMap<(usize, u32), Matrix>,
    custom_stats: BTreeMap<(usize, u32), StatValue>,
}

impl StatsCollector {
    pub(crate) fn new(wire_count: u32, num_cols: usize) -> Self {
        StatsCollector {
            qubit_densities: vec![vec![None; wire_count as usize]; num_cols + 1],
            pair_densities: BTreeMap::new(),
            custom_stats: BTreeMap::new(),
        }
    }

    pub(crate) fn set_qubit_density(&mut self, col: usize, wire: u32, density: Matrix) {
        if let Some(slot) = self
            .qubit_densities
            .get_mut(col)
            .and_then(|wires| wires.get_mut(wire as usize))
        {
            *slot = Some(density);
        }
    }

    pub(crate) fn set_pair_density(&mut self, col: usize, row: u32, density: Matrix) {
        self.pair_densities.insert((col, row), density);
    }

    pub(crate) fn set_custom_stat(&mut self, col: usize, row: u32, value: StatValue) {
        self.custom_stats.insert((col, row), value);
    }

    pub(crate) fn finish(
        self,
        wire_count: u32,
        time: f64,
        final_state: Vec<Complex<f32>>,
    ) -> CircuitStats {
        let num_cols = self.qubit_densities.len() - 1;
        let survival_rate = self.qubit_densities[num_cols]
            .first()
            .and_then(Option::as_ref)
            .map_or(f64::NAN, |m| m.trace().re);
        CircuitStats {
            wire_count,
            num_cols,
            time,
            final_state,
            qubit_densities: self.qubit_densities,
            pair_densities: self.pair_densities,
            custom_stats: self.custom_stats,
            survival_rate,
        }
    }
}

/// The unnormalized density matrix of the `span` wires at `row`, counting only the basis
/// states allowed by `control`.
pub fn density_matrix<B: Backend>(
    pool: &mut BufferPool<B>,
    state: &Buffer<B>,
    control: &Buffer<B>,
    row: u32,
    span: u32,
) -> Result<Matrix> {
    let n = state.shape().order().unwrap_or(0);
    let piece_order = 2 * span - 1;
    let terms_order = (n.saturating_sub(span)) + piece_order;

    let mut trader = Trader::borrowed(state);
    trader.shade_and_trade(
        pool,
        BufferShape::new(terms_order, PixelType::Quad),
        &Shader::DensityTerms { control, row, span },
    )?;
    for order in (piece_order..terms_order).rev() {
        trader.shade_and_trade(pool, BufferShape::new(order, PixelType::Quad), &Shader::FoldSum)?;
    }
    let pixels = trader.read_and_release(pool)?;

    let size = 1usize << span;
    let entries = pixels
        .chunks_exact(2)
        .map(|c| Complex::new(c[0] as f64, c[1] as f64))
        .collect();
    Matrix::new(size, size, entries)
}

/// One value per basis state of the `span` wires at `row`, summed over the other wires.
pub fn custom_stat_terms<B: Backend>(
    pool: &mut BufferPool<B>,
    state: &Buffer<B>,
    control: &Buffer<B>,
    row: u32,
    span: u32,
    maker: StatMaker,
) -> Result<Vec<f32>> {
    let n = state.shape().order().unwrap_or(0);
    let (pixel_type, amplitudes) = match maker {
        StatMaker::Probabilities => (PixelType::Float, false),
        StatMaker::Amplitudes => (PixelType::Complex, true),
    };

    let mut trader = Trader::borrowed(state);
    trader.shade_and_trade(
        pool,
        BufferShape::new(n, pixel_type),
        &Shader::ProbabilityTerms {
            control,
            row,
            span,
            amplitudes,
        },
    )?;
    for order in (span..n).rev() {
        trader.shade_and_trade(pool, BufferShape::new(order, pixel_type), &Shader::FoldSum)?;
    }
    trader.read_and_release(pool)
}
