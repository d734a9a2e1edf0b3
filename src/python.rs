use num_complex::Complex;
use pyo3::{exceptions::PyValueError, prelude::*, wrap_pyfunction};

use crate::{circuit::Circuit, engine::simulate_circuit, gates, stats::CircuitStats, Matrix};

#[pyclass]
#[derive(Debug, Clone)]
#[pyo3(name = "Circuit")]
struct PyCircuit(Circuit);
#[pymethods]
impl PyCircuit {
    /// Builds a circuit from columns of gate symbols, one entry per wire starting at wire 0.
    /// Empty strings and `"…"` leave a wire empty.
    #[new]
    fn new(wire_count: u32, columns: Vec<Vec<String>>) -> PyResult<Self> {
        let mut placements = Vec::new();
        for (col, symbols) in columns.iter().enumerate() {
            for (row, symbol) in symbols.iter().enumerate() {
                if symbol.is_empty() || symbol == "…" {
                    continue;
                }
                let gate = gates::from_symbol(symbol).ok_or_else(|| {
                    PyErr::new::<PyValueError, _>(format!("Unknown gate symbol '{symbol}'"))
                })?;
                placements.push((col, row as u32, gate));
            }
        }
        match Circuit::new(wire_count, placements) {
            Ok(circuit) => Ok(PyCircuit(circuit)),
            Err(e) => Err(PyErr::new::<PyValueError, _>(e.to_string())),
        }
    }

    /// Create a random circuit of single-wire gates.
    #[staticmethod]
    fn random(wire_count: u32, num_cols: usize, seed: u64) -> Self {
        PyCircuit(Circuit::random(wire_count, num_cols, seed))
    }

    #[getter]
    fn wire_count(&self) -> u32 {
        self.0.wire_count()
    }

    #[getter]
    fn num_cols(&self) -> usize {
        self.0.num_cols()
    }

    /// The reason the gate at `(col, row)` is disabled, if it is.
    fn disabled_reason(&self, col: usize, row: u32) -> Option<&'static str> {
        self.0.gate_at_loc_is_disabled_reason(col, row)
    }
}

#[pyclass]
#[pyo3(name = "CircuitStats")]
struct PyCircuitStats(CircuitStats);
#[pymethods]
impl PyCircuitStats {
    #[getter]
    fn time(&self) -> f64 {
        self.0.time()
    }

    #[getter]
    fn survival_rate(&self) -> f64 {
        self.0.survival_rate()
    }

    #[getter]
    fn final_state(&self) -> Vec<Complex<f32>> {
        self.0.final_state().to_vec()
    }

    fn qubit_density_matrix(&self, col: usize, wire: u32) -> Vec<Vec<Complex<f64>>> {
        rows(&self.0.qubit_density_matrix(col, wire))
    }

    fn bloch_vector(&self, col: usize, wire: u32) -> [f64; 3] {
        self.0.bloch_vector(col, wire)
    }

    fn pair_density_matrix(&self, col: usize, row: u32) -> Option<Vec<Vec<Complex<f64>>>> {
        self.0.pair_density_matrix(col, row).as_ref().map(rows)
    }
}

fn rows(m: &Matrix) -> Vec<Vec<Complex<f64>>> {
    (0..m.height())
        .map(|r| (0..m.width()).map(|c| m.get(r, c)).collect())
        .collect()
}

#[pyfunction]
#[pyo3(name = "simulate_circuit", signature = (circuit, time = 0.0))]
fn py_simulate_circuit(circuit: &PyCircuit, time: f64) -> PyCircuitStats {
    PyCircuitStats(simulate_circuit(&circuit.0, time))
}

#[pymodule]
#[pyo3(name = "ketflow")]
pub fn python_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyCircuit>()?;
    m.add_class::<PyCircuitStats>()?;
    m.add_function(wrap_pyfunction!(py_simulate_circuit, m)?)?;
    Ok(())
}
