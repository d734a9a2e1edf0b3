use std::{f64::consts::FRAC_1_SQRT_2, fmt::Display};

use num_complex::Complex;
use num_traits::{One, Zero};

use crate::error::{Result, SimError};

/// Tolerance used when classifying gate matrices.
pub const DEFAULT_EPSILON: f64 = 1e-8;

/// A dense complex matrix stored in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    width: usize,
    height: usize,
    buffer: Vec<Complex<f64>>,
}

/// An eigenvalue together with its unit-length eigenvector.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenPair {
    pub value: Complex<f64>,
    pub vector: [Complex<f64>; 2],
}

/// `self = u * diag(singular_values) * v.adjoint()`
#[derive(Debug, Clone, PartialEq)]
pub struct SingularValueDecomposition {
    pub u: Matrix,
    pub singular_values: Vec<f64>,
    pub v: Matrix,
}

impl Matrix {
    pub fn new(width: usize, height: usize, buffer: Vec<Complex<f64>>) -> Result<Self> {
        if buffer.len() != width * height {
            return Err(SimError::dimension_mismatch(
                "matrix buffer",
                width * height,
                buffer.len(),
            ));
        }
        Ok(Matrix {
            width,
            height,
            buffer,
        })
    }

    pub fn generate(
        width: usize,
        height: usize,
        f: impl Fn(usize, usize) -> Complex<f64>,
    ) -> Self {
        let mut buffer = Vec::with_capacity(width * height);
        for row in 0..height {
            for col in 0..width {
                buffer.push(f(row, col));
            }
        }
        Matrix {
            width,
            height,
            buffer,
        }
    }

    pub fn zero(width: usize, height: usize) -> Self {
        Matrix {
            width,
            height,
            buffer: vec![Complex::zero(); width * height],
        }
    }

    pub fn identity(size: usize) -> Self {
        Self::generate(size, size, |r, c| {
            if r == c {
                Complex::one()
            } else {
                Complex::zero()
            }
        })
    }

    pub fn diagonal(entries: &[Complex<f64>]) -> Self {
        let n = entries.len();
        Self::generate(n, n, |r, c| if r == c { entries[r] } else { Complex::zero() })
    }

    /// A square matrix from its entries in row-major order.
    pub fn square(entries: &[Complex<f64>]) -> Result<Self> {
        let size = (entries.len() as f64).sqrt().round() as usize;
        if size * size != entries.len() {
            return Err(SimError::matrix(format!(
                "{} entries do not form a square matrix",
                entries.len()
            )));
        }
        Self::new(size, size, entries.to_vec())
    }

    /// A square matrix from real entries in row-major order.
    pub fn real_square(entries: &[f64]) -> Result<Self> {
        let entries: Vec<Complex<f64>> = entries.iter().map(|&e| Complex::new(e, 0.0)).collect();
        Self::square(&entries)
    }

    pub fn from_rows(rows: Vec<Vec<Complex<f64>>>) -> Result<Self> {
        let height = rows.len();
        let width = rows.first().map_or(0, Vec::len);
        let mut buffer = Vec::with_capacity(width * height);
        for row in rows {
            if row.len() != width {
                return Err(SimError::dimension_mismatch("matrix row", width, row.len()));
            }
            buffer.extend(row);
        }
        Self::new(width, height, buffer)
    }

    pub fn pauli_x() -> Self {
        Self::generate(2, 2, |r, c| {
            if r != c {
                Complex::one()
            } else {
                Complex::zero()
            }
        })
    }

    pub fn pauli_y() -> Self {
        Matrix {
            width: 2,
            height: 2,
            buffer: vec![
                Complex::zero(),
                Complex::new(0.0, -1.0),
                Complex::new(0.0, 1.0),
                Complex::zero(),
            ],
        }
    }

    pub fn pauli_z() -> Self {
        Self::diagonal(&[Complex::one(), -Complex::one()])
    }

    pub fn hadamard() -> Self {
        Self::generate(2, 2, |r, c| {
            if r == 1 && c == 1 {
                Complex::new(-FRAC_1_SQRT_2, 0.0)
            } else {
                Complex::new(FRAC_1_SQRT_2, 0.0)
            }
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, row: usize, col: usize) -> Complex<f64> {
        self.buffer[row * self.width + col]
    }

    /// The entries in row-major order.
    pub fn entries(&self) -> &[Complex<f64>] {
        &self.buffer
    }

    pub fn is_square(&self) -> bool {
        self.width == self.height
    }

    /// The number of qubits this matrix acts on, if it is a square power-of-two matrix.
    pub fn qubit_span(&self) -> Option<u32> {
        if self.is_square() && self.width.is_power_of_two() {
            Some(self.width.ilog2())
        } else {
            None
        }
    }

    pub fn adjoint(&self) -> Self {
        Self::generate(self.height, self.width, |r, c| self.get(c, r).conj())
    }

    pub fn scaled_by(&self, factor: Complex<f64>) -> Self {
        Matrix {
            width: self.width,
            height: self.height,
            buffer: self.buffer.iter().map(|&e| e * factor).collect(),
        }
    }

    pub fn plus(&self, other: &Matrix) -> Result<Self> {
        self.check_same_shape(other, "matrix addition")?;
        Ok(Matrix {
            width: self.width,
            height: self.height,
            buffer: self
                .buffer
                .iter()
                .zip(&other.buffer)
                .map(|(a, b)| a + b)
                .collect(),
        })
    }

    pub fn minus(&self, other: &Matrix) -> Result<Self> {
        self.plus(&other.scaled_by(-Complex::one()))
    }

    pub fn times(&self, other: &Matrix) -> Result<Self> {
        if self.width != other.height {
            return Err(SimError::dimension_mismatch(
                "matrix product",
                self.width,
                other.height,
            ));
        }
        Ok(Self::generate(other.width, self.height, |r, c| {
            (0..self.width)
                .map(|k| self.get(r, k) * other.get(k, c))
                .sum()
        }))
    }

    /// Kronecker product, with `self` acting on the more significant bits.
    pub fn tensor_product(&self, other: &Matrix) -> Self {
        Self::generate(
            self.width * other.width,
            self.height * other.height,
            |r, c| {
                self.get(r / other.height, c / other.width)
                    * other.get(r % other.height, c % other.width)
            },
        )
    }

    pub fn trace(&self) -> Complex<f64> {
        (0..self.width.min(self.height))
            .map(|i| self.get(i, i))
            .sum()
    }

    /// Applies the matrix to a column vector.
    pub fn apply(&self, vector: &[Complex<f64>]) -> Result<Vec<Complex<f64>>> {
        if vector.len() != self.width {
            return Err(SimError::dimension_mismatch(
                "matrix vector product",
                self.width,
                vector.len(),
            ));
        }
        Ok((0..self.height)
            .map(|r| (0..self.width).map(|c| self.get(r, c) * vector[c]).sum())
            .collect())
    }

    pub fn is_approximately_equal_to(&self, other: &Matrix, epsilon: f64) -> bool {
        self.width == other.width
            && self.height == other.height
            && self
                .buffer
                .iter()
                .zip(&other.buffer)
                .all(|(a, b)| (a - b).norm() <= epsilon)
    }

    pub fn has_nan(&self) -> bool {
        self.buffer.iter().any(|e| e.re.is_nan() || e.im.is_nan())
    }

    pub fn is_identity(&self, epsilon: f64) -> bool {
        self.is_square() && self.is_approximately_equal_to(&Self::identity(self.width), epsilon)
    }

    pub fn is_unitary(&self, epsilon: f64) -> bool {
        self.is_square()
            && self
                .times(&self.adjoint())
                .is_ok_and(|p| p.is_identity(epsilon))
    }

    pub fn is_diagonal(&self, epsilon: f64) -> bool {
        self.is_square()
            && (0..self.height).all(|r| {
                (0..self.width).all(|c| r == c || self.get(r, c).norm() <= epsilon)
            })
    }

    /// Diagonal with unit-magnitude entries.
    pub fn is_phase(&self, epsilon: f64) -> bool {
        self.is_diagonal(epsilon)
            && (0..self.width).all(|i| (self.get(i, i).norm() - 1.0).abs() <= epsilon)
    }

    pub fn is_permutation(&self, epsilon: f64) -> bool {
        self.permutation_sources(epsilon).is_some()
    }

    /// For a permutation matrix, the input index feeding each output index.
    pub fn permutation_sources(&self, epsilon: f64) -> Option<Vec<u32>> {
        if !self.is_square() {
            return None;
        }
        let mut sources = Vec::with_capacity(self.height);
        let mut used = vec![false; self.width];
        for r in 0..self.height {
            let mut source = None;
            for c in 0..self.width {
                let e = self.get(r, c);
                if (e - Complex::one()).norm() <= epsilon {
                    if source.is_some() {
                        return None;
                    }
                    source = Some(c);
                } else if e.norm() > epsilon {
                    return None;
                }
            }
            let c = source?;
            if used[c] {
                return None;
            }
            used[c] = true;
            sources.push(c as u32);
        }
        Some(sources)
    }

    /// The diagonal of a phase matrix.
    pub fn phase_factors(&self, epsilon: f64) -> Option<Vec<Complex<f64>>> {
        if self.is_phase(epsilon) {
            Some((0..self.width).map(|i| self.get(i, i)).collect())
        } else {
            None
        }
    }

    /// Eigenvalues and unit eigenvectors of a 2x2 matrix.
    ///
    /// Defective matrices (a repeated eigenvalue with a single eigenvector) are rejected.
    pub fn eigen_decomposition(&self) -> Result<[EigenPair; 2]> {
        if self.width != 2 || self.height != 2 {
            return Err(SimError::matrix(
                "eigen decomposition is only implemented for 2x2 matrices",
            ));
        }
        let (a, b, c, d) = (self.get(0, 0), self.get(0, 1), self.get(1, 0), self.get(1, 1));
        let epsilon = DEFAULT_EPSILON;

        if b.norm() <= epsilon && c.norm() <= epsilon {
            return Ok([
                EigenPair {
                    value: a,
                    vector: [Complex::one(), Complex::zero()],
                },
                EigenPair {
                    value: d,
                    vector: [Complex::zero(), Complex::one()],
                },
            ]);
        }

        let half_trace = (a + d) / 2.0;
        let disc = ((a - d) * (a - d) / 4.0 + b * c).sqrt();
        if disc.norm() <= epsilon {
            return Err(SimError::matrix("defective matrix has no eigenbasis"));
        }

        let pair = |value: Complex<f64>| {
            let v = if b.norm() > epsilon {
                [b, value - a]
            } else {
                [value - d, c]
            };
            let norm = (v[0].norm_sqr() + v[1].norm_sqr()).sqrt();
            EigenPair {
                value,
                vector: [v[0] / norm, v[1] / norm],
            }
        };
        Ok([pair(half_trace + disc), pair(half_trace - disc)])
    }

    /// Applies `f` to the eigenvalues of a normal 2x2 matrix, e.g. `lift_apply(|e| e.powf(t))`.
    pub fn lift_apply(&self, f: impl Fn(Complex<f64>) -> Complex<f64>) -> Result<Self> {
        let mut result = Self::zero(2, 2);
        for EigenPair { value, vector } in self.eigen_decomposition()? {
            let fv = f(value);
            let projector = Self::generate(2, 2, |r, c| vector[r] * vector[c].conj() * fv);
            result = result.plus(&projector)?;
        }
        Ok(result)
    }

    /// Singular value decomposition by one-sided Jacobi rotations.
    pub fn singular_value_decomposition(&self) -> Result<SingularValueDecomposition> {
        if !self.is_square() {
            return Err(SimError::matrix(
                "singular value decomposition requires a square matrix",
            ));
        }
        let n = self.width;
        let mut a = self.clone();
        let mut v = Self::identity(n);

        for _ in 0..100 {
            let mut rotated = false;
            for p in 0..n {
                for q in p + 1..n {
                    let (mut alpha, mut beta, mut gamma) = (0.0, 0.0, Complex::<f64>::zero());
                    for i in 0..n {
                        let (ap, aq) = (a.get(i, p), a.get(i, q));
                        alpha += ap.norm_sqr();
                        beta += aq.norm_sqr();
                        gamma += ap.conj() * aq;
                    }
                    let g = gamma.norm();
                    if g <= 1e-15 * (alpha * beta).sqrt() || g <= 1e-300 {
                        continue;
                    }
                    rotated = true;

                    let phase = (gamma / g).conj();
                    let zeta = (beta - alpha) / (2.0 * g);
                    let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                    let cos = 1.0 / (1.0 + t * t).sqrt();
                    let sin = cos * t;
                    a.rotate_columns(p, q, phase, cos, sin);
                    v.rotate_columns(p, q, phase, cos, sin);
                }
            }
            if !rotated {
                break;
            }
        }

        let singular_values: Vec<f64> = (0..n)
            .map(|j| (0..n).map(|i| a.get(i, j).norm_sqr()).sum::<f64>().sqrt())
            .collect();
        let largest = singular_values.iter().cloned().fold(0.0, f64::max);
        let mut u = Self::zero(n, n);
        let mut filled = vec![false; n];
        for j in 0..n {
            if singular_values[j] > largest * 1e-12 && singular_values[j] > 0.0 {
                for i in 0..n {
                    u.buffer[i * n + j] = a.get(i, j) / singular_values[j];
                }
                filled[j] = true;
            }
        }
        u.complete_orthonormal_columns(&mut filled);

        Ok(SingularValueDecomposition {
            u,
            singular_values,
            v,
        })
    }

    /// The unitary matrix nearest to this one (in the Frobenius norm).
    pub fn closest_unitary(&self) -> Result<Self> {
        let svd = self.singular_value_decomposition()?;
        svd.u.times(&svd.v.adjoint())
    }

    /// `(I + xX + yY + zZ) / 2`
    pub fn from_bloch_vector(x: f64, y: f64, z: f64) -> Self {
        Matrix {
            width: 2,
            height: 2,
            buffer: vec![
                Complex::new((1.0 + z) / 2.0, 0.0),
                Complex::new(x / 2.0, -y / 2.0),
                Complex::new(x / 2.0, y / 2.0),
                Complex::new((1.0 - z) / 2.0, 0.0),
            ],
        }
    }

    /// The Bloch vector of a (not necessarily normalized) single-qubit density matrix.
    pub fn qubit_density_matrix_to_bloch_vector(&self) -> Result<[f64; 3]> {
        if self.width != 2 || self.height != 2 {
            return Err(SimError::dimension_mismatch(
                "qubit density matrix",
                2,
                self.width,
            ));
        }
        let trace = self.trace().re;
        let off = self.get(1, 0);
        Ok([
            2.0 * off.re / trace,
            2.0 * off.im / trace,
            (self.get(0, 0).re - self.get(1, 1).re) / trace,
        ])
    }

    fn check_same_shape(&self, other: &Matrix, context: &'static str) -> Result<()> {
        if self.width != other.width {
            return Err(SimError::dimension_mismatch(context, self.width, other.width));
        }
        if self.height != other.height {
            return Err(SimError::dimension_mismatch(
                context,
                self.height,
                other.height,
            ));
        }
        Ok(())
    }

    /// Right-multiplies by `diag(1, phase)` on columns (p, q) followed by a real rotation.
    fn rotate_columns(&mut self, p: usize, q: usize, phase: Complex<f64>, cos: f64, sin: f64) {
        for i in 0..self.height {
            let ap = self.buffer[i * self.width + p];
            let aq = self.buffer[i * self.width + q] * phase;
            self.buffer[i * self.width + p] = ap * cos - aq * sin;
            self.buffer[i * self.width + q] = ap * sin + aq * cos;
        }
    }

    /// Gram-Schmidt fills the columns not marked in `filled` with orthonormal vectors.
    fn complete_orthonormal_columns(&mut self, filled: &mut [bool]) {
        let n = self.height;
        for j in 0..self.width {
            if filled[j] {
                continue;
            }
            for k in 0..n {
                let mut candidate: Vec<Complex<f64>> = (0..n)
                    .map(|i| if i == k { Complex::one() } else { Complex::zero() })
                    .collect();
                for other in (0..self.width).filter(|&o| filled[o]) {
                    let dot: Complex<f64> = (0..n)
                        .map(|i| self.get(i, other).conj() * candidate[i])
                        .sum();
                    for (i, e) in candidate.iter_mut().enumerate() {
                        *e -= self.get(i, other) * dot;
                    }
                }
                let norm = candidate.iter().map(|e| e.norm_sqr()).sum::<f64>().sqrt();
                if norm > 0.5 {
                    for (i, e) in candidate.iter().enumerate() {
                        self.buffer[i * self.width + j] = *e / norm;
                    }
                    filled[j] = true;
                    break;
                }
            }
        }
    }
}

impl Display for Matrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for r in 0..self.height {
            if r > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{{")?;
            for c in 0..self.width {
                if c > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", self.get(r, c))?;
            }
            write!(f, "}}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(re: f64, im: f64) -> Complex<f64> {
        Complex::new(re, im)
    }

    #[test]
    fn classification() {
        let eps = DEFAULT_EPSILON;
        assert!(Matrix::hadamard().is_unitary(eps));
        assert!(!Matrix::hadamard().is_permutation(eps));
        assert!(!Matrix::hadamard().is_phase(eps));

        assert!(Matrix::pauli_x().is_permutation(eps));
        assert_eq!(Matrix::pauli_x().permutation_sources(eps), Some(vec![1, 0]));

        assert!(Matrix::pauli_z().is_phase(eps));
        assert!(Matrix::pauli_y().is_unitary(eps));
        assert!(!Matrix::pauli_y().is_permutation(eps));

        let projector = Matrix::real_square(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(projector.is_diagonal(eps));
        assert!(!projector.is_phase(eps));
        assert!(!projector.is_unitary(eps));
        assert_eq!(Matrix::identity(4).qubit_span(), Some(2));
        assert_eq!(Matrix::zero(3, 3).qubit_span(), None);
    }

    #[test]
    fn tensor_product_puts_self_on_high_bits() {
        let xi = Matrix::pauli_x().tensor_product(&Matrix::identity(2));
        // |00> -> |10>, i.e. index 0 -> index 2.
        assert_eq!(xi.permutation_sources(DEFAULT_EPSILON), Some(vec![2, 3, 0, 1]));
    }

    #[test]
    fn product_and_adjoint() {
        let h = Matrix::hadamard();
        assert!(h.times(&h).unwrap().is_identity(1e-12));
        let s = Matrix::diagonal(&[c(1.0, 0.0), c(0.0, 1.0)]);
        let ss = s.times(&s.adjoint()).unwrap();
        assert!(ss.is_identity(1e-12));
        assert!(Matrix::identity(2).times(&Matrix::identity(4)).is_err());
    }

    #[test]
    fn eigen_decomposition_of_pauli_x() {
        let pairs = Matrix::pauli_x().eigen_decomposition().unwrap();
        let mut values: Vec<f64> = pairs.iter().map(|p| p.value.re).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((values[0] + 1.0).abs() < 1e-12);
        assert!((values[1] - 1.0).abs() < 1e-12);
        for pair in &pairs {
            let v = pair.vector.to_vec();
            let mv = Matrix::pauli_x().apply(&v).unwrap();
            for i in 0..2 {
                assert!((mv[i] - v[i] * pair.value).norm() < 1e-12);
            }
        }
    }

    #[test]
    fn lift_apply_computes_square_roots() {
        let sqrt_x = Matrix::pauli_x().lift_apply(|e| e.sqrt()).unwrap();
        let squared = sqrt_x.times(&sqrt_x).unwrap();
        assert!(squared.is_approximately_equal_to(&Matrix::pauli_x(), 1e-9));
        assert!(sqrt_x.is_unitary(1e-9));

        let half_z = Matrix::pauli_z().lift_apply(|e| e.powf(0.5)).unwrap();
        assert!(half_z.is_approximately_equal_to(
            &Matrix::diagonal(&[c(1.0, 0.0), c(0.0, 1.0)]),
            1e-9
        ));
    }

    #[test]
    fn defective_matrix_is_rejected() {
        let m = Matrix::real_square(&[1.0, 1.0, 0.0, 1.0]).unwrap();
        assert!(m.eigen_decomposition().is_err());
    }

    #[test]
    fn svd_reconstructs_matrix() {
        let m = Matrix::square(&[c(1.0, 2.0), c(0.5, 0.0), c(-1.0, 0.25), c(3.0, -1.0)]).unwrap();
        let svd = m.singular_value_decomposition().unwrap();
        let sigma = Matrix::diagonal(
            &svd.singular_values
                .iter()
                .map(|&s| c(s, 0.0))
                .collect::<Vec<_>>(),
        );
        let rebuilt = svd
            .u
            .times(&sigma)
            .unwrap()
            .times(&svd.v.adjoint())
            .unwrap();
        assert!(rebuilt.is_approximately_equal_to(&m, 1e-9));
        assert!(svd.u.is_unitary(1e-9));
        assert!(svd.v.is_unitary(1e-9));
    }

    #[test]
    fn closest_unitary() {
        let noisy = Matrix::hadamard().scaled_by(c(1.1, 0.0));
        let fixed = noisy.closest_unitary().unwrap();
        assert!(fixed.is_approximately_equal_to(&Matrix::hadamard(), 1e-9));

        let singular = Matrix::real_square(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(singular.closest_unitary().unwrap().is_unitary(1e-9));
    }

    #[test]
    fn bloch_vector_round_trip() {
        let rho = Matrix::from_bloch_vector(0.0, 1.0, 0.0);
        let [x, y, z] = rho.qubit_density_matrix_to_bloch_vector().unwrap();
        assert!(x.abs() < 1e-12);
        assert!((y - 1.0).abs() < 1e-12);
        assert!(z.abs() < 1e-12);

        let unnormalized = Matrix::from_bloch_vector(0.0, 0.0, 1.0).scaled_by(c(0.25, 0.0));
        let [_, _, z] = unnormalized.qubit_density_matrix_to_bloch_vector().unwrap();
        assert!((z - 1.0).abs() < 1e-12);
    }

    #[test]
    fn display() {
        let m = Matrix::identity(2);
        assert_eq!(m.to_string(), "{{1+0i, 0+0i}, {0+0i, 1+0i}}");
    }
}
