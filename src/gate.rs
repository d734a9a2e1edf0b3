use std::{fmt::Debug, sync::Arc};

use num_complex::Complex;

use crate::{
    circuit::Circuit,
    matrix::{Matrix, DEFAULT_EPSILON},
};

/// What a gate does to the amplitudes of the wires it covers.
#[derive(Clone)]
pub enum GateEffect {
    Matrix(Matrix),
    /// A matrix depending on the animation time in `[0, 1)`.
    TimeMatrix(Arc<dyn Fn(f64) -> Matrix + Send + Sync>),
    /// Maps each sub-block value to the value it becomes.
    Permutation(Arc<dyn Fn(u32) -> u32 + Send + Sync>),
    /// Unit phase factor for each sub-block value.
    Phase(Arc<dyn Fn(u32) -> Complex<f64> + Send + Sync>),
    /// Adds `sign` times the value of "input A" to the covered wires.
    Arithmetic { sign: i32 },
    /// Runs a whole circuit on the covered wires.
    Circuit(Arc<Circuit>),
}

/// Times at which time-dependent matrices are sampled when classifying them.
const SAMPLE_TIMES: [f64; 4] = [0.0, 0.25, 0.5, 0.75];

impl GateEffect {
    /// Whether this effect can mix amplitudes of different basis states coherently,
    /// i.e. is neither diagonal nor a permutation.
    pub fn is_remix(&self) -> bool {
        let remixes = |m: &Matrix| {
            !m.is_diagonal(DEFAULT_EPSILON) && !m.is_permutation(DEFAULT_EPSILON)
        };
        match self {
            GateEffect::Matrix(m) => remixes(m),
            GateEffect::TimeMatrix(f) => SAMPLE_TIMES.iter().any(|&t| remixes(&f(t))),
            GateEffect::Permutation(_) | GateEffect::Phase(_) | GateEffect::Arithmetic { .. } => {
                false
            }
            GateEffect::Circuit(circuit) => circuit.gates().any(|(_, _, gate)| gate.is_remix()),
        }
    }

    /// What basis value `k` of the covered wires becomes, ignoring phases.
    ///
    /// `input` is the value of the "input A" range. `None` if the effect mixes basis
    /// states, or moves them differently over time.
    pub fn classical_image(&self, k: u32, input: u32, height: u32) -> Option<u32> {
        match self {
            GateEffect::Matrix(m) => matrix_image(m, k),
            GateEffect::TimeMatrix(f) => {
                let mut images = SAMPLE_TIMES.iter().map(|&t| matrix_image(&f(t), k));
                let first = images.next()??;
                images.all(|image| image == Some(first)).then_some(first)
            }
            GateEffect::Permutation(f) => Some(f(k)),
            GateEffect::Phase(_) => Some(k),
            GateEffect::Arithmetic { sign } => {
                let size = 1i64 << height;
                let sum = i64::from(k) + i64::from(*sign) * i64::from(input);
                Some(sum.rem_euclid(size) as u32)
            }
            GateEffect::Circuit(circuit) => circuit
                .classical_image(u64::from(k))
                .map(|image| image as u32),
        }
    }

    /// The matrix this effect has at `time`, when it is known up front.
    pub fn matrix_at(&self, time: f64) -> Option<Matrix> {
        match self {
            GateEffect::Matrix(m) => Some(m.clone()),
            GateEffect::TimeMatrix(f) => Some(f(time)),
            _ => None,
        }
    }
}

/// The row holding the only nonzero entry of column `k`.
fn matrix_image(m: &Matrix, k: u32) -> Option<u32> {
    let k = k as usize;
    if k >= m.width() {
        return None;
    }
    let mut rows = (0..m.height()).filter(|&r| m.get(r, k).norm() > DEFAULT_EPSILON);
    match (rows.next(), rows.next()) {
        (Some(r), None) => Some(r as u32),
        _ => None,
    }
}

impl Debug for GateEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateEffect::Matrix(m) => write!(f, "Matrix({m})"),
            GateEffect::TimeMatrix(_) => write!(f, "TimeMatrix(..)"),
            GateEffect::Permutation(_) => write!(f, "Permutation(..)"),
            GateEffect::Phase(_) => write!(f, "Phase(..)"),
            GateEffect::Arithmetic { sign } => write!(f, "Arithmetic {{ sign: {sign} }}"),
            GateEffect::Circuit(c) => write!(f, "Circuit({} wires)", c.wire_count()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayKind {
    /// Per-wire density matrix, e.g. a Bloch sphere.
    SingleQubit,
    /// Density matrix of a pair of wires.
    DoubleQubit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatMaker {
    /// Probabilities of each value of the covered wires.
    Probabilities,
    /// Amplitudes of each value of the covered wires, summed over the other wires.
    Amplitudes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatValue {
    Probabilities(Vec<f64>),
    Amplitudes(Vec<Complex<f64>>),
}

#[derive(Clone)]
pub struct CustomStat {
    pub maker: StatMaker,
    /// Turns the raw readback (one value per basis state of the covered wires) into a stat.
    pub post: Arc<dyn Fn(&[f32]) -> StatValue + Send + Sync>,
}
impl Debug for CustomStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomStat")
            .field("maker", &self.maker)
            .finish_non_exhaustive()
    }
}

/// An immutable gate description.
///
/// Every `with_*` method returns a new gate and leaves the original unchanged.
#[derive(Debug, Clone)]
pub struct Gate {
    symbol: String,
    name: String,
    height: u32,
    effect: Option<GateEffect>,
    control: Option<bool>,
    setup: Vec<GateEffect>,
    unsetup: Vec<GateEffect>,
    display: Option<DisplayKind>,
    custom_stat: Option<CustomStat>,
    measurement: bool,
    post_selection: Option<bool>,
    provided_input: Option<String>,
    required_inputs: Vec<String>,
    swap_half: bool,
}

impl Gate {
    pub fn new(symbol: impl Into<String>, name: impl Into<String>) -> Self {
        Gate {
            symbol: symbol.into(),
            name: name.into(),
            height: 1,
            effect: None,
            control: None,
            setup: Vec::new(),
            unsetup: Vec::new(),
            display: None,
            custom_stat: None,
            measurement: false,
            post_selection: None,
            provided_input: None,
            required_inputs: Vec::new(),
            swap_half: false,
        }
    }

    pub fn with_height(self, height: u32) -> Self {
        Gate { height, ..self }
    }

    pub fn with_effect(self, effect: GateEffect) -> Self {
        Gate {
            effect: Some(effect),
            ..self
        }
    }

    pub fn with_matrix(self, matrix: Matrix) -> Self {
        self.with_effect(GateEffect::Matrix(matrix))
    }

    pub fn with_time_matrix(self, f: impl Fn(f64) -> Matrix + Send + Sync + 'static) -> Self {
        self.with_effect(GateEffect::TimeMatrix(Arc::new(f)))
    }

    pub fn with_permutation(self, f: impl Fn(u32) -> u32 + Send + Sync + 'static) -> Self {
        self.with_effect(GateEffect::Permutation(Arc::new(f)))
    }

    pub fn with_phase(self, f: impl Fn(u32) -> Complex<f64> + Send + Sync + 'static) -> Self {
        self.with_effect(GateEffect::Phase(Arc::new(f)))
    }

    /// Makes this a control: other gates in its column only act where its wire equals `desired`.
    pub fn with_control(self, desired: bool) -> Self {
        Gate {
            control: Some(desired),
            ..self
        }
    }

    /// Effects applied to the gate's wires before and after the rest of its column.
    pub fn with_setup(self, setup: GateEffect, unsetup: GateEffect) -> Self {
        let mut gate = self;
        gate.setup.push(setup);
        gate.unsetup.push(unsetup);
        gate
    }

    pub fn with_display(self, display: DisplayKind) -> Self {
        Gate {
            display: Some(display),
            ..self
        }
    }

    pub fn with_custom_stat(
        self,
        maker: StatMaker,
        post: impl Fn(&[f32]) -> StatValue + Send + Sync + 'static,
    ) -> Self {
        Gate {
            custom_stat: Some(CustomStat {
                maker,
                post: Arc::new(post),
            }),
            ..self
        }
    }

    pub fn with_measurement(self) -> Self {
        Gate {
            measurement: true,
            ..self
        }
    }

    /// Marks the gate as discarding every state in which its wire differs from `kept`.
    pub fn with_post_selection(self, kept: bool) -> Self {
        Gate {
            post_selection: Some(kept),
            ..self
        }
    }

    pub fn with_provided_input(self, key: impl Into<String>) -> Self {
        Gate {
            provided_input: Some(key.into()),
            ..self
        }
    }

    pub fn with_required_input(self, key: impl Into<String>) -> Self {
        let mut gate = self;
        gate.required_inputs.push(key.into());
        gate
    }

    pub fn with_swap_half(self) -> Self {
        Gate {
            swap_half: true,
            ..self
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The number of wires the gate covers.
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn effect(&self) -> Option<&GateEffect> {
        self.effect.as_ref()
    }

    pub fn control(&self) -> Option<bool> {
        self.control
    }

    pub fn setup(&self) -> &[GateEffect] {
        &self.setup
    }

    pub fn unsetup(&self) -> &[GateEffect] {
        &self.unsetup
    }

    pub fn display(&self) -> Option<DisplayKind> {
        self.display
    }

    pub fn custom_stat(&self) -> Option<&CustomStat> {
        self.custom_stat.as_ref()
    }

    pub fn is_measurement(&self) -> bool {
        self.measurement
    }

    pub fn post_selection(&self) -> Option<bool> {
        self.post_selection
    }

    pub fn provided_input(&self) -> Option<&str> {
        self.provided_input.as_deref()
    }

    pub fn required_inputs(&self) -> &[String] {
        &self.required_inputs
    }

    pub fn is_swap_half(&self) -> bool {
        self.swap_half
    }

    pub fn nested_circuit(&self) -> Option<&Circuit> {
        match &self.effect {
            Some(GateEffect::Circuit(c)) => Some(c),
            _ => None,
        }
    }

    /// Whether the gate, including its setup, can mix amplitudes of different basis states.
    pub fn is_remix(&self) -> bool {
        self.effect.as_ref().is_some_and(GateEffect::is_remix)
            || self.setup.iter().any(GateEffect::is_remix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_leave_the_original_alone() {
        let base = Gate::new("Q", "query");
        let controlled = base.clone().with_control(true);
        assert_eq!(base.control(), None);
        assert_eq!(controlled.control(), Some(true));
        assert_eq!(controlled.symbol(), "Q");

        let tall = controlled.with_height(3).with_required_input("A");
        assert_eq!(tall.height(), 3);
        assert_eq!(tall.required_inputs(), ["A".to_string()]);
    }

    #[test]
    fn remix_classification() {
        let h = Gate::new("H", "hadamard").with_matrix(Matrix::hadamard());
        let x = Gate::new("X", "x").with_matrix(Matrix::pauli_x());
        let z = Gate::new("Z", "z").with_matrix(Matrix::pauli_z());
        assert!(h.is_remix());
        assert!(!x.is_remix());
        assert!(!z.is_remix());

        let plus_control = Gate::new("+", "plus control").with_control(false).with_setup(
            GateEffect::Matrix(Matrix::hadamard()),
            GateEffect::Matrix(Matrix::hadamard()),
        );
        assert!(plus_control.is_remix());

        let spin = Gate::new("X^t", "x^t").with_time_matrix(|t| {
            Matrix::pauli_x()
                .lift_apply(|e| e.powf(t))
                .unwrap_or_else(|_| Matrix::identity(2))
        });
        assert!(spin.is_remix());
    }

    #[test]
    fn classical_images() {
        let x = GateEffect::Matrix(Matrix::pauli_x());
        assert_eq!(x.classical_image(0, 0, 1), Some(1));
        assert_eq!(x.classical_image(1, 0, 1), Some(0));
        // Y only rephases the basis states it swaps.
        let y = GateEffect::Matrix(Matrix::pauli_y());
        assert_eq!(y.classical_image(1, 0, 1), Some(0));
        let h = GateEffect::Matrix(Matrix::hadamard());
        assert_eq!(h.classical_image(0, 0, 1), None);

        let phase = GateEffect::Phase(Arc::new(|k| Complex::new(0.0, k as f64).exp()));
        assert_eq!(phase.classical_image(3, 0, 2), Some(3));

        let sub = GateEffect::Arithmetic { sign: -1 };
        assert_eq!(sub.classical_image(1, 3, 2), Some(2));
        let add = GateEffect::Arithmetic { sign: 1 };
        assert_eq!(add.classical_image(3, 2, 2), Some(1));

        let flicker = GateEffect::TimeMatrix(Arc::new(|t| {
            if t < 0.5 {
                Matrix::identity(2)
            } else {
                Matrix::pauli_x()
            }
        }));
        assert_eq!(flicker.classical_image(0, 0, 1), None);
    }

    #[test]
    fn debug_hides_closures() {
        let gate = Gate::new("P", "perm").with_permutation(|k| k ^ 1);
        let text = format!("{gate:?}");
        assert!(text.contains("Permutation(..)"));
    }
}
