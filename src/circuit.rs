use std::{error::Error, fmt::Display, sync::Arc};

use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    context::{ContextValue, CustomContext, INPUT_RANGE_A},
    controls::Controls,
    error,
    gate::{DisplayKind, Gate, GateEffect},
    gates,
};

/// Masks are 64 bits wide and nested circuits are shifted within them.
pub const MAX_WIRES: u32 = 63;

pub const REASON_NEED_OTHER_SWAP: &str = "need\nother\nswap";
pub const REASON_TOO_MANY_SWAPS: &str = "too\nmany\nswaps";
pub const REASON_MISSING_INPUT: &str = "missing\ninput";
pub const REASON_INPUT_OVERLAP: &str = "input\noverlap";
pub const REASON_REMIX_ON_MEASURED: &str = "no\nremix\non\nmeasured";
pub const REASON_NESTED_DISABLED: &str = "nested\ndisabled";
pub const REASON_HIDDEN_MEASURE: &str = "hidden\nmeasure";
pub const REASON_PARTLY_MEASURED: &str = "partly\nmeasured";
pub const REASON_CONTROL_ON_MEASURED: &str = "no\ncontrol\non\nmeasured";

/// Gates touching measured wires are checked by enumerating this many wires at most.
const MAX_TRACKED_WIRES: usize = 16;

/// A grid of gates: columns run left to right, wire `k` is bit `k` of the basis index.
#[derive(Debug, Clone)]
pub struct Circuit {
    wire_count: u32,
    /// The gates of each column, ordered by their top row.
    columns: Vec<Vec<(u32, Gate)>>,
    /// `measured[c]` is the set of measured wires entering column `c`.
    measured: Vec<u64>,
    /// Parallel to `columns`.
    disabled: Vec<Vec<Option<&'static str>>>,
}

impl Circuit {
    /// Places each `(column, top row, gate)`.
    pub fn new(
        wire_count: u32,
        placements: impl IntoIterator<Item = (usize, u32, Gate)>,
    ) -> Result<Self, CircuitCreationError> {
        if wire_count == 0 {
            return Err(CircuitCreationError::NoWires);
        }
        if wire_count > MAX_WIRES {
            return Err(CircuitCreationError::TooManyWires {
                wires: wire_count,
                max: MAX_WIRES,
            });
        }
        let check_index = |index: u32| {
            if index >= wire_count {
                return Err(CircuitCreationError::InvalidQubitIndex {
                    index,
                    qubits: wire_count,
                });
            }
            Ok(())
        };

        let mut columns: Vec<Vec<(u32, Gate)>> = Vec::new();
        let mut occupied: Vec<u64> = Vec::new();
        for (col, row, gate) in placements {
            check_index(row)?;
            check_index(row + gate.height().max(1) - 1)?;
            if let Some(nested) = gate.nested_circuit() {
                if nested.wire_count() != gate.height() {
                    return Err(CircuitCreationError::NestedSizeMismatch {
                        height: gate.height(),
                        wires: nested.wire_count(),
                    });
                }
            }
            if columns.len() <= col {
                columns.resize_with(col + 1, Vec::new);
                occupied.resize(col + 1, 0);
            }
            let covered = wire_range_mask(row, gate.height().max(1));
            if occupied[col] & covered != 0 {
                return Err(CircuitCreationError::GateOverlap { col, row });
            }
            occupied[col] |= covered;
            columns[col].push((row, gate));
        }
        for column in &mut columns {
            column.sort_by_key(|(row, _)| *row);
        }
        Ok(Self::from_columns(wire_count, columns))
    }

    fn from_columns(wire_count: u32, columns: Vec<Vec<(u32, Gate)>>) -> Self {
        let mut measured = Vec::with_capacity(columns.len() + 1);
        let mut disabled = Vec::with_capacity(columns.len());
        let mut mask = 0u64;
        for column in &columns {
            measured.push(mask);
            let (reasons, after) = analyze_column(column, mask);
            mask = after;
            disabled.push(reasons);
        }
        measured.push(mask);
        Circuit {
            wire_count,
            columns,
            measured,
            disabled,
        }
    }

    /// A random circuit of single-wire standard gates, for tests and benchmarks.
    pub fn random(wire_count: u32, num_cols: usize, seed: u64) -> Self {
        let wire_count = wire_count.clamp(1, MAX_WIRES);
        let mut rng = SmallRng::seed_from_u64(seed);
        let columns = (0..num_cols)
            .map(|_| {
                (0..wire_count)
                    .filter_map(|row| {
                        let gate = match rng.random_range(0..=12) {
                            0 => gates::hadamard(),
                            1 => gates::x(),
                            2 => gates::y(),
                            3 => gates::z(),
                            4 => gates::s(),
                            5 => gates::t(),
                            6 => gates::control(),
                            7 => gates::anti_control(),
                            8 => gates::x_pow_t(),
                            9 => gates::z_pow_t(),
                            10..=12 => return None,
                            _ => unreachable!(),
                        };
                        Some((row, gate))
                    })
                    .collect()
            })
            .collect();
        Self::from_columns(wire_count, columns)
    }

    pub fn wire_count(&self) -> u32 {
        self.wire_count
    }

    pub fn num_cols(&self) -> usize {
        self.columns.len()
    }

    /// The gates of `col`, ordered by their top row.
    pub fn column(&self, col: usize) -> &[(u32, Gate)] {
        self.columns.get(col).map_or(&[], Vec::as_slice)
    }

    /// Every placed gate as `(column, top row, gate)`.
    pub fn gates(&self) -> impl Iterator<Item = (usize, u32, &Gate)> {
        self.columns
            .iter()
            .enumerate()
            .flat_map(|(col, column)| column.iter().map(move |(row, gate)| (col, *row, gate)))
    }

    pub fn gate_at(&self, col: usize, row: u32) -> Option<&Gate> {
        self.column(col)
            .iter()
            .find(|(r, _)| *r == row)
            .map(|(_, gate)| gate)
    }

    /// The enabled gates of `col` with their top rows.
    pub fn enabled_gates(&self, col: usize) -> impl Iterator<Item = (u32, &Gate)> {
        let reasons = self.disabled.get(col);
        self.column(col)
            .iter()
            .enumerate()
            .filter(move |(i, _)| reasons.and_then(|r| r[*i]).is_none())
            .map(|(_, (row, gate))| (*row, gate))
    }

    /// Why the gate with top row `row` in `col` does nothing, if it is disabled.
    pub fn gate_at_loc_is_disabled_reason(&self, col: usize, row: u32) -> Option<&'static str> {
        let i = self.column(col).iter().position(|(r, _)| *r == row)?;
        self.disabled[col][i]
    }

    pub fn has_disabled_gate(&self) -> bool {
        self.disabled.iter().flatten().any(Option::is_some)
    }

    pub fn has_measurement(&self) -> bool {
        self.gates().any(|(_, _, gate)| {
            gate.is_measurement() || gate.nested_circuit().is_some_and(Circuit::has_measurement)
        })
    }

    /// The constraints imposed by the enabled control gates of `col`.
    pub fn col_controls(&self, col: usize) -> error::Result<Controls> {
        self.enabled_gates(col)
            .filter_map(|(row, gate)| gate.control().map(|desired| Controls::bit(row, desired)))
            .try_fold(Controls::NONE, |acc, c| acc.and(&c))
    }

    /// The wires that have been measured before `col` runs.
    ///
    /// Columns past the end give the mask after the last column.
    pub fn col_is_measured_mask(&self, col: usize) -> u64 {
        let last = self.measured.len() - 1;
        self.measured[col.min(last)]
    }

    pub fn col_has_single_qubit_display_mask(&self, col: usize) -> u64 {
        self.display_mask(col, DisplayKind::SingleQubit)
    }

    /// Top rows of the enabled two-wire density displays in `col`.
    pub fn col_has_double_qubit_display_mask(&self, col: usize) -> u64 {
        self.display_mask(col, DisplayKind::DoubleQubit)
    }

    fn display_mask(&self, col: usize, kind: DisplayKind) -> u64 {
        self.enabled_gates(col)
            .filter(|(_, gate)| gate.display() == Some(kind))
            .fold(0, |mask, (row, _)| mask | (1 << row))
    }

    /// What basis value `value` becomes after every column, ignoring phases.
    ///
    /// `None` if some enabled gate mixes basis states.
    pub fn classical_image(&self, value: u64) -> Option<u64> {
        (0..self.num_cols()).try_fold(value, |value, col| {
            let controls = self.col_controls(col).ok()?;
            let context = self.col_custom_context_from_gates(col, 0);
            let input = input_value(&context, value);
            let mut image = value;
            let mut swaps = Vec::new();
            for (row, gate) in self.enabled_gates(col) {
                if !gate.setup().is_empty() {
                    return None;
                }
                if !controls.allows(value) {
                    continue;
                }
                if gate.is_swap_half() {
                    swaps.push(row);
                } else {
                    image = gate_image(gate, row, image, input)?;
                }
            }
            if let [a, b] = swaps[..] {
                image = swap_bits(image, a, b);
            }
            Some(image)
        })
    }

    /// Values the enabled gates of `col` publish, in wire coordinates shifted by `outer_row`.
    pub fn col_custom_context_from_gates(&self, col: usize, outer_row: u32) -> CustomContext {
        self.enabled_gates(col)
            .filter_map(|(row, gate)| {
                let key = gate.provided_input()?;
                let value = ContextValue::Range {
                    offset: outer_row + row,
                    length: gate.height(),
                };
                Some((key.to_string(), value))
            })
            .collect()
    }
}

fn wire_range_mask(row: u32, height: u32) -> u64 {
    ((1u64 << height) - 1) << row
}

/// The disabled reason of every gate of a column and the measured wires after it,
/// given the wires measured before it.
fn analyze_column(column: &[(u32, Gate)], measured: u64) -> (Vec<Option<&'static str>>, u64) {
    let published: CustomContext = column
        .iter()
        .filter_map(|(row, gate)| {
            let key = gate.provided_input()?;
            Some((
                key.to_string(),
                ContextValue::Range {
                    offset: *row,
                    length: gate.height(),
                },
            ))
        })
        .collect();
    let mut reasons = placement_reasons(column, &published, measured);
    let mut after = track_column(column, &published, measured, &mut reasons);
    for ((row, gate), reason) in column.iter().zip(&reasons) {
        if reason.is_some() {
            continue;
        }
        let covered = wire_range_mask(*row, gate.height());
        if gate.is_measurement() {
            after |= covered;
        }
        if gate.post_selection().is_some() {
            after &= !covered;
        }
    }
    (reasons, after)
}

/// Checks each gate on its own, given the wires measured before the column.
fn placement_reasons(
    column: &[(u32, Gate)],
    published: &CustomContext,
    measured: u64,
) -> Vec<Option<&'static str>> {
    let swap_count = column.iter().filter(|(_, g)| g.is_swap_half()).count();

    column
        .iter()
        .map(|(row, gate)| {
            let covered = wire_range_mask(*row, gate.height());
            if let Some(nested) = gate.nested_circuit() {
                if nested.has_disabled_gate() {
                    return Some(REASON_NESTED_DISABLED);
                }
                if nested.has_measurement() {
                    return Some(REASON_HIDDEN_MEASURE);
                }
            }
            if gate.is_swap_half() {
                if swap_count == 1 {
                    return Some(REASON_NEED_OTHER_SWAP);
                }
                if swap_count > 2 {
                    return Some(REASON_TOO_MANY_SWAPS);
                }
            }
            for key in gate.required_inputs() {
                let Some(ContextValue::Range { offset, length }) = published.get(key) else {
                    return Some(REASON_MISSING_INPUT);
                };
                if matches!(gate.effect(), Some(GateEffect::Arithmetic { .. }))
                    && wire_range_mask(*offset, *length) & covered != 0
                {
                    return Some(REASON_INPUT_OVERLAP);
                }
            }
            if measured & covered != 0 && gate.is_remix() {
                return Some(REASON_REMIX_ON_MEASURED);
            }
            None
        })
        .collect()
}

/// Moves the measured wires through the enabled gates of a column, disabling the gates
/// that would blend a measured value with coherent wires.
fn track_column(
    column: &[(u32, Gate)],
    published: &CustomContext,
    measured: u64,
    reasons: &mut [Option<&'static str>],
) -> u64 {
    if measured == 0 {
        return 0;
    }
    let controls = column
        .iter()
        .zip(reasons.iter())
        .filter(|(_, reason)| reason.is_none())
        .filter_map(|((row, gate), _)| gate.control().map(|desired| Controls::bit(*row, desired)))
        .try_fold(Controls::NONE, |acc, c| acc.and(&c));
    // Conflicting controls never let the column act.
    let Ok(controls) = controls else {
        return measured;
    };
    let input_mask = match published.get(INPUT_RANGE_A) {
        Some(ContextValue::Range { offset, length }) => wire_range_mask(*offset, *length),
        None => 0,
    };

    let mut after = measured;
    for (i, (row, gate)) in column.iter().enumerate() {
        if reasons[i].is_some() || gate.is_swap_half() || gate.effect().is_none() {
            continue;
        }
        let range = wire_range_mask(*row, gate.height());
        let mut coupled = controls.inclusion_mask();
        if !gate.required_inputs().is_empty() {
            coupled |= input_mask;
        }
        let local = track_measured(range, 0, measured, |v| gate_image(gate, *row, v, 0));
        let steered = track_measured(range, coupled, measured, |v| {
            if !controls.allows(v) {
                return Some(v);
            }
            gate_image(gate, *row, v, input_value(published, v))
        });
        match (local, steered) {
            (None, _) => reasons[i] = Some(REASON_PARTLY_MEASURED),
            (Some(_), None) => reasons[i] = Some(REASON_CONTROL_ON_MEASURED),
            (Some(_), Some(moved)) => after = after & !range | moved,
        }
    }

    let swaps: Vec<usize> = column
        .iter()
        .enumerate()
        .filter(|(i, (_, gate))| gate.is_swap_half() && reasons[*i].is_none())
        .map(|(i, _)| i)
        .collect();
    if let [i, j] = swaps[..] {
        let (a, b) = (column[i].0, column[j].0);
        let range = (1 << a) | (1 << b);
        let steered = track_measured(range, controls.inclusion_mask(), measured, |v| {
            Some(if controls.allows(v) { swap_bits(v, a, b) } else { v })
        });
        match steered {
            Some(moved) => after = after & !range | moved,
            None => {
                reasons[i] = Some(REASON_CONTROL_ON_MEASURED);
                reasons[j] = Some(REASON_CONTROL_ON_MEASURED);
            }
        }
    }
    after
}

/// Follows the measured wires among `range | coupled` through `image`, a bijection that
/// leaves the `coupled` wires alone.
///
/// Returns the measured wires of `range` afterwards, or `None` if some measured value ends
/// up spread over wires that also carry coherent values.
fn track_measured(
    range: u64,
    coupled: u64,
    measured: u64,
    image: impl Fn(u64) -> Option<u64>,
) -> Option<u64> {
    // Measured coupled wires are left alone, so no other wire can become classical.
    if measured & range == 0 {
        return Some(0);
    }
    let support_mask = range | coupled;
    if support_mask & !measured == 0 {
        return Some(range);
    }
    let support: Vec<u32> = (0..u64::BITS)
        .filter(|&wire| (support_mask >> wire) & 1 == 1)
        .collect();
    if support.len() > MAX_TRACKED_WIRES {
        return None;
    }
    let scatter = |index: usize| {
        support
            .iter()
            .enumerate()
            .fold(0u64, |v, (i, &wire)| v | (((index >> i) & 1) as u64) << wire)
    };
    let measured_index = support
        .iter()
        .enumerate()
        .filter(|(_, wire)| (measured >> **wire) & 1 == 1)
        .fold(0usize, |m, (i, _)| m | (1 << i));
    let images = (0..1usize << support.len())
        .map(|index| image(scatter(index)))
        .collect::<Option<Vec<u64>>>()?;

    // A wire stays classical when its value only depends on measured values.
    let classical = support
        .iter()
        .map(|&wire| 1u64 << wire)
        .filter(|&bit| {
            images
                .iter()
                .enumerate()
                .all(|(index, &y)| (y ^ images[index & measured_index]) & bit == 0)
        })
        .fold(0, |m, bit| m | bit);
    let exact = classical.count_ones() == (measured & support_mask).count_ones();
    exact.then_some(classical & range)
}

/// `value` with `gate`, whose top row is `row`, applied to the wires it covers.
fn gate_image(gate: &Gate, row: u32, value: u64, input: u32) -> Option<u64> {
    let Some(effect) = gate.effect() else {
        return Some(value);
    };
    let range = wire_range_mask(row, gate.height());
    let k = ((value & range) >> row) as u32;
    let image = effect.classical_image(k, input, gate.height())?;
    Some(value & !range | (u64::from(image) << row) & range)
}

fn input_value(context: &CustomContext, value: u64) -> u32 {
    match context.get(INPUT_RANGE_A) {
        Some(ContextValue::Range { offset, length }) => {
            ((value & wire_range_mask(*offset, *length)) >> offset) as u32
        }
        None => 0,
    }
}

fn swap_bits(value: u64, a: u32, b: u32) -> u64 {
    if (value >> a) & 1 == (value >> b) & 1 {
        value
    } else {
        value ^ ((1 << a) | (1 << b))
    }
}

/// Wraps `circuit` into a gate covering as many wires as the circuit has.
pub fn circuit_gate(name: impl Into<String>, circuit: Circuit) -> Gate {
    let height = circuit.wire_count();
    let name = name.into();
    Gate::new(name.clone(), name)
        .with_height(height)
        .with_effect(GateEffect::Circuit(Arc::new(circuit)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitCreationError {
    InvalidQubitIndex { index: u32, qubits: u32 },
    GateOverlap { col: usize, row: u32 },
    NoWires,
    TooManyWires { wires: u32, max: u32 },
    NestedSizeMismatch { height: u32, wires: u32 },
}
impl Display for CircuitCreationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitCreationError::InvalidQubitIndex { index, qubits } => {
                write!(
                    f,
                    "Invalid qubit index {index} for circuit of {qubits} qubits"
                )
            }
            CircuitCreationError::GateOverlap { col, row } => {
                write!(f, "Gate at column {col}, row {row} overlaps another gate")
            }
            CircuitCreationError::NoWires => write!(f, "A circuit needs at least one wire"),
            CircuitCreationError::TooManyWires { wires, max } => {
                write!(f, "Circuit of {wires} wires exceeds the limit of {max} wires")
            }
            CircuitCreationError::NestedSizeMismatch { height, wires } => {
                write!(
                    f,
                    "Gate of height {height} cannot hold a circuit of {wires} wires"
                )
            }
        }
    }
}
impl Error for CircuitCreationError {}
