//! A small standard gate set.

use std::f64::consts::PI;

use num_complex::Complex;

pub use crate::circuit::circuit_gate;
use crate::{
    context::INPUT_RANGE_A,
    gate::{DisplayKind, Gate, GateEffect, StatMaker, StatValue},
    matrix::Matrix,
};

pub fn hadamard() -> Gate {
    Gate::new("H", "Hadamard Gate").with_matrix(Matrix::hadamard())
}

pub fn x() -> Gate {
    Gate::new("X", "Pauli X Gate").with_matrix(Matrix::pauli_x())
}

pub fn y() -> Gate {
    Gate::new("Y", "Pauli Y Gate").with_matrix(Matrix::pauli_y())
}

pub fn z() -> Gate {
    Gate::new("Z", "Pauli Z Gate").with_matrix(Matrix::pauli_z())
}

pub fn s() -> Gate {
    Gate::new("S", "Quarter Turn Gate")
        .with_matrix(Matrix::diagonal(&[Complex::new(1.0, 0.0), Complex::i()]))
}

pub fn t() -> Gate {
    Gate::new("T", "Eighth Turn Gate").with_matrix(Matrix::diagonal(&[
        Complex::new(1.0, 0.0),
        Complex::from_polar(1.0, PI / 4.0),
    ]))
}

/// `X^t`: a full X rotation over one period of the time parameter.
pub fn x_pow_t() -> Gate {
    Gate::new("X^t", "X Rotation Gate").with_time_matrix(|t| {
        let w = Complex::from_polar(1.0, PI * t);
        let same = (1.0 + w) / 2.0;
        let flip = (1.0 - w) / 2.0;
        Matrix::generate(2, 2, |r, c| if r == c { same } else { flip })
    })
}

pub fn z_pow_t() -> Gate {
    Gate::new("Z^t", "Z Rotation Gate").with_time_matrix(|t| {
        Matrix::diagonal(&[Complex::new(1.0, 0.0), Complex::from_polar(1.0, PI * t)])
    })
}

pub fn control() -> Gate {
    Gate::new("•", "Control").with_control(true)
}

pub fn anti_control() -> Gate {
    Gate::new("◦", "Anti-Control").with_control(false)
}

/// Conditions on the wire being `|+>`.
pub fn plus_control() -> Gate {
    Gate::new("⊕", "X-Axis Control")
        .with_control(false)
        .with_setup(hadamard_effect(), hadamard_effect())
}

/// Conditions on the wire being `|->`.
pub fn minus_control() -> Gate {
    Gate::new("⊖", "X-Axis Anti-Control")
        .with_control(true)
        .with_setup(hadamard_effect(), hadamard_effect())
}

fn hadamard_effect() -> GateEffect {
    GateEffect::Matrix(Matrix::hadamard())
}

pub fn measurement() -> Gate {
    Gate::new("Measure", "Measurement Gate").with_measurement()
}

/// Keeps only the states in which the wire is `|0>`.
pub fn post_select_off() -> Gate {
    Gate::new("|0⟩⟨0|", "Postselect Off")
        .with_matrix(Matrix::diagonal(&[Complex::new(1.0, 0.0), Complex::new(0.0, 0.0)]))
        .with_post_selection(false)
}

pub fn post_select_on() -> Gate {
    Gate::new("|1⟩⟨1|", "Postselect On")
        .with_matrix(Matrix::diagonal(&[Complex::new(0.0, 0.0), Complex::new(1.0, 0.0)]))
        .with_post_selection(true)
}

pub fn swap_half() -> Gate {
    Gate::new("Swap", "Swap Gate").with_swap_half()
}

pub fn bloch_display() -> Gate {
    Gate::new("Bloch", "Bloch Sphere Display").with_display(DisplayKind::SingleQubit)
}

pub fn density_display_2() -> Gate {
    Gate::new("Density2", "Density Matrix Display")
        .with_height(2)
        .with_display(DisplayKind::DoubleQubit)
}

/// Probability of each value of `height` wires, weighted by the column's controls.
pub fn chance_display(height: u32) -> Gate {
    Gate::new(format!("Chance{height}"), "Probability Display")
        .with_height(height)
        .with_custom_stat(StatMaker::Probabilities, |raw| {
            StatValue::Probabilities(raw.iter().map(|&p| p as f64).collect())
        })
}

/// Amplitudes of `height` wires, scaled to unit length.
///
/// Only meaningful when the wires are not entangled with the rest of the circuit.
pub fn amplitude_display(height: u32) -> Gate {
    Gate::new(format!("Amps{height}"), "Amplitude Display")
        .with_height(height)
        .with_custom_stat(StatMaker::Amplitudes, |raw| {
            let amps: Vec<Complex<f64>> = raw
                .chunks_exact(2)
                .map(|c| Complex::new(c[0] as f64, c[1] as f64))
                .collect();
            let norm = amps.iter().map(Complex::norm_sqr).sum::<f64>().sqrt();
            if norm > 0.0 {
                StatValue::Amplitudes(amps.into_iter().map(|a| a / norm).collect())
            } else {
                StatValue::Amplitudes(amps)
            }
        })
}

/// Sized gates cover between one and this many wires.
pub const MAX_SIZED_HEIGHT: u32 = 16;

fn clamp_height(height: u32) -> u32 {
    height.clamp(1, MAX_SIZED_HEIGHT)
}

/// Heights outside `1..=MAX_SIZED_HEIGHT` are clamped, as for the other permutations.
pub fn increment(height: u32) -> Gate {
    let height = clamp_height(height);
    let size = 1u32 << height;
    Gate::new(format!("+1_{height}"), "Increment Gate")
        .with_height(height)
        .with_permutation(move |k| (k + 1) % size)
}

pub fn decrement(height: u32) -> Gate {
    let height = clamp_height(height);
    let size = 1u32 << height;
    Gate::new(format!("-1_{height}"), "Decrement Gate")
        .with_height(height)
        .with_permutation(move |k| (k + size - 1) % size)
}

pub fn reverse_bits(height: u32) -> Gate {
    let height = clamp_height(height);
    Gate::new(format!("Reverse{height}"), "Reverse Order Gate")
        .with_height(height)
        .with_permutation(move |k| k.reverse_bits() >> (u32::BITS - height))
}

/// Marks `height` wires as the value "A" for arithmetic gates in the same column.
pub fn input_a(height: u32) -> Gate {
    Gate::new(format!("inputA{height}"), "Input Gate [A]")
        .with_height(height)
        .with_provided_input(INPUT_RANGE_A)
}

pub fn plus_a(height: u32) -> Gate {
    Gate::new(format!("+A{height}"), "Addition Gate")
        .with_height(height)
        .with_effect(GateEffect::Arithmetic { sign: 1 })
        .with_required_input(INPUT_RANGE_A)
}

pub fn minus_a(height: u32) -> Gate {
    Gate::new(format!("-A{height}"), "Subtraction Gate")
        .with_height(height)
        .with_effect(GateEffect::Arithmetic { sign: -1 })
        .with_required_input(INPUT_RANGE_A)
}

/// Looks up a standard gate by its symbol. Sized gates carry their height at the end,
/// e.g. `"Chance2"` or `"+1_3"`.
pub fn from_symbol(symbol: &str) -> Option<Gate> {
    let fixed = match symbol {
        "H" => Some(hadamard()),
        "X" => Some(x()),
        "Y" => Some(y()),
        "Z" => Some(z()),
        "S" => Some(s()),
        "T" => Some(t()),
        "X^t" => Some(x_pow_t()),
        "Z^t" => Some(z_pow_t()),
        "•" => Some(control()),
        "◦" => Some(anti_control()),
        "⊕" => Some(plus_control()),
        "⊖" => Some(minus_control()),
        "Measure" => Some(measurement()),
        "|0⟩⟨0|" => Some(post_select_off()),
        "|1⟩⟨1|" => Some(post_select_on()),
        "Swap" => Some(swap_half()),
        "Bloch" => Some(bloch_display()),
        "Density2" => Some(density_display_2()),
        _ => None,
    };
    if fixed.is_some() {
        return fixed;
    }

    let sized: [(&str, fn(u32) -> Gate); 8] = [
        ("Chance", chance_display),
        ("Amps", amplitude_display),
        ("+1_", increment),
        ("-1_", decrement),
        ("Reverse", reverse_bits),
        ("inputA", input_a),
        ("+A", plus_a),
        ("-A", minus_a),
    ];
    sized.iter().find_map(|(prefix, make)| {
        let height: u32 = symbol.strip_prefix(prefix)?.parse().ok()?;
        (1..=MAX_SIZED_HEIGHT).contains(&height).then(|| make(height))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::DEFAULT_EPSILON;

    #[test]
    fn time_gates_are_unitary_and_periodic() {
        for gate in [x_pow_t(), z_pow_t()] {
            let effect = gate.effect().unwrap();
            for t in [0.0, 0.1, 0.5, 0.9] {
                assert!(effect.matrix_at(t).unwrap().is_unitary(1e-9));
            }
            assert!(effect.matrix_at(0.0).unwrap().is_identity(1e-9));
        }
        let half = x_pow_t().effect().unwrap().matrix_at(1.0).unwrap();
        assert!(half.is_approximately_equal_to(&Matrix::pauli_x(), 1e-9));
    }

    #[test]
    fn x_pow_t_matches_lifted_power() {
        let lifted = Matrix::pauli_x()
            .lift_apply(|e| e.powf(0.3))
            .unwrap();
        let direct = x_pow_t().effect().unwrap().matrix_at(0.3).unwrap();
        assert!(lifted.is_approximately_equal_to(&direct, 1e-9));
    }

    #[test]
    fn fixed_gates_are_unitary() {
        for gate in [hadamard(), x(), y(), z(), s(), t()] {
            let m = gate.effect().unwrap().matrix_at(0.0).unwrap();
            assert!(m.is_unitary(DEFAULT_EPSILON), "{}", gate.symbol());
        }
    }

    #[test]
    fn permutations() {
        let GateEffect::Permutation(rev) = reverse_bits(3).effect().cloned().unwrap() else {
            panic!("reverse_bits is not a permutation");
        };
        assert_eq!(rev(0b001), 0b100);
        assert_eq!(rev(0b110), 0b011);

        let GateEffect::Permutation(dec) = decrement(2).effect().cloned().unwrap() else {
            panic!("decrement is not a permutation");
        };
        assert_eq!(dec(0), 3);
        assert_eq!(dec(2), 1);
    }

    #[test]
    fn permutation_heights_are_clamped() {
        for make in [increment, decrement, reverse_bits] {
            assert_eq!(make(0).height(), 1);
            assert_eq!(make(32).height(), MAX_SIZED_HEIGHT);
            assert_eq!(make(u32::MAX).height(), MAX_SIZED_HEIGHT);
        }
        let GateEffect::Permutation(inc) = increment(0).effect().cloned().unwrap() else {
            panic!("increment is not a permutation");
        };
        assert_eq!(inc(0), 1);
        assert_eq!(inc(1), 0);
        let GateEffect::Permutation(rev) = reverse_bits(40).effect().cloned().unwrap() else {
            panic!("reverse_bits is not a permutation");
        };
        assert_eq!(rev(1), 1 << (MAX_SIZED_HEIGHT - 1));
    }

    #[test]
    fn symbols_round_trip() {
        for gate in [
            hadamard(),
            x_pow_t(),
            control(),
            plus_control(),
            post_select_on(),
            density_display_2(),
            chance_display(3),
            increment(2),
            reverse_bits(4),
            input_a(2),
            minus_a(3),
        ] {
            let found = from_symbol(gate.symbol()).unwrap();
            assert_eq!(found.symbol(), gate.symbol());
            assert_eq!(found.height(), gate.height());
        }
        assert!(from_symbol("nope").is_none());
        assert!(from_symbol("Chance0").is_none());
        assert!(from_symbol("Chancex").is_none());
    }
}
