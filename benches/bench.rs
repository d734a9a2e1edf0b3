use divan::{black_box, Bencher};
use ketflow::{gates, Circuit, Engine};

fn main() {
    divan::main();
}

fn setup(wires: u32, cols: usize) -> Circuit {
    Circuit::random(wires, cols, 123)
}

/// A random circuit with a Bloch display on every wire of its last column.
fn setup_with_displays(wires: u32, cols: usize) -> Circuit {
    let circuit = setup(wires, cols);
    let displays = (0..wires).map(|row| (cols, row, gates::bloch_display()));
    let placements = circuit
        .gates()
        .map(|(col, row, gate)| (col, row, gate.clone()))
        .chain(displays);
    Circuit::new(wires, placements).unwrap()
}

mod cpu {
    use super::*;

    #[divan::bench]
    fn cpu_small(bencher: Bencher) {
        let circuit = setup(8, 32);
        let mut engine = Engine::cpu().unwrap();
        bencher.bench_local(move || engine.final_state(black_box(&circuit), black_box(0.25)));
    }

    #[divan::bench]
    fn cpu_large(bencher: Bencher) {
        let circuit = setup(16, 64);
        let mut engine = Engine::cpu().unwrap();
        bencher.bench_local(move || engine.final_state(black_box(&circuit), black_box(0.25)));
    }

    #[divan::bench]
    fn cpu_stats(bencher: Bencher) {
        let circuit = setup_with_displays(12, 32);
        let mut engine = Engine::cpu().unwrap();
        bencher.bench_local(move || engine.circuit_stats(black_box(&circuit), black_box(0.25)));
    }
}

#[cfg(feature = "gpu")]
mod gpu {
    use super::*;

    #[divan::bench]
    fn gpu_small(bencher: Bencher) {
        let circuit = setup(8, 32);
        let mut engine = Engine::gpu().unwrap();
        bencher.bench_local(move || engine.final_state(black_box(&circuit), black_box(0.25)));
    }

    #[divan::bench]
    fn gpu_large(bencher: Bencher) {
        let circuit = setup(16, 64);
        let mut engine = Engine::gpu().unwrap();
        bencher.bench_local(move || engine.final_state(black_box(&circuit), black_box(0.25)));
    }
}
