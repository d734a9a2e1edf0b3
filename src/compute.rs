//! The column-by-column evaluation of a circuit.

use crate::{
    backend::{Backend, Shader},
    circuit::Circuit,
    context::{CustomContext, EvalContext, INPUT_RANGE_A},
    controls::Controls,
    engine::EngineConfig,
    error::{Result, SimError},
    gate::{Gate, GateEffect},
    ket_shader::{
        apply_ket, matrix_operation, offset_operation, permutation_operation, phase_operation,
    },
    mask::render_controls_mask,
    pool::{Buffer, BufferPool},
    stats::{custom_stat_terms, decohere, density_matrix, StatsCollector},
};

/// Runs every column of `circuit` over `state`.
///
/// `ctx.row` is where the circuit's wire 0 sits in the full state, and `ctx.controls`
/// with `ctx.controls_texture` are the controls every column runs under.
pub(crate) fn advance_state<B: Backend>(
    pool: &mut BufferPool<B>,
    config: &EngineConfig,
    ctx: &EvalContext<'_, B>,
    circuit: &Circuit,
    state: Buffer<B>,
    mut stats: Option<&mut StatsCollector>,
) -> Result<Buffer<B>> {
    let mut state = state;
    for col in 0..circuit.num_cols() {
        let col_controls = match column_controls(circuit, col, ctx) {
            Ok(controls) => controls,
            Err(e) => {
                pool.deposit(state);
                return Err(e);
            }
        };
        let mask = match render_controls_mask(pool, col_controls, ctx.wire_count) {
            Ok(mask) => mask,
            Err(e) => {
                pool.deposit(state);
                return Err(e);
            }
        };
        let custom_context = circuit.col_custom_context_from_gates(col, ctx.row);
        let column = Column {
            circuit,
            col,
            controls: col_controls,
            mask: &mask,
            custom_context: &custom_context,
        };
        let result = column.advance(pool, config, ctx, state, stats.as_deref_mut());
        pool.deposit(mask);
        state = result?;
    }
    Ok(state)
}

fn column_controls<B: Backend>(
    circuit: &Circuit,
    col: usize,
    ctx: &EvalContext<'_, B>,
) -> Result<Controls> {
    circuit.col_controls(col)?.shift(ctx.row).and(&ctx.controls)
}

struct Column<'c, B: Backend> {
    circuit: &'c Circuit,
    col: usize,
    controls: Controls,
    mask: &'c Buffer<B>,
    custom_context: &'c CustomContext,
}

impl<B: Backend> Column<'_, B> {
    fn advance(
        &self,
        pool: &mut BufferPool<B>,
        config: &EngineConfig,
        ctx: &EvalContext<'_, B>,
        state: Buffer<B>,
        stats: Option<&mut StatsCollector>,
    ) -> Result<Buffer<B>> {
        let ambient = ctx.with_custom_context(self.custom_context);
        let controlled = ambient.with_controls(self.controls, self.mask);
        let gates: Vec<(u32, &Gate)> = self.circuit.enabled_gates(self.col).collect();
        let mut state = state;

        // Setup runs under the ambient controls only, so it also reaches states the
        // column's own controls exclude.
        for (row, gate) in &gates {
            for effect in gate.setup() {
                let at = ambient.with_row(ctx.row + row);
                state = apply_effect(pool, config, &at, effect, gate.height(), state)?;
            }
        }

        for (row, gate) in gates.iter().filter(|(_, g)| !g.is_swap_half()) {
            if let Some(effect) = gate.effect() {
                let at = controlled.with_row(ctx.row + row);
                state = apply_effect(pool, config, &at, effect, gate.height(), state)?;
            }
        }

        let swaps: Vec<u32> = gates
            .iter()
            .filter(|(_, g)| g.is_swap_half())
            .map(|(row, _)| *row)
            .collect();
        if let [a, b] = swaps[..] {
            let shader = Shader::Swap {
                control: self.mask,
                bit_a: ctx.row + a,
                bit_b: ctx.row + b,
            };
            state = pool.trade(state, &shader)?;
        }

        if let Some(stats) = stats {
            if let Err(e) = self.collect_stats(pool, &controlled, &state, stats) {
                pool.deposit(state);
                return Err(e);
            }
        }

        for (row, gate) in gates.iter().rev() {
            for effect in gate.unsetup().iter().rev() {
                let at = ambient.with_row(ctx.row + row);
                state = apply_effect(pool, config, &at, effect, gate.height(), state)?;
            }
        }
        Ok(state)
    }

    fn collect_stats(
        &self,
        pool: &mut BufferPool<B>,
        ctx: &EvalContext<'_, B>,
        state: &Buffer<B>,
        stats: &mut StatsCollector,
    ) -> Result<()> {
        let col = self.col;
        // Displays see the state after this column's measurements.
        let measured = self.circuit.col_is_measured_mask(col + 1);

        let singles = self.circuit.col_has_single_qubit_display_mask(col);
        for wire in set_bits(singles) {
            let raw = density_matrix(pool, state, ctx.controls_texture, ctx.row + wire, 1)?;
            stats.set_qubit_density(col, wire, decohere(&raw, (measured >> wire) & 0b1));
        }

        let doubles = self.circuit.col_has_double_qubit_display_mask(col);
        for row in set_bits(doubles) {
            let raw = density_matrix(pool, state, ctx.controls_texture, ctx.row + row, 2)?;
            stats.set_pair_density(col, row, decohere(&raw, (measured >> row) & 0b11));
        }

        for (row, gate) in self.circuit.enabled_gates(col) {
            let Some(custom) = gate.custom_stat() else {
                continue;
            };
            let raw = custom_stat_terms(
                pool,
                state,
                ctx.controls_texture,
                ctx.row + row,
                gate.height(),
                custom.maker,
            )?;
            stats.set_custom_stat(col, row, (custom.post)(raw.as_slice()));
        }
        Ok(())
    }
}

fn set_bits(mask: u64) -> impl Iterator<Item = u32> {
    (0..u64::BITS).filter(move |&i| mask & (1 << i) != 0)
}

/// Applies one gate effect covering `height` wires at `ctx.row`.
fn apply_effect<B: Backend>(
    pool: &mut BufferPool<B>,
    config: &EngineConfig,
    ctx: &EvalContext<'_, B>,
    effect: &GateEffect,
    height: u32,
    state: Buffer<B>,
) -> Result<Buffer<B>> {
    let kind = match effect {
        GateEffect::Circuit(inner) => {
            return advance_state(pool, config, ctx, inner, state, None);
        }
        GateEffect::Matrix(m) => matrix_operation(m, config.max_matrix_span),
        GateEffect::TimeMatrix(f) => matrix_operation(&f(ctx.time), config.max_matrix_span),
        GateEffect::Permutation(f) => permutation_operation(height, |k| f(k)),
        GateEffect::Phase(f) => phase_operation(height, |k| f(k)),
        GateEffect::Arithmetic { sign } => ctx
            .input_range(INPUT_RANGE_A)
            .map(|input| offset_operation(height, input, *sign))
            .ok_or_else(|| SimError::MissingContext(INPUT_RANGE_A.to_string())),
    };
    let kind = match kind {
        Ok(kind) if kind.span() == height => kind,
        Ok(kind) => {
            pool.deposit(state);
            return Err(SimError::dimension_mismatch(
                "gate height",
                height as usize,
                kind.span() as usize,
            ));
        }
        Err(e) => {
            pool.deposit(state);
            return Err(e);
        }
    };
    apply_ket(pool, ctx, state, kind)
}
