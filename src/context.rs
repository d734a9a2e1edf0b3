use std::collections::BTreeMap;

use crate::{backend::Backend, controls::Controls, pool::Buffer};

/// The key under which an "input A" gate publishes the wires it marks.
pub const INPUT_RANGE_A: &str = "Input Range A";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextValue {
    /// `length` wires starting at `offset`, in absolute wire coordinates.
    Range { offset: u32, length: u32 },
}

/// Facts gates in a column publish for other gates in that column.
pub type CustomContext = BTreeMap<String, ContextValue>;

/// Everything an operation needs to know about where and when it runs.
pub struct EvalContext<'a, B: Backend> {
    pub time: f64,
    /// Absolute wire the operation's sub-block starts at.
    pub row: u32,
    pub wire_count: u32,
    pub controls: Controls,
    pub controls_texture: &'a Buffer<B>,
    pub custom_context: &'a CustomContext,
}

impl<'a, B: Backend> EvalContext<'a, B> {
    pub fn with_row(&self, row: u32) -> Self {
        EvalContext { row, ..self.clone() }
    }

    /// A copy running under other controls, possibly borrowing a shorter-lived mask.
    pub fn with_controls<'b>(
        &self,
        controls: Controls,
        controls_texture: &'b Buffer<B>,
    ) -> EvalContext<'b, B>
    where
        'a: 'b,
    {
        EvalContext {
            time: self.time,
            row: self.row,
            wire_count: self.wire_count,
            controls,
            controls_texture,
            custom_context: self.custom_context,
        }
    }

    pub fn with_custom_context<'b>(&self, custom_context: &'b CustomContext) -> EvalContext<'b, B>
    where
        'a: 'b,
    {
        EvalContext {
            time: self.time,
            row: self.row,
            wire_count: self.wire_count,
            controls: self.controls,
            controls_texture: self.controls_texture,
            custom_context,
        }
    }

    pub fn input_range(&self, key: &str) -> Option<(u32, u32)> {
        match self.custom_context.get(key)? {
            ContextValue::Range { offset, length } => Some((*offset, *length)),
        }
    }
}

// Derived Clone would demand `B: Clone`.
impl<B: Backend> Clone for EvalContext<'_, B> {
    fn clone(&self) -> Self {
        EvalContext {
            time: self.time,
            row: self.row,
            wire_count: self.wire_count,
            controls: self.controls,
            controls_texture: self.controls_texture,
            custom_context: self.custom_context,
        }
    }
}
