//! Size-bucketed reuse of backend buffers.
//!
//! A [`Buffer`] handle is move-only: it is live from [`BufferPool::take`] until it is
//! handed back with [`BufferPool::deposit`] or consumed by [`BufferPool::trade`].

use std::{
    cell::Cell,
    collections::{BTreeMap, HashMap},
    mem,
    rc::Rc,
};

use tracing::{debug, warn};

use crate::{
    backend::{Backend, BufferShape, Shader},
    error::{Result, SimError},
};

/// Counts handles across a pool and every buffer it has handed out.
#[derive(Debug)]
struct Ledger {
    outstanding: Cell<usize>,
    allocations: Cell<usize>,
    reuses: Cell<usize>,
    dropped: Cell<usize>,
    leak_warning_threshold: usize,
    warned: Cell<bool>,
    leak_warnings: Cell<usize>,
}
impl Ledger {
    fn acquire(&self) {
        let outstanding = self.outstanding.get() + 1;
        self.outstanding.set(outstanding);
        if outstanding > self.leak_warning_threshold && !self.warned.get() {
            self.warned.set(true);
            self.leak_warnings.set(self.leak_warnings.get() + 1);
            warn!(
                outstanding,
                threshold = self.leak_warning_threshold,
                "Many buffers are checked out of the pool, they may be leaking"
            );
        }
    }

    fn release(&self) {
        let outstanding = self.outstanding.get().saturating_sub(1);
        self.outstanding.set(outstanding);
        if outstanding <= self.leak_warning_threshold {
            self.warned.set(false);
        }
    }
}

pub struct Buffer<B: Backend> {
    shape: BufferShape,
    storage: Option<B::Storage>,
    rendered: bool,
    ledger: Option<Rc<Ledger>>,
}
impl<B: Backend> Buffer<B> {
    pub fn shape(&self) -> BufferShape {
        self.shape
    }

    pub fn is_rendered(&self) -> bool {
        self.rendered
    }

    /// The backing storage, once something has been rendered into it.
    pub fn storage(&self) -> Result<&B::Storage> {
        let storage = self
            .storage
            .as_ref()
            .ok_or(SimError::ZeroSizeBuffer("read"))?;
        if !self.rendered {
            return Err(SimError::ReadBeforeRender);
        }
        Ok(storage)
    }
}
impl<B: Backend> Drop for Buffer<B> {
    fn drop(&mut self) {
        if let Some(ledger) = self.ledger.take() {
            ledger.release();
            ledger.dropped.set(ledger.dropped.get() + 1);
            debug!(shape = ?self.shape, "Buffer dropped without being deposited");
        }
    }
}
impl<B: Backend> std::fmt::Debug for Buffer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("shape", &self.shape)
            .field("rendered", &self.rendered)
            .finish()
    }
}

pub struct BufferPool<B: Backend> {
    backend: B,
    free: BTreeMap<BufferShape, Vec<B::Storage>>,
    ledger: Rc<Ledger>,
}
impl<B: Backend> BufferPool<B> {
    pub fn new(backend: B, leak_warning_threshold: usize) -> Self {
        BufferPool {
            backend,
            free: BTreeMap::new(),
            ledger: Rc::new(Ledger {
                outstanding: Cell::new(0),
                allocations: Cell::new(0),
                reuses: Cell::new(0),
                dropped: Cell::new(0),
                leak_warning_threshold,
                warned: Cell::new(false),
                leak_warnings: Cell::new(0),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Handles that have been taken but not yet deposited.
    pub fn outstanding(&self) -> usize {
        self.ledger.outstanding.get()
    }

    pub fn allocations(&self) -> usize {
        self.ledger.allocations.get()
    }

    pub fn reuses(&self) -> usize {
        self.ledger.reuses.get()
    }

    /// Handles that were dropped instead of deposited.
    pub fn dropped(&self) -> usize {
        self.ledger.dropped.get()
    }

    /// How often the outstanding count has crossed the leak warning threshold.
    pub fn leak_warnings(&self) -> usize {
        self.ledger.leak_warnings.get()
    }

    /// Free buffers per bucket.
    pub fn free_counts(&self) -> HashMap<BufferShape, usize> {
        self.free.iter().map(|(&s, v)| (s, v.len())).collect()
    }

    pub fn take(&mut self, shape: BufferShape) -> Result<Buffer<B>> {
        let storage = if shape.is_degenerate() {
            None
        } else if let Some(storage) = self.free.get_mut(&shape).and_then(Vec::pop) {
            self.ledger.reuses.set(self.ledger.reuses.get() + 1);
            Some(storage)
        } else {
            let storage = self.backend.allocate(shape)?;
            self.ledger.allocations.set(self.ledger.allocations.get() + 1);
            debug!(?shape, backend = self.backend.name(), "Allocated buffer");
            Some(storage)
        };
        self.ledger.acquire();
        Ok(Buffer {
            shape,
            storage,
            rendered: false,
            ledger: Some(Rc::clone(&self.ledger)),
        })
    }

    pub fn deposit(&mut self, mut buffer: Buffer<B>) {
        if let Some(ledger) = buffer.ledger.take() {
            ledger.release();
        }
        if let Some(storage) = buffer.storage.take() {
            self.free.entry(buffer.shape).or_default().push(storage);
        }
    }

    /// Renders `shader` into `target`, reading `input` as its primary input.
    pub fn render(
        &self,
        shader: &Shader<'_, B>,
        input: Option<&Buffer<B>>,
        target: &mut Buffer<B>,
    ) -> Result<()> {
        shader.validate(input.map(Buffer::shape), target.shape)?;
        let input = input.map(Buffer::storage).transpose()?;
        let storage = target
            .storage
            .as_mut()
            .ok_or(SimError::ZeroSizeBuffer("rendered into"))?;
        self.backend.render(shader, input, target.shape, storage)?;
        target.rendered = true;
        Ok(())
    }

    /// Renders `shader` into a freshly taken buffer of `shape`.
    pub fn render_new(
        &mut self,
        shape: BufferShape,
        shader: &Shader<'_, B>,
        input: Option<&Buffer<B>>,
    ) -> Result<Buffer<B>> {
        let mut target = self.take(shape)?;
        match self.render(shader, input, &mut target) {
            Ok(()) => Ok(target),
            Err(e) => {
                self.deposit(target);
                Err(e)
            }
        }
    }

    /// Replaces `state` with the result of running `shader` over it.
    pub fn trade(&mut self, state: Buffer<B>, shader: &Shader<'_, B>) -> Result<Buffer<B>> {
        let shape = state.shape;
        self.trade_reshaped(state, shape, shader)
    }

    pub fn trade_reshaped(
        &mut self,
        state: Buffer<B>,
        shape: BufferShape,
        shader: &Shader<'_, B>,
    ) -> Result<Buffer<B>> {
        let result = self.render_new(shape, shader, Some(&state));
        self.deposit(state);
        result
    }

    pub fn read_pixels(&self, buffer: &Buffer<B>) -> Result<Vec<f32>> {
        let storage = buffer.storage()?;
        self.backend.read_pixels(storage, buffer.shape)
    }
}

enum Current<'a, B: Backend> {
    Owned(Buffer<B>),
    Borrowed(&'a Buffer<B>),
}

/// Walks a chain of renders, handing each intermediate buffer back to the pool.
///
/// A trader started from a borrowed buffer never deposits it.
pub struct Trader<'a, B: Backend> {
    current: Current<'a, B>,
}
impl<'a, B: Backend> Trader<'a, B> {
    pub fn owned(buffer: Buffer<B>) -> Self {
        Trader {
            current: Current::Owned(buffer),
        }
    }

    pub fn borrowed(buffer: &'a Buffer<B>) -> Self {
        Trader {
            current: Current::Borrowed(buffer),
        }
    }

    pub fn current(&self) -> &Buffer<B> {
        match &self.current {
            Current::Owned(buffer) => buffer,
            Current::Borrowed(buffer) => buffer,
        }
    }

    pub fn shade_and_trade(
        &mut self,
        pool: &mut BufferPool<B>,
        shape: BufferShape,
        shader: &Shader<'_, B>,
    ) -> Result<()> {
        let next = pool.render_new(shape, shader, Some(self.current()))?;
        if let Current::Owned(previous) = mem::replace(&mut self.current, Current::Owned(next)) {
            pool.deposit(previous);
        }
        Ok(())
    }

    /// The final buffer, if the trader has rendered anything of its own.
    pub fn into_owned(self) -> Option<Buffer<B>> {
        match self.current {
            Current::Owned(buffer) => Some(buffer),
            Current::Borrowed(_) => None,
        }
    }

    /// Reads the current buffer and returns it to the pool if it is owned.
    pub fn read_and_release(self, pool: &mut BufferPool<B>) -> Result<Vec<f32>> {
        let pixels = pool.read_pixels(self.current());
        if let Some(buffer) = self.into_owned() {
            pool.deposit(buffer);
        }
        pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{cpu::CpuBackend, PixelType};

    fn pool() -> BufferPool<CpuBackend> {
        BufferPool::new(CpuBackend::new(1).unwrap(), 4)
    }

    #[test]
    fn reuses_deposited_buffers() {
        let mut pool = pool();
        let shape = BufferShape::new(3, PixelType::Complex);
        let a = pool.take(shape).unwrap();
        assert_eq!(pool.outstanding(), 1);
        pool.deposit(a);
        assert_eq!(pool.outstanding(), 0);
        let b = pool.take(shape).unwrap();
        assert_eq!(pool.allocations(), 1);
        assert_eq!(pool.reuses(), 1);

        // A different bucket allocates anew.
        let c = pool.take(shape.with_pixel_type(PixelType::Float)).unwrap();
        assert_eq!(pool.allocations(), 2);
        pool.deposit(b);
        pool.deposit(c);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.free_counts().values().sum::<usize>(), 2);
    }

    #[test]
    fn leak_warning_once_per_crossing() {
        let mut pool = BufferPool::new(CpuBackend::new(1).unwrap(), 2);
        let shape = BufferShape::new(1, PixelType::Float);
        let mut held: Vec<_> = (0..2).map(|_| pool.take(shape).unwrap()).collect();
        assert_eq!(pool.leak_warnings(), 0);

        held.push(pool.take(shape).unwrap());
        assert_eq!(pool.leak_warnings(), 1);
        held.push(pool.take(shape).unwrap());
        assert_eq!(pool.leak_warnings(), 1);

        // Still above the threshold, so no re-arm yet.
        pool.deposit(held.pop().unwrap());
        held.push(pool.take(shape).unwrap());
        assert_eq!(pool.leak_warnings(), 1);

        pool.deposit(held.pop().unwrap());
        pool.deposit(held.pop().unwrap());
        assert_eq!(pool.outstanding(), 2);
        held.push(pool.take(shape).unwrap());
        assert_eq!(pool.leak_warnings(), 2);

        for buffer in held {
            pool.deposit(buffer);
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn read_before_render_fails() {
        let mut pool = pool();
        let buffer = pool.take(BufferShape::new(1, PixelType::Float)).unwrap();
        assert_eq!(pool.read_pixels(&buffer), Err(SimError::ReadBeforeRender));
        pool.deposit(buffer);

        // Reused buffers start out unrendered too.
        let mut buffer = pool.take(BufferShape::new(1, PixelType::Float)).unwrap();
        pool.render(&Shader::Uniform([1.0; 4]), None, &mut buffer).unwrap();
        pool.deposit(buffer);
        let buffer = pool.take(BufferShape::new(1, PixelType::Float)).unwrap();
        assert_eq!(pool.read_pixels(&buffer), Err(SimError::ReadBeforeRender));
        pool.deposit(buffer);
    }

    #[test]
    fn degenerate_buffers_cannot_be_used() {
        let mut pool = pool();
        let shape = BufferShape::degenerate(PixelType::Complex);
        let mut buffer = pool.take(shape).unwrap();
        assert_eq!(
            pool.render(&Shader::Basis { index: 0 }, None, &mut buffer),
            Err(SimError::ZeroSizeBuffer("rendered into"))
        );
        assert_eq!(
            pool.read_pixels(&buffer),
            Err(SimError::ZeroSizeBuffer("read"))
        );
        pool.deposit(buffer);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.allocations(), 0);
    }

    #[test]
    fn trade_deposits_the_input() {
        let mut pool = pool();
        let shape = BufferShape::new(2, PixelType::Float);
        let a = pool
            .render_new(shape, &Shader::Uniform([2.0; 4]), None)
            .unwrap();
        let other = pool
            .render_new(
                shape,
                &Shader::ControlBit {
                    bit: 0,
                    desired: true,
                },
                None,
            )
            .unwrap();
        let b = pool.trade(a, &Shader::Product { other: &other }).unwrap();
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(pool.read_pixels(&b).unwrap(), vec![0.0, 2.0, 0.0, 2.0]);
        pool.deposit(b);
        pool.deposit(other);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn failed_trade_releases_everything() {
        let mut pool = pool();
        let state = pool
            .render_new(
                BufferShape::new(2, PixelType::Complex),
                &Shader::Basis { index: 0 },
                None,
            )
            .unwrap();
        let wrong = pool
            .render_new(
                BufferShape::new(3, PixelType::Float),
                &Shader::Uniform([1.0; 4]),
                None,
            )
            .unwrap();
        let result = pool.trade(
            state,
            &Shader::Swap {
                control: &wrong,
                bit_a: 0,
                bit_b: 1,
            },
        );
        assert!(matches!(result, Err(SimError::DimensionMismatch { .. })));
        pool.deposit(wrong);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn dropped_handles_are_counted() {
        let mut pool = pool();
        let buffer = pool.take(BufferShape::new(1, PixelType::Float)).unwrap();
        drop(buffer);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.dropped(), 1);
    }

    #[test]
    fn borrowed_trader_keeps_its_start() {
        let mut pool = pool();
        let start = pool
            .render_new(
                BufferShape::new(2, PixelType::Float),
                &Shader::Uniform([1.0; 4]),
                None,
            )
            .unwrap();
        let mut trader = Trader::borrowed(&start);
        for order in [1, 0] {
            let shape = BufferShape::new(order, PixelType::Float);
            trader
                .shade_and_trade(&mut pool, shape, &Shader::FoldSum)
                .unwrap();
        }
        let pixels = trader.read_and_release(&mut pool).unwrap();
        assert_eq!(pixels, vec![4.0]);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.read_pixels(&start).unwrap(), vec![1.0; 4]);
        pool.deposit(start);
    }
}
