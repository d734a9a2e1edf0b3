use std::mem;

use crate::{
    backend::{Backend, BufferShape, PixelType, Shader},
    controls::Controls,
    error::Result,
    pool::{Buffer, BufferPool},
};

/// Renders a `Float` buffer that is 1.0 exactly where `controls` allows the basis index.
pub fn render_controls_mask<B: Backend>(
    pool: &mut BufferPool<B>,
    controls: Controls,
    wire_count: u32,
) -> Result<Buffer<B>> {
    let shape = BufferShape::new(wire_count, PixelType::Float);
    let mut wires = controls.included_wires();
    let Some(first) = wires.next() else {
        return pool.render_new(shape, &Shader::Uniform([1.0; 4]), None);
    };

    let single = |wire: u32| Shader::ControlBit {
        bit: wire,
        desired: controls.desired_value_for(wire) == Some(true),
    };
    let mut accumulator = pool.render_new(shape, &single(first), None)?;
    let rest: Vec<u32> = wires.collect();
    if rest.is_empty() {
        return Ok(accumulator);
    }

    let mut bit = pool.take(shape)?;
    let mut other = pool.take(shape)?;
    for wire in rest {
        let rendered = pool.render(&single(wire), None, &mut bit).and_then(|_| {
            pool.render(&Shader::Product { other: &bit }, Some(&accumulator), &mut other)
        });
        if let Err(e) = rendered {
            pool.deposit(bit);
            pool.deposit(other);
            pool.deposit(accumulator);
            return Err(e);
        }
        mem::swap(&mut accumulator, &mut other);
    }
    pool.deposit(bit);
    pool.deposit(other);
    Ok(accumulator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuBackend;

    fn mask(controls: Controls, wires: u32) -> Vec<f32> {
        let mut pool = BufferPool::new(CpuBackend::new(2).unwrap(), 16);
        let buffer = render_controls_mask(&mut pool, controls, wires).unwrap();
        let pixels = pool.read_pixels(&buffer).unwrap();
        pool.deposit(buffer);
        assert_eq!(pool.outstanding(), 0);
        pixels
    }

    #[test]
    fn no_controls() {
        assert_eq!(mask(Controls::NONE, 3), vec![1.0; 8]);
    }

    #[test]
    fn single_control() {
        assert_eq!(mask(Controls::bit(0, false), 2), vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn several_controls() {
        let controls = Controls::bit(0, true)
            .and(&Controls::bit(2, false))
            .and_then(|c| c.and(&Controls::bit(3, true)))
            .unwrap();
        let pixels = mask(controls, 4);
        for (i, &p) in pixels.iter().enumerate() {
            let expected = if controls.allows(i as u64) { 1.0 } else { 0.0 };
            assert_eq!(p, expected, "index {i:04b}");
        }
        assert_eq!(pixels.iter().filter(|&&p| p == 1.0).count(), 2);
    }
}
