//! Dense row-major tensors.
//!
//! Float tensors default to `f16`, the working precision of the model.
//! Integer inputs (token and position ids) use `Tensor<i64>`.

use crate::error::{QwenError, Result};
use half::f16;

/// A dense tensor with a dynamic shape and row-major storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T = f16> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T: Copy + Default> Tensor<T> {
    /// Wrap `data` with `shape`, checking the element count.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Result<Self> {
        let shape = shape.into();
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(QwenError::Shape(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                numel,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// A tensor of `shape` with every element set to `value`.
    pub fn full(shape: impl Into<Vec<usize>>, value: T) -> Self {
        let shape = shape.into();
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![value; numel],
        }
    }

    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        Self::full(shape, T::default())
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Reinterpret the same data under a new shape.
    pub fn reshape(self, shape: impl Into<Vec<usize>>) -> Result<Self> {
        Self::new(shape, self.data)
    }

    /// Outer count, axis length and inner stride for `axis`.
    fn split_axis(&self, axis: usize) -> Result<(usize, usize, usize)> {
        if axis >= self.rank() {
            return Err(QwenError::Shape(format!(
                "axis {} out of range for rank {}",
                axis,
                self.rank()
            )));
        }
        let outer = self.shape[..axis].iter().product();
        let inner = self.shape[axis + 1..].iter().product();
        Ok((outer, self.shape[axis], inner))
    }

    /// Take `len` consecutive entries along `axis` starting at `start`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Self> {
        let (_, dim, _) = self.split_axis(axis)?;
        if start + len > dim {
            return Err(QwenError::Shape(format!(
                "narrow {}..{} exceeds axis {} of size {}",
                start,
                start + len,
                axis,
                dim
            )));
        }
        let indices: Vec<usize> = (start..start + len).collect();
        self.index_select(axis, &indices)
    }

    /// Gather entries along `axis` at the given indices, in order.
    pub fn index_select(&self, axis: usize, indices: &[usize]) -> Result<Self> {
        let (outer, dim, inner) = self.split_axis(axis)?;
        if let Some(&bad) = indices.iter().find(|&&i| i >= dim) {
            return Err(QwenError::Shape(format!(
                "index {} out of range for axis {} of size {}",
                bad, axis, dim
            )));
        }
        let mut data = Vec::with_capacity(outer * indices.len() * inner);
        for o in 0..outer {
            let base = o * dim * inner;
            for &i in indices {
                let off = base + i * inner;
                data.extend_from_slice(&self.data[off..off + inner]);
            }
        }
        let mut shape = self.shape.clone();
        shape[axis] = indices.len();
        Ok(Self { shape, data })
    }

    /// Split along axis 0 into consecutive blocks of the given sizes.
    pub fn split(&self, sizes: &[usize]) -> Result<Vec<Self>> {
        let (_, dim, inner) = self.split_axis(0)?;
        let total: usize = sizes.iter().sum();
        if total != dim {
            return Err(QwenError::Shape(format!(
                "split sizes sum to {} but axis 0 has {}",
                total, dim
            )));
        }
        let mut parts = Vec::with_capacity(sizes.len());
        let mut start = 0;
        for &size in sizes {
            let mut shape = self.shape.clone();
            shape[0] = size;
            let data = self.data[start * inner..(start + size) * inner].to_vec();
            parts.push(Self { shape, data });
            start += size;
        }
        Ok(parts)
    }

    /// Concatenate tensors along `axis`; all other dimensions must agree.
    pub fn cat(parts: &[Self], axis: usize) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| QwenError::Shape("cannot concatenate zero tensors".to_string()))?;
        let (outer, _, inner) = first.split_axis(axis)?;
        for p in parts {
            let same_rank = p.rank() == first.rank();
            let same_dims = same_rank
                && p.shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !same_dims {
                return Err(QwenError::Shape(format!(
                    "cannot concatenate {:?} with {:?} along axis {}",
                    p.shape, first.shape, axis
                )));
            }
        }
        let total: usize = parts.iter().map(|p| p.shape[axis]).sum();
        let mut data = Vec::with_capacity(outer * total * inner);
        for o in 0..outer {
            for p in parts {
                let chunk = p.shape[axis] * inner;
                data.extend_from_slice(&p.data[o * chunk..(o + 1) * chunk]);
            }
        }
        let mut shape = first.shape.clone();
        shape[axis] = total;
        Ok(Self { shape, data })
    }
}

impl Tensor<f16> {
    /// Build a half-precision tensor from `f32` values.
    pub fn from_f32(shape: impl Into<Vec<usize>>, values: &[f32]) -> Result<Self> {
        Self::new(shape, values.iter().map(|&v| f16::from_f32(v)).collect())
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data.iter().map(|v| v.to_f32()).collect()
    }
}
