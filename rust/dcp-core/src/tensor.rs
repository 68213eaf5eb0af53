// rust/dcp-core/src/tensor.rs

//! Tensor projections.
//!
//! A [`TensorView`] describes a possibly non-contiguous window over shared
//! bytes. Only the logical projection is ever persisted: writing a view of a
//! larger allocation stores exactly `numel` elements in row-major order.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    U8,
    I8,
    I16,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    pub fn element_size(self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 => 1,
            DType::I16 | DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }
}

/// Number of elements in a tensor of the given shape. Scalars have one.
pub fn numel(sizes: &[usize]) -> usize {
    sizes.iter().product()
}

/// Row-major element strides for `sizes`.
pub fn contiguous_strides(sizes: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; sizes.len()];
    for dim in (0..sizes.len().saturating_sub(1)).rev() {
        strides[dim] = strides[dim + 1] * sizes[dim + 1];
    }
    strides
}

/// A strided view over shared tensor storage.
#[derive(Debug, Clone)]
pub struct TensorView {
    storage: Bytes,
    dtype: DType,
    sizes: Vec<usize>,
    // In elements, not bytes.
    strides: Vec<usize>,
    offset: usize,
}

impl TensorView {
    /// Wraps row-major bytes holding exactly `numel(sizes)` elements.
    pub fn from_bytes(data: Bytes, dtype: DType, sizes: Vec<usize>) -> Result<Self> {
        let expected = numel(&sizes) * dtype.element_size();
        if data.len() != expected {
            return Err(CheckpointError::serialization(format!(
                "tensor of shape {sizes:?} and dtype {dtype:?} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        let strides = contiguous_strides(&sizes);
        Ok(Self {
            storage: data,
            dtype,
            sizes,
            strides,
            offset: 0,
        })
    }

    /// Builds a contiguous `F32` tensor from values.
    pub fn from_f32(values: &[f32], sizes: Vec<usize>) -> Result<Self> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(Bytes::from(bytes), DType::F32, sizes)
    }

    /// Creates an arbitrary strided view. Fails if any addressed element
    /// falls outside `storage`.
    pub fn strided(
        storage: Bytes,
        dtype: DType,
        sizes: Vec<usize>,
        strides: Vec<usize>,
        offset: usize,
    ) -> Result<Self> {
        if sizes.len() != strides.len() {
            return Err(CheckpointError::serialization(format!(
                "sizes {sizes:?} and strides {strides:?} have different ranks"
            )));
        }
        if numel(&sizes) > 0 {
            let last = offset
                + sizes
                    .iter()
                    .zip(&strides)
                    .map(|(size, stride)| (size - 1) * stride)
                    .sum::<usize>();
            if (last + 1) * dtype.element_size() > storage.len() {
                return Err(CheckpointError::serialization(format!(
                    "view reaches element {last} beyond storage of {} bytes",
                    storage.len()
                )));
            }
        }
        Ok(Self {
            storage,
            dtype,
            sizes,
            strides,
            offset,
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn numel(&self) -> usize {
        numel(&self.sizes)
    }

    /// Size of the logical projection in bytes.
    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.element_size()
    }

    pub fn is_contiguous(&self) -> bool {
        self.sizes
            .iter()
            .zip(self.strides.iter().zip(contiguous_strides(&self.sizes)))
            .all(|(&size, (&actual, expected))| size <= 1 || actual == expected)
    }

    /// Restricts `dim` to `[start, start + length)` without copying.
    pub fn narrow(&self, dim: usize, start: usize, length: usize) -> Result<Self> {
        let size = *self.sizes.get(dim).ok_or_else(|| {
            CheckpointError::serialization(format!(
                "dimension {dim} out of range for rank {}",
                self.sizes.len()
            ))
        })?;
        if start + length > size {
            return Err(CheckpointError::serialization(format!(
                "narrow [{start}, {}) exceeds size {size} of dimension {dim}",
                start + length
            )));
        }
        let mut sizes = self.sizes.clone();
        sizes[dim] = length;
        Ok(Self {
            storage: self.storage.clone(),
            dtype: self.dtype,
            sizes,
            strides: self.strides.clone(),
            offset: self.offset + start * self.strides[dim],
        })
    }

    /// Gathers the projection into row-major bytes.
    ///
    /// Contiguous views are returned as a zero-copy slice of the storage.
    pub fn to_contiguous_bytes(&self) -> Bytes {
        let es = self.dtype.element_size();
        if self.is_contiguous() {
            let start = self.offset * es;
            return self.storage.slice(start..start + self.nbytes());
        }

        let mut out = Vec::with_capacity(self.nbytes());
        for_each_index(&self.sizes, |index| {
            let element = self.offset
                + index
                    .iter()
                    .zip(&self.strides)
                    .map(|(i, stride)| i * stride)
                    .sum::<usize>();
            out.extend_from_slice(&self.storage[element * es..(element + 1) * es]);
        });
        Bytes::from(out)
    }

    /// Decodes an `F32` tensor's projection.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        if self.dtype != DType::F32 {
            return Err(CheckpointError::serialization(format!(
                "expected F32 tensor, found {:?}",
                self.dtype
            )));
        }
        Ok(self
            .to_contiguous_bytes()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Calls `f` with every multi-index of `sizes` in row-major order.
fn for_each_index(sizes: &[usize], mut f: impl FnMut(&[usize])) {
    if sizes.iter().any(|&s| s == 0) {
        return;
    }
    let mut index = vec![0; sizes.len()];
    loop {
        f(&index);
        let mut dim = sizes.len();
        loop {
            if dim == 0 {
                return;
            }
            dim -= 1;
            index[dim] += 1;
            if index[dim] < sizes[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
}

/// Intersection of a stored chunk with a requested region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlap {
    /// Offsets of the overlap inside the stored chunk.
    pub storage_offsets: Vec<usize>,
    /// Offsets of the overlap inside the destination region.
    pub dest_offsets: Vec<usize>,
    pub lengths: Vec<usize>,
}

/// Computes where a saved chunk and a destination region overlap, both
/// expressed in global tensor coordinates. `None` when they are disjoint.
pub fn chunk_overlap(
    saved_offsets: &[usize],
    saved_sizes: &[usize],
    dest_offsets: &[usize],
    dest_sizes: &[usize],
) -> Option<Overlap> {
    let ndim = saved_offsets.len();
    if saved_sizes.len() != ndim || dest_offsets.len() != ndim || dest_sizes.len() != ndim {
        return None;
    }

    let mut overlap = Overlap {
        storage_offsets: Vec::with_capacity(ndim),
        dest_offsets: Vec::with_capacity(ndim),
        lengths: Vec::with_capacity(ndim),
    };
    for dim in 0..ndim {
        let lo = saved_offsets[dim].max(dest_offsets[dim]);
        let hi = (saved_offsets[dim] + saved_sizes[dim]).min(dest_offsets[dim] + dest_sizes[dim]);
        if lo >= hi {
            return None;
        }
        overlap.storage_offsets.push(lo - saved_offsets[dim]);
        overlap.dest_offsets.push(lo - dest_offsets[dim]);
        overlap.lengths.push(hi - lo);
    }
    Some(overlap)
}

/// Copies the box `lengths` at `src_offsets` of a row-major `src` tensor to
/// `dst_offsets` of a row-major `dst` tensor.
#[allow(clippy::too_many_arguments)]
pub fn copy_region(
    src: &[u8],
    src_sizes: &[usize],
    src_offsets: &[usize],
    dst: &mut [u8],
    dst_sizes: &[usize],
    dst_offsets: &[usize],
    lengths: &[usize],
    element_size: usize,
) -> Result<()> {
    let ndim = lengths.len();
    if src_sizes.len() != ndim
        || src_offsets.len() != ndim
        || dst_sizes.len() != ndim
        || dst_offsets.len() != ndim
    {
        return Err(CheckpointError::serialization(format!(
            "copy of rank {ndim} region between tensors of rank {} and {}",
            src_sizes.len(),
            dst_sizes.len()
        )));
    }
    for dim in 0..ndim {
        if src_offsets[dim] + lengths[dim] > src_sizes[dim]
            || dst_offsets[dim] + lengths[dim] > dst_sizes[dim]
        {
            return Err(CheckpointError::serialization(format!(
                "region of length {} at dimension {dim} exceeds source {} or destination {}",
                lengths[dim], src_sizes[dim], dst_sizes[dim]
            )));
        }
    }
    if src.len() < numel(src_sizes) * element_size || dst.len() < numel(dst_sizes) * element_size
    {
        return Err(CheckpointError::serialization(
            "buffer is smaller than its declared shape",
        ));
    }

    if ndim == 0 {
        dst[..element_size].copy_from_slice(&src[..element_size]);
        return Ok(());
    }

    let src_strides = contiguous_strides(src_sizes);
    let dst_strides = contiguous_strides(dst_sizes);
    let row = lengths[ndim - 1] * element_size;
    if numel(lengths) == 0 {
        return Ok(());
    }

    for_each_index(&lengths[..ndim - 1], |outer| {
        let mut s = src_offsets[ndim - 1];
        let mut d = dst_offsets[ndim - 1];
        for dim in 0..ndim - 1 {
            s += (src_offsets[dim] + outer[dim]) * src_strides[dim];
            d += (dst_offsets[dim] + outer[dim]) * dst_strides[dim];
        }
        let (s, d) = (s * element_size, d * element_size);
        dst[d..d + row].copy_from_slice(&src[s..s + row]);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_4x4() -> TensorView {
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        TensorView::from_f32(&values, vec![4, 4]).unwrap()
    }

    #[test]
    fn test_from_bytes_checks_length() {
        assert!(TensorView::from_bytes(Bytes::from(vec![0u8; 7]), DType::F32, vec![2]).is_err());
        assert!(TensorView::from_bytes(Bytes::from(vec![0u8; 8]), DType::F32, vec![2]).is_ok());
    }

    #[test]
    fn test_narrow_rows_stays_contiguous() {
        let rows = matrix_4x4().narrow(0, 1, 2).unwrap();
        assert!(rows.is_contiguous());
        assert_eq!(rows.to_f32_vec().unwrap(), vec![4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_narrow_columns_gathers_projection_only() {
        let cols = matrix_4x4().narrow(1, 2, 2).unwrap();
        assert!(!cols.is_contiguous());
        assert_eq!(cols.nbytes(), 8 * 4);
        assert_eq!(
            cols.to_f32_vec().unwrap(),
            vec![2.0, 3.0, 6.0, 7.0, 10.0, 11.0, 14.0, 15.0]
        );
    }

    #[test]
    fn test_transposed_view() {
        let base = matrix_4x4();
        let storage = base.to_contiguous_bytes();
        let transposed =
            TensorView::strided(storage, DType::F32, vec![2, 4], vec![1, 4], 0).unwrap();
        assert_eq!(
            transposed.to_f32_vec().unwrap(),
            vec![0.0, 4.0, 8.0, 12.0, 1.0, 5.0, 9.0, 13.0]
        );
    }

    #[test]
    fn test_strided_rejects_out_of_bounds() {
        let storage = Bytes::from(vec![0u8; 16]);
        assert!(TensorView::strided(storage, DType::F32, vec![2, 2], vec![2, 1], 1).is_err());
    }

    #[test]
    fn test_chunk_overlap() {
        // Saved rows 2..4 of an 8x4 tensor, requested rows 3..7.
        let overlap = chunk_overlap(&[2, 0], &[2, 4], &[3, 0], &[4, 4]).unwrap();
        assert_eq!(overlap.storage_offsets, vec![1, 0]);
        assert_eq!(overlap.dest_offsets, vec![0, 0]);
        assert_eq!(overlap.lengths, vec![1, 4]);

        assert!(chunk_overlap(&[0, 0], &[2, 4], &[2, 0], &[2, 4]).is_none());
    }

    #[test]
    fn test_copy_region_into_destination() {
        let src = matrix_4x4().to_contiguous_bytes();
        let mut dst = vec![0u8; 3 * 3 * 4];

        // Copy the 2x2 block at (1, 2) into (1, 0) of a 3x3 destination.
        copy_region(&src, &[4, 4], &[1, 2], &mut dst, &[3, 3], &[1, 0], &[2, 2], 4).unwrap();

        let out = TensorView::from_bytes(Bytes::from(dst), DType::F32, vec![3, 3])
            .unwrap()
            .to_f32_vec()
            .unwrap();
        assert_eq!(out, vec![0.0, 0.0, 0.0, 6.0, 7.0, 0.0, 10.0, 11.0, 0.0]);
    }

    #[test]
    fn test_copy_region_rejects_overflow() {
        let src = vec![0u8; 16];
        let mut dst = vec![0u8; 16];
        let result = copy_region(&src, &[4], &[2], &mut dst, &[4], &[0], &[3], 4);
        assert!(result.is_err());
    }

    #[test]
    fn test_scalar_copy() {
        let src = 7.5f32.to_le_bytes();
        let mut dst = [0u8; 4];
        copy_region(&src, &[], &[], &mut dst, &[], &[], &[], 4).unwrap();
        assert_eq!(f32::from_le_bytes(dst), 7.5);
    }
}
