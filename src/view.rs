//! Multi-dimensional views and scratch-size computation
//!
//! A [`View`] is a shared handle to a fixed-shape array with an explicit memory
//! layout. Elements live in 64-bit atomic cells so that kernels executed by the
//! host back-end may write disjoint elements from many threads at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dtype::{DataType, Scalar};
use crate::error::{KernelError, KernelResult};
use crate::policy::{default_space, ExecutionSpace};

/// Maximum number of dimensions of a view
pub const MAX_RANK: usize = 8;

/// Scratch allocations are rounded up to this many bytes
pub const SCRATCH_ALIGNMENT: usize = 8;

/// Memory layout of a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Layout {
    /// Row-major: the last index is contiguous
    #[default]
    LayoutRight,
    /// Column-major: the first index is contiguous
    LayoutLeft,
}

impl Layout {
    pub fn cpp_name(self) -> &'static str {
        match self {
            Layout::LayoutRight => "Kokkos::LayoutRight",
            Layout::LayoutLeft => "Kokkos::LayoutLeft",
        }
    }
}

/// Memory space a view is allocated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemorySpace {
    HostSpace,
    CudaSpace,
    CudaUvmSpace,
    HipSpace,
}

impl MemorySpace {
    pub fn cpp_name(self) -> &'static str {
        match self {
            MemorySpace::HostSpace => "Kokkos::HostSpace",
            MemorySpace::CudaSpace => "Kokkos::CudaSpace",
            MemorySpace::CudaUvmSpace => "Kokkos::CudaUVMSpace",
            MemorySpace::HipSpace => "Kokkos::HIPSpace",
        }
    }

    /// Whether kernels running in `space` can dereference this memory
    pub fn accessible_from(self, space: ExecutionSpace) -> bool {
        match self {
            MemorySpace::HostSpace => space.is_host(),
            MemorySpace::CudaSpace => space == ExecutionSpace::Cuda,
            MemorySpace::CudaUvmSpace => space.is_host() || space == ExecutionSpace::Cuda,
            MemorySpace::HipSpace => space == ExecutionSpace::Hip,
        }
    }
}

/// Type-level description of a view: everything that changes generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewType {
    pub dtype: DataType,
    pub rank: usize,
    pub layout: Layout,
    pub space: MemorySpace,
}

impl std::fmt::Display for ViewType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "View{}D[{}, {:?}, {:?}]", self.rank, self.dtype, self.layout, self.space)
    }
}

/// Backing cells of a view
#[derive(Debug)]
pub(crate) struct ViewStorage {
    cells: Box<[AtomicU64]>,
}

impl ViewStorage {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn len(&self) -> usize {
        self.cells.len()
    }
}

/// Compute the scratch bytes needed by `extents` elements of `dtype`
///
/// `bytes = ceil(size(dtype) * prod(extents) / 8) * 8`
pub fn shmem_size(dtype: DataType, extents: &[usize]) -> KernelResult<usize> {
    let count = extents
        .iter()
        .try_fold(1usize, |acc, &e| acc.checked_mul(e))
        .and_then(|n| n.checked_mul(dtype.size()))
        .ok_or_else(|| KernelError::precondition("scratch size overflows usize"))?;
    Ok(count.div_ceil(SCRATCH_ALIGNMENT) * SCRATCH_ALIGNMENT)
}

/// [`shmem_size`] for an element type given by name, e.g. `"float32"`
pub fn shmem_size_of(type_name: &str, extents: &[usize]) -> KernelResult<usize> {
    shmem_size(DataType::resolve(type_name)?, extents)
}

/// A typed, fixed-shape multi-dimensional array handle
#[derive(Clone)]
pub struct View {
    dtype: DataType,
    extents: Vec<usize>,
    layout: Layout,
    space: MemorySpace,
    storage: Arc<ViewStorage>,
    offset: usize,
}

impl View {
    /// Allocate a zero-initialized view in the default memory space
    pub fn new(dtype: DataType, extents: &[usize]) -> KernelResult<Self> {
        Self::validate_extents(extents)?;
        let len = extents.iter().product();
        Ok(Self {
            dtype,
            extents: extents.to_vec(),
            layout: Layout::default(),
            space: default_space().memory_space(),
            storage: Arc::new(ViewStorage::new(len)),
            offset: 0,
        })
    }

    /// Allocate a view and fill it from row-major data
    pub fn from_slice<T: Into<Scalar> + Copy>(
        dtype: DataType,
        extents: &[usize],
        data: &[T],
    ) -> KernelResult<Self> {
        let view = Self::new(dtype, extents)?;
        if data.len() != view.len() {
            return Err(KernelError::precondition(format!(
                "expected {} values for extents {:?}, got {}",
                view.len(),
                extents,
                data.len()
            )));
        }
        let mut index = vec![0; extents.len()];
        for value in data {
            view.set(&index, *value)?;
            view.advance_row_major(&mut index);
        }
        Ok(view)
    }

    /// Scratch view over a team or thread arena, sharing its cells
    pub(crate) fn scratch(
        dtype: DataType,
        extents: &[usize],
        storage: Arc<ViewStorage>,
        offset: usize,
    ) -> KernelResult<Self> {
        Self::validate_extents(extents)?;
        let len: usize = extents.iter().product();
        if offset + len > storage.len() {
            return Err(KernelError::resource(format!(
                "scratch view of {} elements does not fit the arena",
                len
            )));
        }
        Ok(Self {
            dtype,
            extents: extents.to_vec(),
            layout: Layout::LayoutRight,
            space: MemorySpace::HostSpace,
            storage,
            offset,
        })
    }

    fn validate_extents(extents: &[usize]) -> KernelResult<()> {
        if extents.is_empty() || extents.len() > MAX_RANK {
            return Err(KernelError::precondition(format!(
                "view rank must be between 1 and {}, got {}",
                MAX_RANK,
                extents.len()
            )));
        }
        if let Some(d) = extents.iter().position(|&e| e == 0) {
            return Err(KernelError::precondition(format!(
                "view extents must be positive, extent {} is 0",
                d
            )));
        }
        Ok(())
    }

    /// Set the memory layout, keeping every element at its logical index
    ///
    /// Changing the layout rearranges the elements into fresh storage, so the
    /// result no longer aliases earlier clones of `self`.
    pub fn with_layout(self, layout: Layout) -> Self {
        if layout == self.layout {
            return self;
        }
        let arranged = Self {
            layout,
            storage: Arc::new(ViewStorage::new(self.len())),
            offset: 0,
            ..self.clone()
        };
        let mut index = vec![0; self.rank()];
        for _ in 0..self.len() {
            if let (Ok(from), Ok(to)) = (self.linear_index(&index), arranged.linear_index(&index)) {
                arranged.set_linear(to, self.get_linear(from));
            }
            self.advance_row_major(&mut index);
        }
        arranged
    }

    /// Set the memory space tag
    pub fn with_space(mut self, space: MemorySpace) -> Self {
        self.space = space;
        self
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn rank(&self) -> usize {
        self.extents.len()
    }

    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    pub fn extent(&self, dim: usize) -> Option<usize> {
        self.extents.get(dim).copied()
    }

    pub fn len(&self) -> usize {
        self.extents.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn space(&self) -> MemorySpace {
        self.space
    }

    pub fn view_type(&self) -> ViewType {
        ViewType {
            dtype: self.dtype,
            rank: self.rank(),
            layout: self.layout,
            space: self.space,
        }
    }

    /// Rank, extents and layout all match
    pub fn is_layout_compatible(&self, other: &View) -> bool {
        self.extents == other.extents && self.layout == other.layout
    }

    /// Whether both handles refer to the same elements
    pub fn shares_storage(&self, other: &View) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage) && self.offset == other.offset
    }

    /// Linearize a full multi-index according to the layout
    pub fn linear_index(&self, index: &[usize]) -> KernelResult<usize> {
        if index.len() != self.rank() {
            return Err(KernelError::execution(format!(
                "rank-{} view indexed with {} indices",
                self.rank(),
                index.len()
            )));
        }
        if let Some(d) = (0..index.len()).find(|&d| index[d] >= self.extents[d]) {
            return Err(KernelError::execution(format!(
                "index {} out of bounds for extent {} in dimension {}",
                index[d], self.extents[d], d
            )));
        }

        let linear = match self.layout {
            Layout::LayoutRight => index
                .iter()
                .zip(&self.extents)
                .fold(0, |acc, (&i, &e)| acc * e + i),
            Layout::LayoutLeft => index
                .iter()
                .zip(&self.extents)
                .rev()
                .fold(0, |acc, (&i, &e)| acc * e + i),
        };
        Ok(linear)
    }

    pub(crate) fn get_linear(&self, linear: usize) -> Scalar {
        let bits = self.storage.cells[self.offset + linear].load(Ordering::Relaxed);
        Scalar::from_bits(bits, self.dtype)
    }

    pub(crate) fn set_linear(&self, linear: usize, value: Scalar) {
        self.storage.cells[self.offset + linear].store(value.to_bits(self.dtype), Ordering::Relaxed);
    }

    /// Read one element
    pub fn get(&self, index: &[usize]) -> KernelResult<Scalar> {
        Ok(self.get_linear(self.linear_index(index)?))
    }

    /// Write one element, converted to the view's element type
    pub fn set(&self, index: &[usize], value: impl Into<Scalar>) -> KernelResult<()> {
        self.set_linear(self.linear_index(index)?, value.into());
        Ok(())
    }

    /// Write `value` to every element
    pub fn fill(&self, value: impl Into<Scalar>) {
        let value = value.into();
        for linear in 0..self.len() {
            self.set_linear(linear, value);
        }
    }

    /// Elements in row-major index order, regardless of layout
    pub fn to_vec(&self) -> Vec<Scalar> {
        let mut out = Vec::with_capacity(self.len());
        let mut index = vec![0; self.rank()];
        for _ in 0..self.len() {
            if let Ok(linear) = self.linear_index(&index) {
                out.push(self.get_linear(linear));
            }
            self.advance_row_major(&mut index);
        }
        out
    }

    /// Elements in row-major order as `f64`
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.to_vec().into_iter().map(Scalar::as_f64).collect()
    }

    fn advance_row_major(&self, index: &mut [usize]) {
        for d in (0..index.len()).rev() {
            index[d] += 1;
            if index[d] < self.extents[d] {
                return;
            }
            index[d] = 0;
        }
    }

    /// Elements in memory order as native bytes, for native launches
    pub(crate) fn to_ne_bytes(&self) -> Vec<u8> {
        (0..self.len())
            .flat_map(|linear| self.get_linear(linear).to_ne_bytes(self.dtype))
            .collect()
    }

    /// Overwrite all elements from native bytes in memory order
    pub(crate) fn copy_from_ne_bytes(&self, bytes: &[u8]) {
        let size = self.dtype.size();
        for (linear, chunk) in bytes.chunks_exact(size).take(self.len()).enumerate() {
            self.set_linear(linear, Scalar::from_ne_bytes(chunk, self.dtype));
        }
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("dtype", &self.dtype)
            .field("extents", &self.extents)
            .field("layout", &self.layout)
            .field("space", &self.space)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shmem_size_examples() {
        assert_eq!(shmem_size(DataType::Float32, &[16]).unwrap(), 64);
        assert_eq!(shmem_size(DataType::Float32, &[3]).unwrap(), 16);
        assert_eq!(shmem_size(DataType::Float64, &[4, 3]).unwrap(), 96);
        assert_eq!(shmem_size(DataType::Int8, &[1]).unwrap(), 8);
        assert_eq!(shmem_size_of("float32", &[3]).unwrap(), 16);
    }

    #[test]
    fn test_shmem_size_monotone_and_aligned() {
        for dtype in [DataType::Int8, DataType::Int16, DataType::Float32, DataType::Float64] {
            let mut previous = 0;
            for n in 0..200 {
                let bytes = shmem_size(dtype, &[n]).unwrap();
                assert_eq!(bytes % SCRATCH_ALIGNMENT, 0);
                assert!(bytes >= previous);
                assert!(bytes >= n * dtype.size());
                previous = bytes;
            }
        }
    }

    #[test]
    fn test_shmem_size_unresolvable_type() {
        let err = shmem_size_of("", &[4]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Type);
        assert!(shmem_size_of("quaternion", &[4]).is_err());
    }

    #[test]
    fn test_rejects_bad_extents() {
        assert!(View::new(DataType::Int32, &[]).is_err());
        assert!(View::new(DataType::Int32, &[4, 0]).is_err());
        assert!(View::new(DataType::Int32, &[1; 9]).is_err());
        assert!(View::new(DataType::Int32, &[1; 8]).is_ok());
    }

    #[test]
    fn test_layout_linearization() {
        let right = View::new(DataType::Int32, &[2, 3]).unwrap();
        let left = View::new(DataType::Int32, &[2, 3]).unwrap().with_layout(Layout::LayoutLeft);
        assert_eq!(right.linear_index(&[1, 2]).unwrap(), 5);
        assert_eq!(left.linear_index(&[1, 2]).unwrap(), 5);
        assert_eq!(right.linear_index(&[0, 1]).unwrap(), 1);
        assert_eq!(left.linear_index(&[0, 1]).unwrap(), 2);
        assert!(right.linear_index(&[2, 0]).is_err());
        assert!(!right.is_layout_compatible(&left));
    }

    #[test]
    fn test_get_set_and_row_major_order() {
        let view = View::from_slice(DataType::Float32, &[2, 2], &[1.0f32, 2.0, 3.0, 4.0])
            .unwrap()
            .with_layout(Layout::LayoutRight);
        assert_eq!(view.get(&[1, 0]).unwrap(), Scalar::Float(3.0));
        view.set(&[0, 1], 9.5f32).unwrap();
        assert_eq!(view.to_f64_vec(), vec![1.0, 9.5, 3.0, 4.0]);

        let alias = view.clone();
        alias.fill(0.0f32);
        assert_eq!(view.to_f64_vec(), vec![0.0; 4]);
        assert!(alias.shares_storage(&view));
    }

    #[test]
    fn test_layout_change_keeps_logical_contents() {
        let right = View::from_slice(DataType::Int32, &[2, 3], &[0, 1, 2, 10, 11, 12]).unwrap();
        let left = right.clone().with_layout(Layout::LayoutLeft);
        assert_eq!(left.get(&[0, 1]).unwrap(), Scalar::Int(1));
        assert_eq!(left.get(&[1, 2]).unwrap(), Scalar::Int(12));
        assert_eq!(left.to_f64_vec(), right.to_f64_vec());
        assert_eq!(left.layout(), Layout::LayoutLeft);
        assert!(!left.shares_storage(&right));

        // Column-major storage order
        let bytes = left.to_ne_bytes();
        let stored: Vec<i32> = bytes
            .chunks(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(stored, vec![0, 10, 1, 11, 2, 12]);

        let same = left.clone().with_layout(Layout::LayoutLeft);
        assert!(same.shares_storage(&left));
    }

    #[test]
    fn test_native_bytes_round_trip() {
        let view = View::from_slice(DataType::Int16, &[3], &[-1i32, 2, 3]).unwrap();
        let bytes = view.to_ne_bytes();
        assert_eq!(bytes.len(), 6);
        let copy = View::new(DataType::Int16, &[3]).unwrap();
        copy.copy_from_ne_bytes(&bytes);
        assert_eq!(copy.to_f64_vec(), vec![-1.0, 2.0, 3.0]);
    }
}
