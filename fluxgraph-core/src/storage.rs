use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{
    bail_value,
    cpu_storage::{self, CpuStorage},
    ensure,
    shape::numel,
    DType, Device, Result,
};

/// A dense, row-major host array tagged with the device it logically lives on.
///
/// Clones share the underlying buffer; writers go through copy-on-write.
#[derive(Clone)]
pub struct NDArray {
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
    storage: Arc<CpuStorage>,
}

/// Local shards of one logical tensor, keyed by the device holding them.
pub type ShardedArray = BTreeMap<Device, NDArray>;

impl NDArray {
    pub fn new(data: Vec<f32>, shape: &[usize], dtype: DType, device: Device) -> Result<Self> {
        if data.len() != numel(shape) {
            bail_value!(
                "buffer of {} elements cannot hold shape {shape:?}",
                data.len()
            );
        }
        Ok(Self {
            shape: shape.to_vec(),
            dtype,
            device,
            storage: Arc::new(CpuStorage(data)),
        })
    }

    /// An `f32` array on the host device.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        Self::new(data, shape, DType::F32, Device::host())
    }

    pub fn scalar(value: f32) -> Self {
        Self::full(&[], value, DType::F32, Device::host())
    }

    pub fn full(shape: &[usize], value: f32, dtype: DType, device: Device) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
            device,
            storage: Arc::new(CpuStorage(vec![value; numel(shape)])),
        }
    }

    pub fn zeros(shape: &[usize], dtype: DType, device: Device) -> Self {
        Self::full(shape, 0., dtype, device)
    }

    pub fn ones(shape: &[usize], dtype: DType, device: Device) -> Self {
        Self::full(shape, 1., dtype, device)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    pub fn data(&self) -> &[f32] {
        self.storage.as_slice()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.storage.as_slice().to_vec()
    }

    /// The single element of a one-element array.
    pub fn item(&self) -> Result<f32> {
        ensure!(self.numel() == 1, "item() on array of shape {:?}", self.shape);
        Ok(self.data()[0])
    }

    /// The same buffer, re-tagged for another device.
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            device,
            ..self.clone()
        }
    }

    pub fn with_dtype(&self, dtype: DType) -> Self {
        Self {
            dtype,
            ..self.clone()
        }
    }

    pub(crate) fn from_parts(data: Vec<f32>, shape: Vec<usize>, like: &NDArray) -> Self {
        Self {
            shape,
            dtype: like.dtype,
            device: like.device,
            storage: Arc::new(CpuStorage(data)),
        }
    }

    /// Copy out the box `[begin, begin + size)`.
    pub fn slice(&self, begin: &[usize], size: &[usize]) -> Result<Self> {
        if begin.len() != self.shape.len() || size.len() != self.shape.len() {
            bail_value!(
                "slice rank mismatch: array {:?}, begin {begin:?}, size {size:?}",
                self.shape
            );
        }
        for d in 0..self.shape.len() {
            if begin[d] + size[d] > self.shape[d] {
                bail_value!(
                    "slice [{begin:?} + {size:?}] exceeds array shape {:?}",
                    self.shape
                );
            }
        }
        let data = cpu_storage::copy_box(self.data(), &self.shape, begin, size);
        Ok(Self::from_parts(data, size.to_vec(), self))
    }

    /// Add `src` into the box of this array starting at `offset`.
    pub fn add_at(&mut self, offset: &[usize], src: &NDArray) -> Result<()> {
        if offset.len() != self.shape.len() || src.shape.len() != self.shape.len() {
            bail_value!(
                "cannot place array of shape {:?} at {offset:?} into shape {:?}",
                src.shape,
                self.shape
            );
        }
        for d in 0..self.shape.len() {
            if offset[d] + src.shape[d] > self.shape[d] {
                bail_value!(
                    "piece of shape {:?} at {offset:?} exceeds array shape {:?}",
                    src.shape,
                    self.shape
                );
            }
        }
        let storage = Arc::make_mut(&mut self.storage);
        cpu_storage::add_box(&mut storage.0, &self.shape, offset, src.data(), &src.shape);
        Ok(())
    }

    /// Concatenate along the leading axis. Scalars are stacked into a rank-1 array.
    pub fn concat(arrays: &[NDArray]) -> Result<Self> {
        let Some(first) = arrays.first() else {
            bail_value!("cannot concatenate zero arrays");
        };
        let mut data = Vec::with_capacity(arrays.iter().map(NDArray::numel).sum());
        for arr in arrays {
            if arr.shape.len() != first.shape.len()
                || (!arr.shape.is_empty() && arr.shape[1..] != first.shape[1..])
            {
                bail_value!(
                    "cannot concatenate shapes {:?} and {:?}",
                    first.shape,
                    arr.shape
                );
            }
            data.extend_from_slice(arr.data());
        }
        let shape = if first.shape.is_empty() {
            vec![arrays.len()]
        } else {
            let mut s = first.shape.clone();
            s[0] = arrays.iter().map(|a| a.shape[0]).sum();
            s
        };
        Ok(Self::from_parts(data, shape, first))
    }

    /// Split along the leading axis into `n` equal chunks.
    pub fn chunk(&self, n: usize) -> Result<Vec<Self>> {
        let Some(&lead) = self.shape.first() else {
            bail_value!("cannot split a scalar into {n} micro batches");
        };
        if n == 0 || lead % n != 0 {
            bail_value!("leading dimension {lead} is not divisible into {n} micro batches");
        }
        let step = lead / n;
        let mut size = self.shape.clone();
        size[0] = step;
        (0..n)
            .map(|i| {
                let mut begin = vec![0; self.shape.len()];
                begin[0] = i * step;
                self.slice(&begin, &size)
            })
            .collect()
    }

    pub fn allclose(&self, other: &NDArray, tol: f32) -> bool {
        self.shape == other.shape
            && self
                .data()
                .iter()
                .zip(other.data())
                .all(|(a, b)| (a - b).abs() <= tol * (1. + b.abs()))
    }
}

impl fmt::Debug for NDArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 8;
        let data = self.data();
        write!(
            f,
            "NDArray({:?}, {}, {}, {:?}{})",
            self.shape,
            self.dtype,
            self.device,
            &data[..data.len().min(PREVIEW)],
            if data.len() > PREVIEW { "..." } else { "" }
        )
    }
}
