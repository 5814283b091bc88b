//! Redistribution planning: which boxes of which source shards every
//! destination shard is assembled from.

use std::collections::HashMap;

use crate::{
    bail_runtime, bail_value,
    comm::{CommBackend, Transfer},
    dist_states::Region,
    ensure, Device, Layout, NDArray, Result, ShardedArray,
};

/// One box copied from a source shard into a destination shard. Offsets are
/// local to the respective shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub src: Device,
    pub src_offset: Vec<usize>,
    pub dst: Device,
    pub dst_offset: Vec<usize>,
    pub size: Vec<usize>,
}

impl Piece {
    pub fn is_local(&self) -> bool {
        self.src == self.dst
    }

    pub fn numel(&self) -> usize {
        self.size.iter().product()
    }
}

fn check_layout(layout: &Layout) -> Result<()> {
    ensure!(
        layout.ds.device_num() == layout.group.num_devices(),
        "states {:?} describe {} devices but group {} has {}",
        layout.ds,
        layout.ds.device_num(),
        layout.group,
        layout.group.num_devices()
    );
    Ok(())
}

/// Plan moving a tensor of global `shape` from layout `src` to layout `dst`.
///
/// Each destination shard receives, for every partial addend of the source,
/// the intersecting boxes of one replica. A replica on the destination device
/// itself is preferred; otherwise the replica that has sent the fewest
/// elements so far. Destination devices with a partial index above zero hold
/// zeros and receive nothing.
pub fn plan_redistribution(shape: &[usize], src: &Layout, dst: &Layout) -> Result<Vec<Piece>> {
    check_layout(src)?;
    check_layout(dst)?;

    // Distinct source boxes with every replica holding them.
    let mut boxes: Vec<(usize, Region, Vec<Device>)> = Vec::new();
    for (i, dev) in src.group.devices().iter().enumerate() {
        let region = src.ds.local_region(shape, i)?;
        let q = src.ds.partial_index(i);
        match boxes.iter_mut().find(|(bq, r, _)| *bq == q && *r == region) {
            Some((_, _, replicas)) => replicas.push(*dev),
            None => boxes.push((q, region, vec![*dev])),
        }
    }

    let mut load: HashMap<Device, usize> = HashMap::new();
    let mut pieces = Vec::new();
    for (j, dev) in dst.group.devices().iter().enumerate() {
        if dst.ds.partial_index(j) > 0 {
            continue;
        }
        let want = dst.ds.local_region(shape, j)?;
        for (_, region, replicas) in &boxes {
            let Some(inter) = region.intersect(&want) else {
                continue;
            };
            let from = if replicas.contains(dev) {
                *dev
            } else {
                let Some(least) = replicas
                    .iter()
                    .min_by_key(|d| load.get(*d).copied().unwrap_or(0))
                else {
                    bail_runtime!("source box {region:?} has no replica");
                };
                *load.entry(*least).or_default() += inter.numel();
                *least
            };
            pieces.push(Piece {
                src: from,
                src_offset: inter.offset_from(&region.offset),
                dst: *dev,
                dst_offset: inter.offset_from(&want.offset),
                size: inter.size,
            });
        }
    }
    Ok(pieces)
}

fn any_shard(shards: &ShardedArray) -> Result<&NDArray> {
    match shards.values().next() {
        Some(a) => Ok(a),
        None => bail_value!("sharded array holds no shards"),
    }
}

fn shard_on(shards: &ShardedArray, device: Device) -> Result<&NDArray> {
    match shards.get(&device) {
        Some(a) => Ok(a),
        None => bail_runtime!("no shard on {device}"),
    }
}

/// Move `shards` from layout `src` to layout `dst`, posting every remote piece
/// in one batch on `comm`.
pub fn redistribute(
    shape: &[usize],
    shards: &ShardedArray,
    src: &Layout,
    dst: &Layout,
    comm: &dyn CommBackend,
) -> Result<ShardedArray> {
    let dtype = any_shard(shards)?.dtype();
    let pieces = plan_redistribution(shape, src, dst)?;
    let mut out = ShardedArray::new();
    for (j, dev) in dst.group.devices().iter().enumerate() {
        let local = dst.ds.local_region(shape, j)?.size;
        out.insert(*dev, NDArray::zeros(&local, dtype, *dev));
    }

    let mut transfers = Vec::new();
    let mut targets = Vec::new();
    for p in &pieces {
        let part = shard_on(shards, p.src)?.slice(&p.src_offset, &p.size)?;
        if p.is_local() {
            if let Some(o) = out.get_mut(&p.dst) {
                o.add_at(&p.dst_offset, &part)?;
            }
        } else {
            transfers.push(Transfer {
                src: p.src,
                dst: p.dst,
                data: part,
            });
            targets.push((p.dst, p.dst_offset.clone()));
        }
    }
    let received = comm.batched_isend_irecv(transfers)?;
    ensure!(received.len() == targets.len());
    for (arr, (dev, offset)) in received.iter().zip(targets) {
        if let Some(o) = out.get_mut(&dev) {
            o.add_at(&offset, arr)?;
        }
    }
    Ok(out)
}

/// Assemble the global value of a sharded tensor on the host.
pub fn gather(shape: &[usize], shards: &ShardedArray, layout: &Layout) -> Result<NDArray> {
    let dtype = any_shard(shards)?.dtype();
    let host = Layout::single(Device::host());
    let mut out = NDArray::zeros(shape, dtype, Device::host());
    for p in plan_redistribution(shape, layout, &host)? {
        let part = shard_on(shards, p.src)?.slice(&p.src_offset, &p.size)?;
        out.add_at(&p.dst_offset, &part)?;
    }
    Ok(out)
}

/// Cut a global value into the shards of `layout`. Partial addends beyond the
/// first are zeros.
pub fn scatter(value: &NDArray, layout: &Layout) -> Result<ShardedArray> {
    check_layout(layout)?;
    let mut out = ShardedArray::new();
    for (i, dev) in layout.group.devices().iter().enumerate() {
        let region = layout.ds.local_region(value.shape(), i)?;
        let shard = if layout.ds.partial_index(i) > 0 {
            NDArray::zeros(&region.size, value.dtype(), *dev)
        } else {
            value.slice(&region.offset, &region.size)?.to_device(*dev)
        };
        out.insert(*dev, shard);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceGroup, DistributedStates, LocalComm};

    fn layout(n: usize, ds: DistributedStates) -> Layout {
        Layout::new(DeviceGroup::cuda_range(0, n), ds)
    }

    #[test]
    fn duplicate_to_split_is_all_local() {
        let pieces = plan_redistribution(
            &[4, 4],
            &layout(2, DistributedStates::duplicate(2)),
            &layout(2, DistributedStates::split(2, 1)),
        )
        .unwrap();
        assert_eq!(pieces.len(), 2);
        assert!(pieces.iter().all(Piece::is_local));
        assert_eq!(pieces[1].src_offset, vec![0, 2]);
        assert_eq!(pieces[1].dst_offset, vec![0, 0]);
    }

    #[test]
    fn split_to_split_on_another_axis() {
        let pieces = plan_redistribution(
            &[4, 4],
            &layout(2, DistributedStates::split(2, 0)),
            &layout(2, DistributedStates::split(2, 1)),
        )
        .unwrap();
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces.iter().filter(|p| !p.is_local()).count(), 2);
        assert!(pieces.iter().all(|p| p.size == vec![2, 2]));
    }

    #[test]
    fn partial_sources_are_summed_and_round_trip() {
        let value = NDArray::from_vec((0..8).map(|x| x as f32).collect(), &[2, 4]).unwrap();
        let comm = LocalComm::new();
        let src = layout(2, DistributedStates::split(2, 1));
        let shards = scatter(&value, &src).unwrap();

        let dup = layout(2, DistributedStates::duplicate(2));
        let moved = redistribute(&[2, 4], &shards, &src, &dup, &comm).unwrap();
        assert_eq!(moved[&Device::cuda(1)].to_vec(), value.to_vec());
        assert_eq!(comm.stats().batches, 1);
        assert_eq!(comm.stats().messages, 2);

        let partial = layout(2, DistributedStates::partial(2));
        let halves = scatter(&value, &partial).unwrap();
        assert_eq!(halves[&Device::cuda(1)].to_vec(), vec![0.; 8]);
        let back = gather(&[2, 4], &halves, &partial).unwrap();
        assert_eq!(back.to_vec(), value.to_vec());
    }
}
