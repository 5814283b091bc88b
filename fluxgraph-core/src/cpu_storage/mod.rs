use gemm::{gemm, Parallelism};
use rayon::iter::{
    IndexedParallelIterator, IntoParallelRefIterator, IntoParallelRefMutIterator, ParallelIterator,
};

use crate::{ensure, shape::contiguous_strides, Result};

mod init;

pub use init::Initializer;

/// Host buffer backing an [`crate::NDArray`]. Every dtype is held as `f32`.
#[derive(Clone, Debug, PartialEq)]
pub struct CpuStorage(pub(crate) Vec<f32>);

impl CpuStorage {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

pub(crate) fn map_unary<F>(src: &[f32], f: F) -> Vec<f32>
where
    F: Fn(f32) -> f32 + Sync + Send,
{
    let mut out = src.to_vec();
    out.par_iter_mut().for_each(|x| *x = f(*x));
    out
}

pub(crate) fn zip_binary<F>(lhs: &[f32], rhs: &[f32], f: F) -> Vec<f32>
where
    F: Fn(f32, f32) -> f32 + Sync + Send,
{
    let mut out = lhs.to_vec();
    out.par_iter_mut()
        .zip(rhs.par_iter())
        .for_each(|(x, y)| *x = f(*x, *y));
    out
}

pub(crate) fn sum_all(src: &[f32]) -> f32 {
    src.par_iter().sum()
}

/// Elementwise sum of equally sized buffers.
pub(crate) fn sum_n(srcs: &[&[f32]]) -> Vec<f32> {
    let mut out = vec![0f32; srcs.first().map(|s| s.len()).unwrap_or(0)];
    for src in srcs {
        out.par_iter_mut()
            .zip(src.par_iter())
            .for_each(|(x, y)| *x += *y);
    }
    out
}

/// `C[m, n] = op(A) @ op(B)` for row-major rank-2 operands.
///
/// `a` is stored as `[m, k]` (or `[k, m]` when `trans_a`), `b` as `[k, n]`
/// (or `[n, k]` when `trans_b`).
#[allow(clippy::too_many_arguments)]
pub(crate) fn matmul(
    a: &[f32],
    b: &[f32],
    m: usize,
    k: usize,
    n: usize,
    trans_a: bool,
    trans_b: bool,
    threads: usize,
) -> Result<Vec<f32>> {
    ensure!(a.len() == m * k, "lhs holds {} elements, expected {}", a.len(), m * k);
    ensure!(b.len() == k * n, "rhs holds {} elements, expected {}", b.len(), k * n);
    let mut out = vec![0f32; m * n];
    if m == 0 || n == 0 || k == 0 {
        return Ok(out);
    }
    let parallelism = if threads > 1 {
        Parallelism::Rayon(threads)
    } else {
        Parallelism::None
    };

    // cs = stride between columns, rs = stride between rows of the logical view.
    let (lhs_cs, lhs_rs) = if trans_a { (m, 1) } else { (1, k) };
    let (rhs_cs, rhs_rs) = if trans_b { (k, 1) } else { (1, n) };
    let (dst_cs, dst_rs) = (1, n);

    unsafe {
        gemm(
            /* m: usize = */ m,
            /* n: usize = */ n,
            /* k: usize = */ k,
            /* dst: *mut T = */ out.as_mut_ptr(),
            /* dst_cs: isize = */ dst_cs as isize,
            /* dst_rs: isize = */ dst_rs as isize,
            /* read_dst: bool = */ false,
            /* lhs: *const T = */ a.as_ptr(),
            /* lhs_cs: isize = */ lhs_cs as isize,
            /* lhs_rs: isize = */ lhs_rs as isize,
            /* rhs: *const T = */ b.as_ptr(),
            /* rhs_cs: isize = */ rhs_cs as isize,
            /* rhs_rs: isize = */ rhs_rs as isize,
            /* alpha: T = */ 0f32,
            /* beta: T = */ 1f32,
            /* conj_dst: bool = */ false,
            /* conj_lhs: bool = */ false,
            /* conj_rhs: bool = */ false,
            parallelism,
        )
    }
    Ok(out)
}

/// Visit every index tuple of `size` in row-major order, handing the flat
/// offsets into `a_shape` (shifted by `a_begin`) and `b_shape` (shifted by
/// `b_begin`) for each contiguous run along the last axis.
fn for_each_run<F>(
    size: &[usize],
    a_shape: &[usize],
    a_begin: &[usize],
    b_shape: &[usize],
    b_begin: &[usize],
    mut f: F,
) where
    F: FnMut(usize, usize, usize),
{
    if size.iter().any(|d| *d == 0) {
        return;
    }
    if size.is_empty() {
        f(0, 0, 1);
        return;
    }
    let a_strides = contiguous_strides(a_shape);
    let b_strides = contiguous_strides(b_shape);
    let rank = size.len();
    let run = size[rank - 1];
    let mut idx = vec![0usize; rank - 1];
    loop {
        let mut a_off = a_begin[rank - 1];
        let mut b_off = b_begin[rank - 1];
        for d in 0..rank - 1 {
            a_off += (idx[d] + a_begin[d]) * a_strides[d];
            b_off += (idx[d] + b_begin[d]) * b_strides[d];
        }
        f(a_off, b_off, run);

        let mut d = rank - 1;
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < size[d] {
                break;
            }
            idx[d] = 0;
        }
    }
}

/// Copy the box `[begin, begin + size)` out of a buffer of shape `shape`.
pub(crate) fn copy_box(src: &[f32], shape: &[usize], begin: &[usize], size: &[usize]) -> Vec<f32> {
    let mut out = Vec::with_capacity(size.iter().product());
    let zeros = vec![0; size.len()];
    for_each_run(size, shape, begin, size, &zeros, |src_off, _, run| {
        out.extend_from_slice(&src[src_off..src_off + run]);
    });
    out
}

/// Accumulate `src` (shape `src_shape`) into `dst` (shape `dst_shape`) at `offset`.
pub(crate) fn add_box(
    dst: &mut [f32],
    dst_shape: &[usize],
    offset: &[usize],
    src: &[f32],
    src_shape: &[usize],
) {
    let zeros = vec![0; src_shape.len()];
    for_each_run(src_shape, dst_shape, offset, src_shape, &zeros, |dst_off, src_off, run| {
        for (d, s) in dst[dst_off..dst_off + run]
            .iter_mut()
            .zip(&src[src_off..src_off + run])
        {
            *d += *s;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_copy_and_accumulate() {
        // 3x4 matrix 0..12
        let src: Vec<f32> = (0..12).map(|x| x as f32).collect();
        let b = copy_box(&src, &[3, 4], &[1, 1], &[2, 2]);
        assert_eq!(b, vec![5., 6., 9., 10.]);

        let mut dst = vec![0f32; 12];
        add_box(&mut dst, &[3, 4], &[1, 2], &b, &[2, 2]);
        add_box(&mut dst, &[3, 4], &[1, 2], &b, &[2, 2]);
        assert_eq!(dst[6], 10.);
        assert_eq!(dst[11], 20.);
        assert_eq!(dst.iter().sum::<f32>(), 60.);
    }

    #[test]
    fn scalar_boxes() {
        assert_eq!(copy_box(&[4.], &[], &[], &[]), vec![4.]);
        let mut dst = vec![1.];
        add_box(&mut dst, &[], &[], &[2.], &[]);
        assert_eq!(dst, vec![3.]);
    }

    #[test]
    fn gemm_with_transposes() {
        // a = [[1, 2], [3, 4]], b = [[5, 6], [7, 8]]
        let a = [1., 2., 3., 4.];
        let b = [5., 6., 7., 8.];
        assert_eq!(
            matmul(&a, &b, 2, 2, 2, false, false, 1).unwrap(),
            vec![19., 22., 43., 50.]
        );
        // a^T @ b = [[1, 3], [2, 4]] @ b
        assert_eq!(
            matmul(&a, &b, 2, 2, 2, true, false, 1).unwrap(),
            vec![26., 30., 38., 44.]
        );
        // a @ b^T
        assert_eq!(
            matmul(&a, &b, 2, 2, 2, false, true, 1).unwrap(),
            vec![17., 23., 39., 53.]
        );
    }
}
