use ndarray::{Array2, Array3, ArrayD, ArrayViewD, Axis, Dimension, Ix2, IxDyn, Slice, concatenate};

#[derive(Debug, thiserror::Error)]
pub enum NDArrayOperationError {
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
    #[error("out of bounds")]
    OutOfBounds,
    #[error("incompatible shape")]
    IncompatibleShape,
    #[error("shape mismatch: {0}")]
    IncompatibleShapes(String),
    #[error("unsupported operation: {0}")]
    UnimplementedOp(String),
}

/// Resolve a possibly negative ONNX axis against `rank`.
pub fn normalize_axis(axis: i64, rank: usize) -> Result<usize, NDArrayOperationError> {
    let idx = if axis < 0 { axis + rank as i64 } else { axis };
    if idx < 0 || idx >= rank as i64 {
        return Err(NDArrayOperationError::OutOfBounds);
    }
    Ok(idx as usize)
}

/// ONNX Reshape with `allowzero = 0`: a `0` copies the input dimension and a
/// single `-1` is inferred from the remaining element count.
pub fn reshape(tensor: &ArrayD<f64>, shape: &[i64]) -> Result<ArrayD<f64>, NDArrayOperationError> {
    let in_shape = tensor.shape();
    let mut out = Vec::with_capacity(shape.len());
    let mut inferred = None;
    for (i, &d) in shape.iter().enumerate() {
        match d {
            -1 => {
                if inferred.replace(i).is_some() {
                    return Err(NDArrayOperationError::IncompatibleShapes(
                        "more than one inferred dimension".to_string(),
                    ));
                }
                out.push(1);
            }
            0 => out.push(*in_shape.get(i).ok_or(NDArrayOperationError::OutOfBounds)?),
            d if d > 0 => out.push(d as usize),
            _ => return Err(NDArrayOperationError::IncompatibleShape),
        }
    }
    if let Some(i) = inferred {
        let known: usize = out
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, d)| *d)
            .product();
        if known == 0 || tensor.len() % known != 0 {
            return Err(NDArrayOperationError::IncompatibleShapes(format!(
                "cannot reshape {:?} to {:?}",
                in_shape, shape
            )));
        }
        out[i] = tensor.len() / known;
    }
    Ok(tensor.to_shape(IxDyn(&out))?.into_owned())
}

/// ONNX Flatten: collapse to 2D around `axis` (which may equal the rank).
pub fn flatten(tensor: &ArrayD<f64>, axis: i64) -> Result<ArrayD<f64>, NDArrayOperationError> {
    let rank = tensor.ndim();
    let axis = if axis < 0 { axis + rank as i64 } else { axis };
    if axis < 0 || axis > rank as i64 {
        return Err(NDArrayOperationError::OutOfBounds);
    }
    let axis = axis as usize;
    let outer: usize = tensor.shape()[..axis].iter().product();
    let inner: usize = tensor.shape()[axis..].iter().product();
    Ok(tensor.to_shape(IxDyn(&[outer, inner]))?.into_owned())
}

/// ONNX Transpose: permutes the axes of `tensor` according to `perm`.
/// If `perm` is `None`, reverses the axes.
pub fn transpose(tensor: &ArrayD<f64>, perm: Option<Vec<i64>>) -> Result<ArrayD<f64>, NDArrayOperationError> {
    let rank = tensor.ndim();

    let axes: Vec<usize> = if let Some(p) = perm {
        if p.len() != rank {
            return Err(NDArrayOperationError::IncompatibleShape);
        }
        p.iter()
            .map(|&x| normalize_axis(x, rank))
            .collect::<Result<_, _>>()?
    } else {
        (0..rank).rev().collect()
    };

    let mut sorted = axes.clone();
    sorted.sort_unstable();
    if sorted != (0..rank).collect::<Vec<_>>() {
        return Err(NDArrayOperationError::IncompatibleShape);
    }

    Ok(tensor
        .view()
        .permuted_axes(IxDyn(&axes))
        .as_standard_layout()
        .into_owned())
}

/// Concatenate ONNX-style along `dim` for a nonempty slice of inputs of equal rank.
pub fn concat(dim: usize, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>, NDArrayOperationError> {
    let first = inputs.first().ok_or(NDArrayOperationError::OutOfBounds)?;
    let rank = first.ndim();
    if dim >= rank {
        return Err(NDArrayOperationError::OutOfBounds);
    }
    for arr in inputs {
        if arr.ndim() != rank {
            return Err(NDArrayOperationError::IncompatibleShape);
        }
        for (d, &len) in arr.shape().iter().enumerate() {
            if d != dim && first.shape()[d] != len {
                return Err(NDArrayOperationError::IncompatibleShape);
            }
        }
    }
    let views: Vec<ArrayViewD<f64>> = inputs.iter().map(|a| a.view()).collect();
    Ok(concatenate(Axis(dim), &views)?)
}

/// Split along `axis` into consecutive chunks of the given sizes.
pub fn split(tensor: &ArrayD<f64>, axis: usize, sizes: &[usize]) -> Result<Vec<ArrayD<f64>>, NDArrayOperationError> {
    if axis >= tensor.ndim() {
        return Err(NDArrayOperationError::OutOfBounds);
    }
    if sizes.iter().sum::<usize>() != tensor.shape()[axis] {
        return Err(NDArrayOperationError::IncompatibleShapes(format!(
            "split sizes {:?} do not cover axis of length {}",
            sizes,
            tensor.shape()[axis]
        )));
    }
    let mut start = 0;
    let mut out = Vec::with_capacity(sizes.len());
    for &size in sizes {
        let end = start + size;
        out.push(tensor.slice_axis(Axis(axis), Slice::from(start..end)).to_owned());
        start = end;
    }
    Ok(out)
}

/// Equal split sizes for `parts` outputs, with the remainder on the last chunk
/// as ONNX prescribes for uneven splits.
pub fn even_split_sizes(len: usize, parts: usize) -> Vec<usize> {
    if parts == 0 {
        return vec![];
    }
    let chunk = len.div_ceil(parts);
    let mut sizes = Vec::with_capacity(parts);
    let mut remaining = len;
    for _ in 0..parts {
        let size = chunk.min(remaining);
        sizes.push(size);
        remaining -= size;
    }
    sizes
}

/// ONNX Pad in constant mode. `pads` is `[begin_0, .., begin_n, end_0, .., end_n]`.
pub fn pad_constant(tensor: &ArrayD<f64>, pads: &[i64], value: f64) -> Result<ArrayD<f64>, NDArrayOperationError> {
    let rank = tensor.ndim();
    if pads.len() != 2 * rank {
        return Err(NDArrayOperationError::IncompatibleShapes(format!(
            "expected {} pad values, got {}",
            2 * rank,
            pads.len()
        )));
    }
    if pads.iter().any(|&p| p < 0) {
        return Err(NDArrayOperationError::UnimplementedOp("negative pads".to_string()));
    }
    let out_shape: Vec<usize> = (0..rank)
        .map(|d| tensor.shape()[d] + pads[d] as usize + pads[d + rank] as usize)
        .collect();
    let mut out = ArrayD::from_elem(IxDyn(&out_shape), value);
    out.slice_each_axis_mut(|ax| {
        let d = ax.axis.index();
        let begin = pads[d] as usize;
        Slice::from(begin..begin + tensor.shape()[d])
    })
    .assign(tensor);
    Ok(out)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PoolKind {
    Max,
    Average { count_include_pad: bool },
}

/// Sliding-window pooling over the spatial axes of an `[N, C, spatial..]` tensor.
pub fn pool(
    tensor: &ArrayD<f64>,
    kind: PoolKind,
    kernel: &[usize],
    strides: &[usize],
    pads: &[usize],
) -> Result<ArrayD<f64>, NDArrayOperationError> {
    let shape = tensor.shape();
    let spatial = kernel.len();
    if shape.len() != spatial + 2 || strides.len() != spatial || pads.len() != 2 * spatial {
        return Err(NDArrayOperationError::IncompatibleShape);
    }
    let mut out_shape = shape[..2].to_vec();
    for d in 0..spatial {
        let padded = shape[d + 2] + pads[d] + pads[d + spatial];
        if padded < kernel[d] || strides[d] == 0 {
            return Err(NDArrayOperationError::IncompatibleShape);
        }
        out_shape.push((padded - kernel[d]) / strides[d] + 1);
    }
    let offsets: Vec<Vec<usize>> = ndarray::indices(IxDyn(kernel))
        .into_iter()
        .map(|ix| ix.slice().to_vec())
        .collect();
    let volume = offsets.len();

    Ok(ArrayD::from_shape_fn(IxDyn(&out_shape), |out_idx| {
        let out_idx = out_idx.slice();
        let mut src = out_idx.to_vec();
        let mut acc = match kind {
            PoolKind::Max => f64::NEG_INFINITY,
            PoolKind::Average { .. } => 0.0,
        };
        let mut count = 0usize;
        'window: for offset in &offsets {
            for d in 0..spatial {
                let pos = (out_idx[d + 2] * strides[d] + offset[d]) as i64 - pads[d] as i64;
                if pos < 0 || pos >= shape[d + 2] as i64 {
                    continue 'window;
                }
                src[d + 2] = pos as usize;
            }
            let x = tensor[IxDyn(&src)];
            acc = match kind {
                PoolKind::Max => acc.max(x),
                PoolKind::Average { .. } => acc + x,
            };
            count += 1;
        }
        match kind {
            PoolKind::Max => acc,
            PoolKind::Average { count_include_pad: true } => acc / volume as f64,
            PoolKind::Average { count_include_pad: false } => acc / count as f64,
        }
    }))
}

/// Mean over all spatial axes, keeping them as size 1.
pub fn global_average_pool(tensor: &ArrayD<f64>) -> Result<ArrayD<f64>, NDArrayOperationError> {
    let shape = tensor.shape();
    if shape.len() < 2 {
        return Err(NDArrayOperationError::IncompatibleShape);
    }
    let spatial: usize = shape[2..].iter().product();
    let grouped: Array3<f64> = tensor
        .to_shape((shape[0], shape[1], spatial))?
        .into_owned();
    let mean = grouped
        .mean_axis(Axis(2))
        .ok_or(NDArrayOperationError::IncompatibleShape)?;
    let mut out_shape = shape[..2].to_vec();
    out_shape.extend(std::iter::repeat_n(1, shape.len() - 2));
    Ok(mean.to_shape(IxDyn(&out_shape))?.into_owned())
}

/// Nearest-neighbour resize with per-axis scales, asymmetric coordinates, floor rounding.
pub fn resize_nearest(tensor: &ArrayD<f64>, scales: &[f64]) -> Result<ArrayD<f64>, NDArrayOperationError> {
    let shape = tensor.shape();
    if scales.len() != shape.len() || scales.iter().any(|&s| s <= 0.0) {
        return Err(NDArrayOperationError::IncompatibleShape);
    }
    let out_shape: Vec<usize> = shape
        .iter()
        .zip(scales)
        .map(|(&d, &s)| (d as f64 * s).floor() as usize)
        .collect();
    Ok(ArrayD::from_shape_fn(IxDyn(&out_shape), |out_idx| {
        let src: Vec<usize> = out_idx
            .slice()
            .iter()
            .enumerate()
            .map(|(d, &o)| ((o as f64 / scales[d]).floor() as usize).min(shape[d] - 1))
            .collect();
        tensor[IxDyn(&src)]
    }))
}

fn as_matrix(tensor: &ArrayD<f64>) -> Result<Array2<f64>, NDArrayOperationError> {
    Ok(tensor.view().into_dimensionality::<Ix2>()?.to_owned())
}

/// Numpy-style matmul for 1D/2D operands and batched operands with matching
/// (or absent) batch dimensions on the right-hand side.
pub fn matmul(a: &ArrayD<f64>, b: &ArrayD<f64>) -> Result<ArrayD<f64>, NDArrayOperationError> {
    let a_vec = a.ndim() == 1;
    let b_vec = b.ndim() == 1;
    let a = if a_vec { a.to_shape(IxDyn(&[1, a.len()]))?.into_owned() } else { a.clone() };
    let b = if b_vec { b.to_shape(IxDyn(&[b.len(), 1]))?.into_owned() } else { b.clone() };
    if a.ndim() < 2 || b.ndim() < 2 {
        return Err(NDArrayOperationError::IncompatibleShape);
    }
    let (m, k) = (a.shape()[a.ndim() - 2], a.shape()[a.ndim() - 1]);
    let (k2, n) = (b.shape()[b.ndim() - 2], b.shape()[b.ndim() - 1]);
    if k != k2 {
        return Err(NDArrayOperationError::IncompatibleShapes(format!(
            "matmul inner dimensions {} and {}",
            k, k2
        )));
    }
    let batch_shape = a.shape()[..a.ndim() - 2].to_vec();
    if b.ndim() > 2 && b.shape()[..b.ndim() - 2] != batch_shape[..] {
        return Err(NDArrayOperationError::IncompatibleShapes(format!(
            "matmul batch dimensions {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let batches: usize = batch_shape.iter().product();
    let a3 = a.to_shape((batches, m, k))?;
    let b3 = if b.ndim() > 2 { Some(b.to_shape((batches, k, n))?) } else { None };
    let b2 = if b.ndim() == 2 { Some(as_matrix(&b)?) } else { None };

    let mut out = Array3::<f64>::zeros((batches, m, n));
    for i in 0..batches {
        let lhs = a3.index_axis(Axis(0), i);
        let product = match (&b3, &b2) {
            (Some(b3), _) => lhs.dot(&b3.index_axis(Axis(0), i)),
            (None, Some(b2)) => lhs.dot(b2),
            (None, None) => return Err(NDArrayOperationError::IncompatibleShape),
        };
        out.index_axis_mut(Axis(0), i).assign(&product);
    }

    let mut out_shape = batch_shape;
    if !a_vec {
        out_shape.push(m);
    }
    if !b_vec {
        out_shape.push(n);
    }
    Ok(out.to_shape(IxDyn(&out_shape))?.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_reshape_infers_dimension() {
        let x = ArrayD::from_shape_vec(IxDyn(&[2, 3]), (0..6).map(|v| v as f64).collect()).unwrap();
        let y = reshape(&x, &[0, -1, 1]).unwrap();
        assert_eq!(y.shape(), &[2, 3, 1]);
        assert!(reshape(&x, &[-1, -1]).is_err());
    }

    #[test]
    fn test_transpose_default_reverses() {
        let x = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]].into_dyn();
        let y = transpose(&x, None).unwrap();
        assert_eq!(y, array![[1.0, 4.0], [2.0, 5.0], [3.0, 6.0]].into_dyn());
    }

    #[test]
    fn test_pad_constant() {
        let x = array![[1.0, 2.0]].into_dyn();
        let y = pad_constant(&x, &[0, 1, 0, 1], -1.0).unwrap();
        assert_eq!(y, array![[-1.0, 1.0, 2.0, -1.0]].into_dyn());
    }

    #[test]
    fn test_max_and_average_pool() {
        let x = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![1.0, -2.0, 3.0, 0.0]).unwrap();
        let y = pool(&x, PoolKind::Max, &[2, 2], &[1, 1], &[0, 0, 0, 0]).unwrap();
        assert_eq!(y.iter().copied().collect::<Vec<_>>(), vec![3.0]);
        let y = pool(&x, PoolKind::Average { count_include_pad: false }, &[2, 2], &[1, 1], &[0, 0, 0, 0]).unwrap();
        assert_eq!(y.iter().copied().collect::<Vec<_>>(), vec![0.5]);
    }

    #[test]
    fn test_global_average_pool_keeps_dims() {
        let x = ArrayD::from_shape_vec(IxDyn(&[1, 2, 1, 2]), vec![1.0, 3.0, -1.0, -3.0]).unwrap();
        let y = global_average_pool(&x).unwrap();
        assert_eq!(y.shape(), &[1, 2, 1, 1]);
        assert_eq!(y.iter().copied().collect::<Vec<_>>(), vec![2.0, -2.0]);
    }

    #[test]
    fn test_matmul_vector_and_batched() {
        let a = array![1.0, 2.0].into_dyn();
        let b = array![[1.0, 0.0], [0.0, 1.0]].into_dyn();
        assert_eq!(matmul(&a, &b).unwrap(), array![1.0, 2.0].into_dyn());
        let a = ArrayD::from_shape_vec(IxDyn(&[2, 1, 2]), vec![1.0, 1.0, 2.0, 2.0]).unwrap();
        let y = matmul(&a, &b).unwrap();
        assert_eq!(y.shape(), &[2, 1, 2]);
    }

    #[test]
    fn test_even_split_sizes() {
        assert_eq!(even_split_sizes(5, 2), vec![3, 2]);
        assert_eq!(even_split_sizes(4, 2), vec![2, 2]);
    }

    #[test]
    fn test_resize_nearest() {
        let x = array![[1.0, 2.0]].into_dyn();
        let y = resize_nearest(&x, &[1.0, 2.0]).unwrap();
        assert_eq!(y, array![[1.0, 1.0, 2.0, 2.0]].into_dyn());
    }
}
