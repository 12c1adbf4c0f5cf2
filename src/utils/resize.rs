use burn::tensor::backend::Backend;
use burn::tensor::module::avg_pool2d;
use burn::tensor::{Shape, Tensor};

use crate::error::{DiffusionError, Result};

/// Resizes the two trailing (spatial) dimensions of `tensor` to `size x size`.
///
/// Integer downsampling factors average-pool, integer upsampling factors repeat
/// the nearest pixel. Leading dimensions (batch, channels, frames) are kept.
pub fn resize_spatial<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    size: usize,
) -> Result<Tensor<B, D>> {
    let dims = tensor.dims();
    if D < 3 || size == 0 {
        return Err(resize_error(&dims, size));
    }
    let (height, width) = (dims[D - 2], dims[D - 1]);

    if height == size && width == size {
        Ok(tensor)
    } else if height % size == 0 && width % size == 0 && height / size == width / size {
        Ok(downsample_average(tensor, height / size))
    } else if size % height == 0 && size % width == 0 && size / height == size / width {
        Ok(upsample_nearest(tensor, size / height))
    } else {
        Err(resize_error(&dims, size))
    }
}

fn resize_error(dims: &[usize], size: usize) -> DiffusionError {
    let mut expected = dims.to_vec();
    if expected.len() >= 2 {
        let n = expected.len();
        expected[n - 2] = size;
        expected[n - 1] = size;
    }
    DiffusionError::shape_mismatch(&expected, dims)
}

fn downsample_average<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    factor: usize,
) -> Tensor<B, D> {
    let dims = tensor.dims();
    let (height, width) = (dims[D - 2], dims[D - 1]);
    let leading: usize = dims[..D - 2].iter().product();

    let pooled = avg_pool2d(
        tensor.reshape(Shape::new([leading, 1, height, width])),
        [factor, factor],
        [factor, factor],
        [0, 0],
        true,
    );

    let mut out = dims;
    out[D - 2] = height / factor;
    out[D - 1] = width / factor;
    pooled.reshape(Shape::new(out))
}

fn upsample_nearest<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    factor: usize,
) -> Tensor<B, D> {
    let dims = tensor.dims();
    let (height, width) = (dims[D - 2], dims[D - 1]);
    let leading: usize = dims[..D - 2].iter().product();

    let upsampled = tensor
        .reshape(Shape::new([leading, height, 1, width, 1]))
        .repeat(2, factor)
        .repeat(4, factor);

    let mut out = dims;
    out[D - 2] = height * factor;
    out[D - 1] = width * factor;
    upsampled.reshape(Shape::new(out))
}
