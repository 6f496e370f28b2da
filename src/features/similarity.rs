//! Batch similarity matrices
//!
//! Every distillation loss in this crate compares how samples in a batch
//! relate to each other rather than raw feature values. The building block is
//! the B×B similarity matrix of one layer's activations.

use crate::error::{Error, Result};
use ndarray::{Array2, Array3, ArrayD, Axis};

/// Lower bound on the norm used when normalizing, so zero rows stay zero
pub const NORM_EPS: f32 = 1e-12;

/// How a layer's activation is summarized before comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pooling {
    /// Mean of squares over channels, flattened spatially
    ///
    /// Produces a per-sample spatial energy map, so layers with different
    /// channel counts remain comparable.
    Attention,
    /// All non-batch dimensions flattened directly
    Flat,
}

/// Flatten every non-batch dimension: (B, ...) → (B, D)
pub(crate) fn flatten_batch(f: &ArrayD<f32>) -> Result<Array2<f32>> {
    if f.ndim() < 2 || f.shape()[0] == 0 {
        return Err(Error::InvalidParameter(format!(
            "expected a batched tensor, got shape {:?}",
            f.shape()
        )));
    }
    let batch = f.shape()[0];
    let dim = f.len() / batch;
    Array2::from_shape_vec((batch, dim), f.iter().copied().collect())
        .map_err(|_| Error::shape(&[batch, dim], f.shape()))
}

/// L2-normalize each row: x / max(‖x‖₂, ε)
pub fn l2_normalize_rows(mut x: Array2<f32>) -> Array2<f32> {
    for mut row in x.axis_iter_mut(Axis(0)) {
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        let denom = norm.max(NORM_EPS);
        row.mapv_inplace(|v| v / denom);
    }
    x
}

/// Per-sample flattened, L2-normalized representation: (B, D)
pub fn flat_normalized(f: &ArrayD<f32>) -> Result<Array2<f32>> {
    Ok(l2_normalize_rows(flatten_batch(f)?))
}

/// Per-sample attention map: (B, C, H, W) → (B, H·W), L2-normalized
///
/// Channel energy is averaged over channels; a sum would give the same
/// result after normalization.
pub fn attention_map(f: &ArrayD<f32>) -> Result<Array2<f32>> {
    Ok(l2_normalize_rows(channel_energy(f)?))
}

/// Mean of squares over the channel axis: (B, C, ...) → (B, S)
fn channel_energy(f: &ArrayD<f32>) -> Result<Array2<f32>> {
    let (batch, channels, spatial) = attention_dims(f)?;
    let cube = Array3::from_shape_vec(
        (batch, channels, spatial),
        f.iter().map(|v| v * v).collect(),
    )
    .map_err(|_| Error::shape(&[batch, channels, spatial], f.shape()))?;

    cube.mean_axis(Axis(1))
        .ok_or_else(|| Error::InvalidParameter("zero channels".to_string()))
}

fn attention_dims(f: &ArrayD<f32>) -> Result<(usize, usize, usize)> {
    if f.ndim() < 3 || f.shape()[0] == 0 || f.shape()[1] == 0 {
        return Err(Error::InvalidParameter(format!(
            "attention pooling needs a (batch, channels, ...) tensor, got shape {:?}",
            f.shape()
        )));
    }
    let (batch, channels) = (f.shape()[0], f.shape()[1]);
    Ok((batch, channels, f.len() / (batch * channels)))
}

/// Gradient through [`l2_normalize_rows`]
///
/// `x` is the input that was normalized, `grad` the gradient with respect to
/// the normalized rows. Rows with norm above [`NORM_EPS`] use the projection
/// `(g − y (y·g)) / ‖x‖`; smaller rows were divided by the constant ε.
pub fn l2_normalize_rows_backward(x: &Array2<f32>, grad: &Array2<f32>) -> Result<Array2<f32>> {
    if x.shape() != grad.shape() {
        return Err(Error::shape(x.shape(), grad.shape()));
    }
    let mut out = grad.clone();
    for (x_row, mut g_row) in x.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
        let norm = x_row.dot(&x_row).sqrt();
        if norm > NORM_EPS {
            let y_dot_g = x_row.dot(&g_row) / norm;
            g_row.zip_mut_with(&x_row, |g, &xv| *g = (*g - xv / norm * y_dot_g) / norm);
        } else {
            g_row.mapv_inplace(|g| g / NORM_EPS);
        }
    }
    Ok(out)
}

/// Gradient of [`flat_normalized`] with respect to its input tensor
pub fn flat_normalized_backward(f: &ArrayD<f32>, grad: &Array2<f32>) -> Result<ArrayD<f32>> {
    let flat = flatten_batch(f)?;
    let d_flat = l2_normalize_rows_backward(&flat, grad)?;
    ArrayD::from_shape_vec(f.raw_dim(), d_flat.iter().copied().collect())
        .map_err(|_| Error::shape(f.shape(), d_flat.shape()))
}

/// Gradient of [`attention_map`] with respect to its input tensor
pub fn attention_map_backward(f: &ArrayD<f32>, grad: &Array2<f32>) -> Result<ArrayD<f32>> {
    let (batch, channels, spatial) = attention_dims(f)?;
    let energy = channel_energy(f)?;
    let d_energy = l2_normalize_rows_backward(&energy, grad)?;

    // energy = mean_c f² ⇒ ∂energy/∂f = 2f / C
    let scale = 2.0 / channels as f32;
    let values: Vec<f32> = f
        .iter()
        .enumerate()
        .map(|(idx, &v)| {
            let b = idx / (channels * spatial);
            let s = idx % spatial;
            d_energy[[b, s]] * scale * v
        })
        .collect();
    ArrayD::from_shape_vec(f.raw_dim(), values)
        .map_err(|_| Error::shape(f.shape(), &[batch, channels, spatial]))
}

fn pool(f: &ArrayD<f32>, pooling: Pooling) -> Result<Array2<f32>> {
    match pooling {
        Pooling::Attention => attention_map(f),
        Pooling::Flat => flat_normalized(f),
    }
}

/// Compute the B×B similarity matrix of one activation tensor
///
/// Rows of the pooled representation are normalized, their Gram matrix is
/// taken (cosine similarities), and the Gram matrix is normalized row-wise
/// once more. Rows of the result have unit L2 norm; the matrix is not
/// necessarily symmetric.
///
/// # Example
///
/// ```
/// use destilar::features::{similarity_matrix, Pooling};
/// use ndarray::{ArrayD, IxDyn};
///
/// let f = ArrayD::from_shape_fn(IxDyn(&[3, 2, 4, 4]), |idx| (idx[0] + idx[2]) as f32);
/// let sim = similarity_matrix(&f, Pooling::Attention).unwrap();
/// assert_eq!(sim.shape(), &[3, 3]);
/// ```
pub fn similarity_matrix(f: &ArrayD<f32>, pooling: Pooling) -> Result<Array2<f32>> {
    let rows = pool(f, pooling)?;
    let gram = rows.dot(&rows.t());
    Ok(l2_normalize_rows(gram))
}

/// Gradient of [`similarity_matrix`] with respect to the activation tensor
///
/// `grad` is the B×B gradient with respect to the similarity matrix.
pub fn similarity_matrix_backward(
    f: &ArrayD<f32>,
    pooling: Pooling,
    grad: &Array2<f32>,
) -> Result<ArrayD<f32>> {
    let rows = pool(f, pooling)?;
    let gram = rows.dot(&rows.t());
    let d_gram = l2_normalize_rows_backward(&gram, grad)?;

    // G = R Rᵀ ⇒ dR = (dG + dGᵀ) R
    let d_rows = (&d_gram + &d_gram.t()).dot(&rows);
    match pooling {
        Pooling::Attention => attention_map_backward(f, &d_rows),
        Pooling::Flat => flat_normalized_backward(f, &d_rows),
    }
}

/// Similarity matrices for a group of layers, all with the same pooling
pub fn similarity_matrices<'a, I>(group: I, pooling: Pooling) -> Result<Vec<Array2<f32>>>
where
    I: IntoIterator<Item = &'a ArrayD<f32>>,
{
    group
        .into_iter()
        .map(|f| similarity_matrix(f, pooling))
        .collect()
}
