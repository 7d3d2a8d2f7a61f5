use crate::binarize::binarize_csr;
use nalgebra_sparse::CsrMatrix;
use ndarray::Array2;
use rayon::prelude::*;

/// How observed hits are laid out in the padded index matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CountKind {
    /// one slot per nonzero peak (counts collapsed to 1)
    Binary,
    /// each peak index repeated by its integer count
    Counts,
}

/// 1-based index list for one sparse row, laid out per `CountKind`:
/// one slot per positive entry when binary, the index repeated by its
/// rounded count otherwise. Stored non-positive values yield no slot.
pub fn row_index_list(col_indices: &[usize], values: &[f32], kind: CountKind) -> Vec<u32> {
    col_indices
        .iter()
        .zip(values)
        .filter(|(_, &v)| v > 0.0)
        .flat_map(|(&j, &v)| {
            let reps = match kind {
                CountKind::Binary => 1,
                CountKind::Counts => v.round() as usize,
            };
            std::iter::repeat(j as u32 + 1).take(reps)
        })
        .collect()
}

/// Dense `cells x W` matrix of 1-based feature indices, 0-padded.
///
/// W is the maximum number of slots over the rows of *this* matrix, so
/// the padding width is a per-batch quantity. Index 0 is reserved for
/// padding; real feature indices are offset by +1.
pub fn padded_index_matrix(x: &CsrMatrix<f32>, kind: CountKind) -> Array2<u32> {
    let rows: Vec<Vec<u32>> = (0..x.nrows())
        .into_par_iter()
        .map(|i| {
            let row = x.row(i);
            row_index_list(row.col_indices(), row.values(), kind)
        })
        .collect();

    let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);

    let mut out = Array2::<u32>::zeros((x.nrows(), width));
    for (i, row) in rows.into_iter().enumerate() {
        for (j, v) in row.into_iter().enumerate() {
            out[[i, j]] = v;
        }
    }
    out
}

/// Per-row stored counts padded with 0 to the max-nnz width; companion of
/// the count-variant likelihood (index slot j holds the count of the peak
/// whose 1-based index sits at slot j of the binary-width index matrix).
pub fn padded_count_matrix(x: &CsrMatrix<f32>) -> Array2<f32> {
    let width = (0..x.nrows()).map(|i| x.row(i).nnz()).max().unwrap_or(0);

    let mut out = Array2::<f32>::zeros((x.nrows(), width));
    for i in 0..x.nrows() {
        for (j, &v) in x.row(i).values().iter().enumerate() {
            out[[i, j]] = v;
        }
    }
    out
}

/// Encoder-side preprocessing: binarize, then pad. 32-bit indices because
/// the downstream consumer is an embedding lookup.
pub fn preprocess_endog(x: &CsrMatrix<f32>) -> anyhow::Result<Array2<u32>> {
    Ok(padded_index_matrix(&binarize_csr(x)?, CountKind::Binary))
}

/// Likelihood-side preprocessing: binarize, then pad. 64-bit indices
/// because the downstream consumer is a log-probability gather.
pub fn preprocess_exog(x: &CsrMatrix<f32>) -> anyhow::Result<Array2<i64>> {
    let idx = padded_index_matrix(&binarize_csr(x)?, CountKind::Binary);
    Ok(idx.mapv(|v| v as i64))
}
