use anyhow::anyhow;
use nalgebra_sparse::CsrMatrix;

/// Tolerance for deciding whether a stored value is an integer count.
pub const INTEGER_TOL: f32 = 1e-2;

/// Map every stored value of a cells x peaks count matrix to exactly 1.
///
/// The input must carry raw counts: every stored value has to be
/// non-negative and within `INTEGER_TOL` of an integer. Binarization is
/// idempotent since a matrix of ones trivially satisfies the contract.
pub fn binarize_csr(x: &CsrMatrix<f32>) -> anyhow::Result<CsrMatrix<f32>> {
    for &v in x.values() {
        if v < 0.0 || (v - v.round()).abs() > INTEGER_TOL {
            return Err(anyhow!(
                "input data must be raw integer counts; found non-integer value {}",
                v
            ));
        }
    }

    let ones = vec![1.0_f32; x.nnz()];
    CsrMatrix::try_from_pattern_and_values(x.pattern().clone(), ones)
        .map_err(|e| anyhow!("failed to rebuild binarized matrix: {:?}", e))
}
