use anyhow::anyhow;
use log::debug;
use nalgebra_sparse::CsrMatrix;

/// Validate a factors x peaks hit matrix against the model's peak set and
/// collapse its stored values to 1.
pub fn validate_hits_matrix(
    hits: &CsrMatrix<f32>,
    n_peaks: usize,
) -> anyhow::Result<CsrMatrix<f32>> {
    if hits.ncols() != n_peaks {
        return Err(anyhow!(
            "hits matrix has {} columns but the model was fit on {} peaks",
            hits.ncols(),
            n_peaks
        ));
    }

    debug!(
        "validated hits matrix: {} factors x {} peaks, {} nonzeros",
        hits.nrows(),
        hits.ncols(),
        hits.nnz()
    );

    let ones = vec![1.0_f32; hits.nnz()];
    CsrMatrix::try_from_pattern_and_values(hits.pattern().clone(), ones)
        .map_err(|e| anyhow!("failed to rebuild hits matrix: {:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;

    #[test]
    fn rejects_wrong_peak_dimension() {
        let mut coo = CooMatrix::new(2, 4);
        coo.push(0, 1, 1.0);
        let hits = CsrMatrix::from(&coo);
        assert!(validate_hits_matrix(&hits, 5).is_err());
    }

    #[test]
    fn binarizes_hit_values() {
        let mut coo = CooMatrix::new(1, 3);
        coo.push(0, 0, 7.0);
        let hits = CsrMatrix::from(&coo);
        let ok = validate_hits_matrix(&hits, 3).unwrap();
        assert_eq!(ok.values(), &[1.0]);
    }
}
