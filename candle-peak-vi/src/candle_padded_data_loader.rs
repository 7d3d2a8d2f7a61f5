#![allow(dead_code)]

use candle_core::{Device, Tensor};
use nalgebra_sparse::CsrMatrix;
use ndarray::Array2;
use peak_matrix::binarize::INTEGER_TOL;
use peak_matrix::padded::{row_index_list, CountKind};
use rand::prelude::SliceRandom;

/// One minibatch on the target device. `endog_nw` holds 1-based padded
/// feature indexes where `0` marks an empty slot; its width is the
/// largest number of slots within this batch, so widths differ across
/// batches. In the count modality each index is repeated by its count so
/// the encoder pools count-weighted embeddings, while `exog_nw` keeps one
/// slot per peak paired with `counts_nw` for the likelihood gather.
pub struct PaddedMinibatch {
    pub endog_nw: Tensor,
    /// compact 1-based indexes for the count likelihood (count modality only)
    pub exog_nw: Option<Tensor>,
    /// per-slot counts aligned with `exog_nw` (count modality only)
    pub counts_nw: Option<Tensor>,
    /// dense counts for the negative-binomial output head
    pub exog_nd: Option<Tensor>,
    pub read_depth_n1: Tensor,
    pub covariates_nc: Option<Tensor>,
    pub extra_ne: Option<Tensor>,
}

/// `PaddedDataLoader` for minibatch learning over sparse hit lists
pub trait PaddedDataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<PaddedMinibatch>;

    fn num_minibatch(&self) -> usize;

    fn num_cells(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize);

    /// partition cells in their stored order, for evaluation passes
    fn sequential_minibatch(&mut self, batch_size: usize);
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
pub struct Minibatches {
    pub samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        let mut rng = rand::rng();
        self.samples.shuffle(&mut rng);

        self.chunks = self
            .samples
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
    }

    pub fn sequential_minibatch(&mut self, batch_size: usize) {
        let n = self.samples.len();
        self.chunks = (0..n)
            .collect::<Vec<_>>()
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

struct CellRecord {
    /// encoder-side 1-based indexes; the count modality repeats each by
    /// its integer count
    endog: Vec<u32>,
    /// compact (index, count) pairs for the count likelihood
    compact: Option<(Vec<u32>, Vec<f32>)>,
    read_depth: f32,
}

///
/// In-memory loader over a cells-by-features sparse matrix. Each cell
/// keeps its list of hit indexes so minibatches can be padded to the
/// batch-local width rather than the global one.
///
pub struct PaddedInMemoryData {
    cells: Vec<CellRecord>,
    n_features: usize,
    exog: Option<Array2<f32>>,
    covariates: Option<Array2<f32>>,
    extra: Option<Array2<f32>>,
    minibatches: Minibatches,
}

impl PaddedInMemoryData {
    ///
    /// Create a loader from a cells-by-features count matrix. With
    /// `CountKind::Binary` each nonzero contributes one index; with
    /// `CountKind::Counts` the rounded count is kept alongside it.
    ///
    pub fn new(x_nd: &CsrMatrix<f32>, kind: CountKind) -> anyhow::Result<Self> {
        let cells = x_nd
            .row_iter()
            .map(|row| {
                let mut indexes = Vec::with_capacity(row.nnz());
                let mut counts = Vec::with_capacity(row.nnz());
                for (&j, &v) in row.col_indices().iter().zip(row.values()) {
                    if v <= 0.0 {
                        continue;
                    }
                    let c = v.round();
                    anyhow::ensure!(
                        (v - c).abs() <= INTEGER_TOL,
                        "expected integer counts, found {} at column {}",
                        v,
                        j
                    );
                    indexes.push((j + 1) as u32);
                    counts.push(c);
                }

                let endog = row_index_list(row.col_indices(), row.values(), kind);
                let read_depth = endog.len() as f32;
                Ok(CellRecord {
                    endog,
                    compact: match kind {
                        CountKind::Binary => None,
                        CountKind::Counts => Some((indexes, counts)),
                    },
                    read_depth,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let samples = (0..cells.len()).collect();

        Ok(Self {
            cells,
            n_features: x_nd.ncols(),
            exog: None,
            covariates: None,
            extra: None,
            minibatches: Minibatches {
                samples,
                chunks: vec![],
            },
        })
    }

    /// attach dense output counts for the negative-binomial head
    pub fn with_exog(mut self, exog: Array2<f32>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            exog.nrows() == self.cells.len(),
            "output rows {} != cells {}",
            exog.nrows(),
            self.cells.len()
        );
        self.exog = Some(exog);
        Ok(self)
    }

    /// attach technical covariates, one row per cell
    pub fn with_covariates(mut self, covariates: Array2<f32>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            covariates.nrows() == self.cells.len(),
            "covariate rows {} != cells {}",
            covariates.nrows(),
            self.cells.len()
        );
        self.covariates = Some(covariates);
        Ok(self)
    }

    /// attach extra continuous features, one row per cell
    pub fn with_extra(mut self, extra: Array2<f32>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            extra.nrows() == self.cells.len(),
            "extra rows {} != cells {}",
            extra.nrows(),
            self.cells.len()
        );
        self.extra = Some(extra);
        Ok(self)
    }

    pub fn num_features(&self) -> usize {
        self.n_features
    }

    fn dense_rows(
        source: Option<&Array2<f32>>,
        rows: &[usize],
        dev: &Device,
    ) -> anyhow::Result<Option<Tensor>> {
        if let Some(data) = source {
            let ncol = data.ncols();
            let mut buf = Vec::with_capacity(rows.len() * ncol);
            for &i in rows {
                buf.extend(data.row(i).iter().copied());
            }
            Ok(Some(Tensor::from_vec(buf, (rows.len(), ncol), dev)?))
        } else {
            Ok(None)
        }
    }
}

impl PaddedDataLoader for PaddedInMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<PaddedMinibatch> {
        anyhow::ensure!(
            batch_idx < self.minibatches.chunks.len(),
            "invalid batch index = {} vs. total # = {}",
            batch_idx,
            self.minibatches.chunks.len()
        );

        let rows = &self.minibatches.chunks[batch_idx];
        let nn = rows.len();
        let width = rows
            .iter()
            .map(|&i| self.cells[i].endog.len())
            .max()
            .unwrap_or(0)
            .max(1);

        let mut endog_buf = vec![0_u32; nn * width];
        let mut depth_buf = Vec::with_capacity(nn);
        for (r, &i) in rows.iter().enumerate() {
            let cell = &self.cells[i];
            endog_buf[r * width..r * width + cell.endog.len()].copy_from_slice(&cell.endog);
            depth_buf.push(cell.read_depth.max(1.0));
        }
        let endog_nw = Tensor::from_vec(endog_buf, (nn, width), target_device)?;

        let has_counts = rows.iter().any(|&i| self.cells[i].compact.is_some());
        let (exog_nw, counts_nw) = if has_counts {
            let width_c = rows
                .iter()
                .map(|&i| {
                    self.cells[i]
                        .compact
                        .as_ref()
                        .map(|(idx, _)| idx.len())
                        .unwrap_or(0)
                })
                .max()
                .unwrap_or(0)
                .max(1);

            let mut idx_buf = vec![0_u32; nn * width_c];
            let mut count_buf = vec![0_f32; nn * width_c];
            for (r, &i) in rows.iter().enumerate() {
                if let Some((idx, counts)) = &self.cells[i].compact {
                    idx_buf[r * width_c..r * width_c + idx.len()].copy_from_slice(idx);
                    count_buf[r * width_c..r * width_c + counts.len()]
                        .copy_from_slice(counts);
                }
            }
            (
                Some(Tensor::from_vec(idx_buf, (nn, width_c), target_device)?),
                Some(Tensor::from_vec(count_buf, (nn, width_c), target_device)?),
            )
        } else {
            (None, None)
        };

        Ok(PaddedMinibatch {
            endog_nw,
            exog_nw,
            counts_nw,
            exog_nd: Self::dense_rows(self.exog.as_ref(), rows, target_device)?,
            read_depth_n1: Tensor::from_vec(depth_buf, (nn, 1), target_device)?,
            covariates_nc: Self::dense_rows(self.covariates.as_ref(), rows, target_device)?,
            extra_ne: Self::dense_rows(self.extra.as_ref(), rows, target_device)?,
        })
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_cells(&self) -> usize {
        self.cells.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) {
        self.minibatches.shuffle_minibatch(batch_size);
    }

    fn sequential_minibatch(&mut self, batch_size: usize) {
        self.minibatches.sequential_minibatch(batch_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;

    fn toy_csr() -> CsrMatrix<f32> {
        // 3 cells x 5 peaks
        let mut coo = CooMatrix::new(3, 5);
        coo.push(0, 0, 1.0);
        coo.push(0, 3, 2.0);
        coo.push(1, 2, 1.0);
        coo.push(2, 1, 1.0);
        coo.push(2, 2, 1.0);
        coo.push(2, 4, 3.0);
        CsrMatrix::from(&coo)
    }

    #[test]
    fn batch_width_is_local() -> anyhow::Result<()> {
        let mut data = PaddedInMemoryData::new(&toy_csr(), CountKind::Binary)?;
        data.minibatches.samples = vec![0, 1, 2];
        data.minibatches.chunks = vec![vec![1], vec![0, 2]];

        let b0 = data.minibatch_data(0, &Device::Cpu)?;
        let b1 = data.minibatch_data(1, &Device::Cpu)?;
        assert_eq!(b0.endog_nw.dims2()?, (1, 1));
        assert_eq!(b1.endog_nw.dims2()?, (2, 3));
        Ok(())
    }

    #[test]
    fn indexes_are_one_based_with_zero_padding() -> anyhow::Result<()> {
        let mut data = PaddedInMemoryData::new(&toy_csr(), CountKind::Binary)?;
        data.minibatches.chunks = vec![vec![0, 1]];

        let b = data.minibatch_data(0, &Device::Cpu)?;
        let idx = b.endog_nw.to_vec2::<u32>()?;
        assert_eq!(idx[0], vec![1, 4]);
        assert_eq!(idx[1], vec![3, 0]);
        assert!(b.exog_nw.is_none());
        assert!(b.counts_nw.is_none());
        Ok(())
    }

    #[test]
    fn count_modality_keeps_counts_and_depth() -> anyhow::Result<()> {
        let mut data = PaddedInMemoryData::new(&toy_csr(), CountKind::Counts)?;
        data.minibatches.chunks = vec![vec![0, 2]];

        let b = data.minibatch_data(0, &Device::Cpu)?;
        let idx = b.exog_nw.expect("exog").to_vec2::<u32>()?;
        assert_eq!(idx[0], vec![1, 4, 0]);
        assert_eq!(idx[1], vec![2, 3, 5]);

        let counts = b.counts_nw.expect("counts").to_vec2::<f32>()?;
        assert_eq!(counts[0], vec![1.0, 2.0, 0.0]);
        assert_eq!(counts[1], vec![1.0, 1.0, 3.0]);

        let rd = b.read_depth_n1.to_vec2::<f32>()?;
        assert_eq!(rd[0][0], 3.0);
        assert_eq!(rd[1][0], 5.0);
        Ok(())
    }

    #[test]
    fn count_modality_repeats_encoder_indexes() -> anyhow::Result<()> {
        // two cells hitting the same peak with counts 1 and 5
        let mut coo = CooMatrix::new(2, 3);
        coo.push(0, 1, 1.0);
        coo.push(1, 1, 5.0);
        let csr = CsrMatrix::from(&coo);

        let mut data = PaddedInMemoryData::new(&csr, CountKind::Counts)?;
        data.minibatches.chunks = vec![vec![0, 1]];

        let b = data.minibatch_data(0, &Device::Cpu)?;
        let endog = b.endog_nw.to_vec2::<u32>()?;
        assert_eq!(endog[0], vec![2, 0, 0, 0, 0]);
        assert_eq!(endog[1], vec![2, 2, 2, 2, 2]);

        let rd = b.read_depth_n1.to_vec2::<f32>()?;
        assert_eq!(rd[0][0], 1.0);
        assert_eq!(rd[1][0], 5.0);
        Ok(())
    }

    #[test]
    fn rejects_fractional_counts() {
        let mut coo = CooMatrix::new(1, 2);
        coo.push(0, 0, 1.5);
        let csr = CsrMatrix::from(&coo);
        let err = PaddedInMemoryData::new(&csr, CountKind::Counts)
            .map(|_| ())
            .unwrap_err();
        assert!(err.to_string().contains("integer counts"));
    }

    #[test]
    fn shuffle_partitions_all_cells() -> anyhow::Result<()> {
        let mut data = PaddedInMemoryData::new(&toy_csr(), CountKind::Binary)?;
        data.shuffle_minibatch(2);
        assert_eq!(data.num_minibatch(), 2);

        let mut seen: Vec<usize> = data
            .minibatches
            .chunks
            .iter()
            .flatten()
            .copied()
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        Ok(())
    }
}
