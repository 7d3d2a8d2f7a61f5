#![allow(dead_code)]

use crate::candle_dp_topics::TopicModel;

use anyhow::anyhow;
use nalgebra_sparse::CsrMatrix;
use ndarray::{Array1, Array2};
use peak_matrix::hits::validate_hits_matrix;
use rayon::prelude::*;
use special::Gamma;
use std::collections::HashMap;
use std::fmt;

/// Identity of one transcription factor (or other binding factor) row in
/// a hits matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct FactorMetadata {
    pub factor_id: String,
    pub name: String,
    /// name used for expression lookups downstream
    pub parsed_name: String,
}

#[derive(Clone, Debug)]
pub struct EnrichmentRecord {
    pub metadata: FactorMetadata,
    pub pval: f64,
    pub test_statistic: f64,
}

/// Raised when enrichment results are requested before being computed.
/// Callers can `downcast_ref` the `anyhow::Error` to tell this apart
/// from other failures.
#[derive(Debug)]
pub struct EnrichmentNotComputed {
    pub topic: usize,
    pub factor_type: String,
}

impl fmt::Display for EnrichmentNotComputed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no enrichments computed yet for topic {} with factor type '{}'; \
             run get_enriched_factors first",
            self.topic, self.factor_type
        )
    }
}

impl std::error::Error for EnrichmentNotComputed {}

/// One-sided association test over a 2x2 contingency table
/// `[[overlap, module_only], [factor_only, neither]]`
pub trait EnrichmentTest {
    /// returns `(test_statistic, pval)`
    fn test(
        &self,
        overlap: usize,
        module_only: usize,
        factor_only: usize,
        neither: usize,
    ) -> (f64, f64);
}

/// Fisher's exact test against the `greater` alternative, evaluated
/// through the hypergeometric tail.
pub struct FisherExactTest;

fn ln_choose(n: u64, k: u64) -> f64 {
    if k > n {
        return f64::NEG_INFINITY;
    }
    ((n + 1) as f64).ln_gamma().0
        - ((k + 1) as f64).ln_gamma().0
        - ((n - k + 1) as f64).ln_gamma().0
}

impl EnrichmentTest for FisherExactTest {
    fn test(
        &self,
        overlap: usize,
        module_only: usize,
        factor_only: usize,
        neither: usize,
    ) -> (f64, f64) {
        let (a, b, c, d) = (
            overlap as u64,
            module_only as u64,
            factor_only as u64,
            neither as u64,
        );

        let odds_ratio = if b * c == 0 {
            f64::INFINITY
        } else {
            (a * d) as f64 / (b * c) as f64
        };

        let n_total = a + b + c + d;
        let row1 = a + b;
        let col1 = a + c;

        // P[X >= a] for X ~ Hypergeometric(n_total, row1, col1)
        let upper = row1.min(col1);
        let mut pval = 0f64;
        for x in a..=upper {
            let ln_p = ln_choose(row1, x) + ln_choose(n_total - row1, col1 - x)
                - ln_choose(n_total, col1);
            pval += ln_p.exp();
        }

        (odds_ratio, pval.min(1.0))
    }
}

///
/// Factor-enrichment workspace around a fitted topic model. Results are
/// cached per `(factor_type, topic)` so repeated queries are free.
///
pub struct TopicEnrichment<'a> {
    model: &'a TopicModel,
    enrichments: HashMap<(String, usize), Vec<EnrichmentRecord>>,
}

impl<'a> TopicEnrichment<'a> {
    pub fn new(model: &'a TopicModel) -> Self {
        Self {
            model,
            enrichments: HashMap::new(),
        }
    }

    fn validate_topic(&self, topic: usize) -> anyhow::Result<()> {
        anyhow::ensure!(
            topic < self.model.num_topics(),
            "topic {} out of range (model has {})",
            topic,
            self.model.num_topics()
        );
        Ok(())
    }

    /// Peak indexes ordered by increasing dictionary weight for `topic`;
    /// the strongest peaks for the topic sit at the end.
    pub fn argsort_peaks(&self, topic: usize) -> anyhow::Result<Vec<usize>> {
        self.validate_topic(topic)?;

        let dictionary_dk = self.model.get_dictionary()?;
        let scores: Vec<f32> = dictionary_dk
            .narrow(1, topic, 1)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&i, &j| scores[i].total_cmp(&scores[j]));
        Ok(order)
    }

    /// Peak names ordered from least to most associated with `topic`
    pub fn rank_peaks(&self, peak_names: &[String], topic: usize) -> anyhow::Result<Vec<String>> {
        anyhow::ensure!(
            peak_names.len() == self.model.config().n_peaks,
            "expected {} peak names, found {}",
            self.model.config().n_peaks,
            peak_names.len()
        );
        Ok(self
            .argsort_peaks(topic)?
            .into_iter()
            .map(|i| peak_names[i].clone())
            .collect())
    }

    ///
    /// Test every factor for enrichment among the top-`top_quantile` peaks
    /// of `topic` and cache the results under `(factor_type, topic)`.
    ///
    /// * `hits_fd` - factors-by-peaks binding matrix; any nonzero is a hit
    /// * `metadata` - one record per factor row
    ///
    pub fn get_enriched_factors<T: EnrichmentTest + Sync>(
        &mut self,
        hits_fd: &CsrMatrix<f32>,
        metadata: &[FactorMetadata],
        factor_type: &str,
        top_quantile: f64,
        topic: usize,
        test: &T,
    ) -> anyhow::Result<&[EnrichmentRecord]> {
        anyhow::ensure!(
            top_quantile > 0.0 && top_quantile < 1.0,
            "top_quantile must be in (0, 1)"
        );
        anyhow::ensure!(
            metadata.len() == hits_fd.nrows(),
            "metadata rows {} != hits rows {}",
            metadata.len(),
            hits_fd.nrows()
        );

        let n_peaks = self.model.config().n_peaks;
        let hits_fd = validate_hits_matrix(hits_fd, n_peaks)?;

        let n_top = ((n_peaks as f64) * top_quantile) as usize;
        let order = self.argsort_peaks(topic)?;
        let mut in_module = vec![false; n_peaks];
        for &i in &order[order.len() - n_top..] {
            in_module[i] = true;
        }

        let records: Vec<EnrichmentRecord> = (0..hits_fd.nrows())
            .into_par_iter()
            .map(|f| {
                let row = hits_fd.row(f);
                let overlap = row
                    .col_indices()
                    .iter()
                    .filter(|&&j| in_module[j])
                    .count();
                let module_only = n_top - overlap;
                let factor_only = row.nnz() - overlap;
                let neither = n_peaks - (overlap + module_only + factor_only);

                let (stat, pval) = test.test(overlap, module_only, factor_only, neither);
                EnrichmentRecord {
                    metadata: metadata[f].clone(),
                    pval,
                    test_statistic: stat,
                }
            })
            .collect();

        // recomputing with new inputs replaces any earlier results
        let key = (factor_type.to_string(), topic);
        let cached = self.enrichments.entry(key).or_default();
        *cached = records;
        Ok(cached.as_slice())
    }

    /// Cached enrichment results for `(factor_type, topic)`. Fails with a
    /// downcastable [`EnrichmentNotComputed`] when nothing was cached.
    pub fn get_enrichments(
        &self,
        topic: usize,
        factor_type: &str,
    ) -> anyhow::Result<&[EnrichmentRecord]> {
        self.validate_topic(topic)?;
        self.enrichments
            .get(&(factor_type.to_string(), topic))
            .map(|v| v.as_slice())
            .ok_or_else(|| {
                anyhow::Error::new(EnrichmentNotComputed {
                    topic,
                    factor_type: factor_type.to_string(),
                })
            })
    }

    ///
    /// Per-cell factor scores: the log-probability of sampling each
    /// factor's peaks from the posterior accessibility distribution.
    /// Returns the raw scores and a row-normalized, column-standardized
    /// copy.
    ///
    pub fn motif_scores(
        &self,
        hits_fd: &CsrMatrix<f32>,
        topic_compositions: &Array2<f32>,
        batch_size: usize,
    ) -> anyhow::Result<(Array2<f32>, Array2<f32>)> {
        let n_peaks = self.model.config().n_peaks;
        let hits_fd = validate_hits_matrix(hits_fd, n_peaks)?;

        let probs_nd = self
            .model
            .impute_peak_probs(topic_compositions, batch_size)?;
        let (nn, n_factors) = (probs_nd.nrows(), hits_fd.nrows());

        let score_rows: Vec<Vec<f32>> = (0..nn)
            .into_par_iter()
            .map(|i| {
                let log_p: Vec<f32> =
                    probs_nd.row(i).iter().map(|&p| (p + 1e-10).ln()).collect();
                (0..n_factors)
                    .map(|f| {
                        hits_fd
                            .row(f)
                            .col_indices()
                            .iter()
                            .map(|&j| log_p[j])
                            .sum()
                    })
                    .collect()
            })
            .collect();

        let mut scores = Array2::<f32>::zeros((nn, n_factors));
        for (i, row) in score_rows.into_iter().enumerate() {
            scores.row_mut(i).assign(&Array1::from_vec(row));
        }

        let mut normalized = scores.clone();
        for mut row in normalized.rows_mut() {
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-10);
            row.mapv_inplace(|v| v / norm);
        }
        for mut col in normalized.columns_mut() {
            let mean = col.mean().unwrap_or(0.0);
            let var = col.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>()
                / col.len().max(1) as f32;
            let sd = var.sqrt().max(1e-10);
            col.mapv_inplace(|v| (v - mean) / sd);
        }

        Ok((scores, normalized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_dp_topics::TopicModelConfig;
    use candle_core::Device;
    use nalgebra_sparse::CooMatrix;
    use ndarray::Axis;

    fn toy_model(n_peaks: usize, n_topics: usize) -> TopicModel {
        let config = TopicModelConfig::new(n_peaks, n_topics);
        TopicModel::new(config, &Device::Cpu).expect("model")
    }

    fn meta(n: usize) -> Vec<FactorMetadata> {
        (0..n)
            .map(|i| FactorMetadata {
                factor_id: format!("F{}", i),
                name: format!("factor-{}", i),
                parsed_name: format!("factor{}", i),
            })
            .collect()
    }

    #[test]
    fn fisher_matches_known_table() {
        // [[8, 2], [1, 5]] one-sided greater: p = 280 / 11440
        let (stat, pval) = FisherExactTest.test(8, 2, 1, 5);
        assert!((stat - 20.0).abs() < 1e-9);
        assert!((pval - 280.0 / 11440.0).abs() < 1e-6, "pval = {}", pval);
    }

    #[test]
    fn fisher_independent_table_is_not_significant() {
        let (_, pval) = FisherExactTest.test(5, 45, 10, 90);
        assert!(pval > 0.3);
    }

    #[test]
    fn argsort_rejects_bad_topic() {
        let model = toy_model(10, 3);
        let enrich = TopicEnrichment::new(&model);
        assert!(enrich.argsort_peaks(3).is_err());
        assert!(enrich.argsort_peaks(2).is_ok());
    }

    #[test]
    fn enrichments_cache_round_trip() -> anyhow::Result<()> {
        let model = toy_model(10, 3);
        let mut enrich = TopicEnrichment::new(&model);

        let mut coo = CooMatrix::new(2, 10);
        for j in 0..5 {
            coo.push(0, j, 1.0);
        }
        coo.push(1, 9, 1.0);
        let hits = CsrMatrix::from(&coo);

        enrich.get_enriched_factors(&hits, &meta(2), "motifs", 0.2, 1, &FisherExactTest)?;

        let cached = enrich.get_enrichments(1, "motifs")?;
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[0].metadata.factor_id, "F0");
        Ok(())
    }

    #[test]
    fn recomputing_replaces_cached_records() -> anyhow::Result<()> {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct StampedTest(AtomicUsize);
        impl EnrichmentTest for StampedTest {
            fn test(&self, _: usize, _: usize, _: usize, _: usize) -> (f64, f64) {
                let stamp = self.0.fetch_add(1, Ordering::Relaxed);
                (stamp as f64, 1.0)
            }
        }

        let model = toy_model(10, 3);
        let mut enrich = TopicEnrichment::new(&model);

        let mut coo = CooMatrix::new(1, 10);
        coo.push(0, 0, 1.0);
        let hits = CsrMatrix::from(&coo);
        let stamped = StampedTest(AtomicUsize::new(0));

        enrich.get_enriched_factors(&hits, &meta(1), "motifs", 0.2, 0, &stamped)?;
        enrich.get_enriched_factors(&hits, &meta(1), "motifs", 0.2, 0, &stamped)?;

        // the second run's statistic replaces the first run's
        let cached = enrich.get_enrichments(0, "motifs")?;
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].test_statistic, 1.0);
        Ok(())
    }

    #[test]
    fn missing_enrichments_are_distinguishable() {
        let model = toy_model(10, 3);
        let enrich = TopicEnrichment::new(&model);

        let err = enrich.get_enrichments(0, "motifs").unwrap_err();
        let not_computed = err.downcast_ref::<EnrichmentNotComputed>();
        assert!(not_computed.is_some());
        assert_eq!(not_computed.unwrap().topic, 0);

        // out-of-range topics fail differently
        let err = enrich.get_enrichments(99, "motifs").unwrap_err();
        assert!(err.downcast_ref::<EnrichmentNotComputed>().is_none());
    }

    #[test]
    fn motif_scores_shapes_and_standardization() -> anyhow::Result<()> {
        let model = toy_model(8, 3);
        let enrich = TopicEnrichment::new(&model);

        let mut coo = CooMatrix::new(2, 8);
        coo.push(0, 0, 1.0);
        coo.push(0, 1, 1.0);
        coo.push(1, 5, 1.0);
        let hits = CsrMatrix::from(&coo);

        let theta = ndarray::arr2(&[
            [0.7_f32, 0.2, 0.1],
            [0.1, 0.8, 0.1],
            [0.2, 0.2, 0.6],
        ]);
        let (scores, normalized) = enrich.motif_scores(&hits, &theta, 2)?;
        assert_eq!(scores.dim(), (3, 2));
        assert_eq!(normalized.dim(), (3, 2));

        // standardized columns are centered
        for col in normalized.axis_iter(Axis(1)) {
            assert!(col.mean().unwrap().abs() < 1e-4);
        }
        // raw scores are log probabilities, so negative
        assert!(scores.iter().all(|&v| v < 0.0));
        Ok(())
    }
}
