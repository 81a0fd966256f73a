//! Hourly correlation snapshot shared by the risk and portfolio services.
//!
//! The matrix is immutable once computed; a refresh swaps the `Arc` under
//! a short write lock, so readers never block writers. A failed refresh
//! keeps the previous snapshot.

use crate::domain::risk::CorrelationRiskMetrics;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CorrelationMatrix {
    pub symbols: Vec<String>,
    /// Row-major, symmetric, unit diagonal.
    pub matrix: Vec<Vec<f64>>,
    pub computed_at: DateTime<Utc>,
}

impl CorrelationMatrix {
    pub fn empty() -> Self {
        Self {
            symbols: Vec::new(),
            matrix: Vec::new(),
            computed_at: Utc::now(),
        }
    }

    pub fn pairwise(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.symbols.iter().position(|s| s == a)?;
        let j = self.symbols.iter().position(|s| s == b)?;
        Some(self.matrix[i][j])
    }

    /// Average off-diagonal correlation; zero for fewer than two symbols.
    pub fn average_correlation(&self) -> f64 {
        let n = self.symbols.len();
        if n < 2 {
            return 0.0;
        }
        let mut sum = 0.0;
        let mut count = 0usize;
        for i in 0..n {
            for j in (i + 1)..n {
                sum += self.matrix[i][j];
                count += 1;
            }
        }
        sum / count as f64
    }

    /// Connected components over edges with |rho| above `threshold`;
    /// singletons are omitted.
    pub fn clusters(&self, threshold: f64) -> Vec<Vec<String>> {
        let n = self.symbols.len();
        let mut visited = vec![false; n];
        let mut clusters = Vec::new();
        for start in 0..n {
            if visited[start] {
                continue;
            }
            let mut stack = vec![start];
            let mut component = Vec::new();
            visited[start] = true;
            while let Some(i) = stack.pop() {
                component.push(self.symbols[i].clone());
                for j in 0..n {
                    if !visited[j] && i != j && self.matrix[i][j].abs() >= threshold {
                        visited[j] = true;
                        stack.push(j);
                    }
                }
            }
            if component.len() > 1 {
                component.sort();
                clusters.push(component);
            }
        }
        clusters
    }
}

pub struct CorrelationTracker {
    snapshot: RwLock<Arc<CorrelationMatrix>>,
    cluster_threshold: f64,
}

impl CorrelationTracker {
    pub fn new(cluster_threshold: f64) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(CorrelationMatrix::empty())),
            cluster_threshold,
        }
    }

    pub fn snapshot(&self) -> Arc<CorrelationMatrix> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Recompute from aligned daily-return series. Series shorter than
    /// `min_overlap` with each other contribute zero correlation.
    pub fn refresh(&self, returns_by_symbol: &HashMap<String, Vec<f64>>, min_overlap: usize) {
        let mut symbols: Vec<String> = returns_by_symbol.keys().cloned().collect();
        symbols.sort();
        if symbols.is_empty() {
            warn!("CorrelationTracker: refresh with no symbols, keeping previous snapshot");
            return;
        }

        let n = symbols.len();
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .collect();
        let correlations: Vec<((usize, usize), f64)> = pairs
            .par_iter()
            .map(|&(i, j)| {
                let a = &returns_by_symbol[&symbols[i]];
                let b = &returns_by_symbol[&symbols[j]];
                let rho = pearson(a, b, min_overlap).unwrap_or(0.0);
                ((i, j), rho)
            })
            .collect();

        let mut matrix = vec![vec![0.0; n]; n];
        for (i, row) in matrix.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        for ((i, j), rho) in correlations {
            matrix[i][j] = rho;
            matrix[j][i] = rho;
        }

        let next = Arc::new(CorrelationMatrix {
            symbols,
            matrix,
            computed_at: Utc::now(),
        });
        match self.snapshot.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        info!("CorrelationTracker: snapshot refreshed ({} symbols)", n);
    }

    /// Portfolio-level summary for the given weights and vols (fractions
    /// of portfolio value and daily sigmas, keyed by symbol).
    pub fn risk_metrics(&self, weights_vols: &HashMap<String, (f64, f64)>) -> CorrelationRiskMetrics {
        let snapshot = self.snapshot();
        let avg = snapshot.average_correlation();
        let n = weights_vols.len();

        let weighted_avg_vol: f64 = weights_vols.values().map(|(w, v)| w * v).sum();
        let mut portfolio_var = 0.0;
        for (sym_a, (wa, va)) in weights_vols {
            for (sym_b, (wb, vb)) in weights_vols {
                let rho = if sym_a == sym_b {
                    1.0
                } else {
                    snapshot.pairwise(sym_a, sym_b).unwrap_or(0.0)
                };
                portfolio_var += wa * wb * va * vb * rho;
            }
        }
        let portfolio_vol = portfolio_var.max(0.0).sqrt();
        let diversification_ratio = if portfolio_vol > 0.0 {
            weighted_avg_vol / portfolio_vol
        } else {
            1.0
        };
        let effective_assets = if n > 0 {
            n as f64 / (1.0 + (n as f64 - 1.0) * avg.max(0.0))
        } else {
            0.0
        };

        CorrelationRiskMetrics {
            average_correlation: avg,
            diversification_ratio,
            effective_assets,
            risk_score: (avg.max(0.0) * 150.0).min(100.0),
            clusters: snapshot.clusters(self.cluster_threshold),
        }
    }
}

/// Pearson correlation over the overlapping prefix of two series.
pub fn pearson(a: &[f64], b: &[f64], min_overlap: usize) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < min_overlap.max(2) {
        return None;
    }
    let a = &a[..n];
    let b = &b[..n];
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pearson_perfect_correlation() {
        let a = vec![0.01, 0.02, -0.01, 0.03];
        let b = vec![0.02, 0.04, -0.02, 0.06];
        let rho = pearson(&a, &b, 2).unwrap();
        assert!((rho - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pearson_anticorrelation() {
        let a = vec![0.01, 0.02, -0.01, 0.03];
        let b: Vec<f64> = a.iter().map(|v| -v).collect();
        let rho = pearson(&a, &b, 2).unwrap();
        assert!((rho + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pearson_rejects_short_series() {
        assert!(pearson(&[0.01], &[0.02], 2).is_none());
        assert!(pearson(&[0.01; 5], &[0.02; 5], 10).is_none());
    }

    fn tracker_with_data() -> CorrelationTracker {
        let tracker = CorrelationTracker::new(0.7);
        let mut returns = HashMap::new();
        let base = vec![0.01, 0.02, -0.01, 0.03, -0.02, 0.01, 0.02, -0.01];
        returns.insert("BTC/USDT".to_string(), base.clone());
        returns.insert(
            "ETH/USDT".to_string(),
            base.iter().map(|v| v * 1.1).collect(),
        );
        returns.insert(
            "DOGE/USDT".to_string(),
            vec![-0.02, 0.01, 0.02, -0.03, 0.01, -0.01, -0.02, 0.02],
        );
        tracker.refresh(&returns, 4);
        tracker
    }

    #[test]
    fn test_refresh_builds_symmetric_matrix() {
        let tracker = tracker_with_data();
        let snapshot = tracker.snapshot();
        let ab = snapshot.pairwise("BTC/USDT", "ETH/USDT").unwrap();
        let ba = snapshot.pairwise("ETH/USDT", "BTC/USDT").unwrap();
        assert!((ab - ba).abs() < 1e-12);
        assert!(ab > 0.99);
        assert_eq!(snapshot.pairwise("BTC/USDT", "BTC/USDT"), Some(1.0));
    }

    #[test]
    fn test_clusters_group_correlated_assets() {
        let tracker = tracker_with_data();
        let clusters = tracker.snapshot().clusters(0.7);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0], vec!["BTC/USDT", "ETH/USDT"]);
    }

    #[test]
    fn test_empty_refresh_keeps_previous() {
        let tracker = tracker_with_data();
        let before = tracker.snapshot();
        tracker.refresh(&HashMap::new(), 4);
        let after = tracker.snapshot();
        assert_eq!(before.symbols, after.symbols);
    }

    #[test]
    fn test_effective_assets_shrink_with_correlation() {
        let tracker = tracker_with_data();
        let mut weights = HashMap::new();
        weights.insert("BTC/USDT".to_string(), (0.4, 0.02));
        weights.insert("ETH/USDT".to_string(), (0.4, 0.025));
        weights.insert("DOGE/USDT".to_string(), (0.2, 0.05));
        let metrics = tracker.risk_metrics(&weights);
        assert!(metrics.effective_assets < 3.0);
        assert!(metrics.effective_assets >= 1.0);
        assert!(metrics.diversification_ratio >= 1.0);
    }
}
