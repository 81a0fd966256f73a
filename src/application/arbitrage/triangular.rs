//! Triangular arbitrage on a single venue: assets are graph nodes, quoted
//! conversion rates are edges weighted `-ln(rate)`, and a profitable cycle
//! is a negative cycle. Bellman-Ford finds one; the cycle is surfaced when
//! the product of its rates net of fees still clears 1.

use crate::domain::arbitrage::{TriangularCycle, TriangularLeg};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Edge {
    from: usize,
    to: usize,
    weight: f64,
    rate: f64,
    pair: String,
}

/// Rate graph for one exchange. `add_pair` inserts both directions of a
/// quote: base->quote at `price` and quote->base at `1/price`.
pub struct RateGraph {
    exchange: String,
    assets: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    /// Per-leg fee, e.g. 0.001 for 10 bps.
    fee_fraction: f64,
}

impl RateGraph {
    pub fn new(exchange: &str, fee_percent: f64) -> Self {
        Self {
            exchange: exchange.to_string(),
            assets: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            fee_fraction: fee_percent / 100.0,
        }
    }

    fn asset_index(&mut self, asset: &str) -> usize {
        if let Some(&i) = self.index.get(asset) {
            return i;
        }
        let i = self.assets.len();
        self.assets.push(asset.to_string());
        self.index.insert(asset.to_string(), i);
        i
    }

    pub fn add_pair(&mut self, pair: &str, price: Decimal) {
        let Some((base, quote)) = pair.split_once('/') else {
            return;
        };
        let Some(price_f) = price.to_f64() else {
            return;
        };
        if price_f <= 0.0 {
            return;
        }
        let net = 1.0 - self.fee_fraction;
        let forward_rate = price_f * net;
        let backward_rate = 1.0 / price_f * net;

        let b = self.asset_index(base);
        let q = self.asset_index(quote);
        self.edges.push(Edge {
            from: b,
            to: q,
            weight: -forward_rate.ln(),
            rate: forward_rate,
            pair: pair.to_string(),
        });
        self.edges.push(Edge {
            from: q,
            to: b,
            weight: -backward_rate.ln(),
            rate: backward_rate,
            pair: pair.to_string(),
        });
    }

    /// Bellman-Ford negative-cycle detection. Returns the first profitable
    /// cycle found, if any.
    pub fn find_profitable_cycle(&self) -> Option<TriangularCycle> {
        let n = self.assets.len();
        if n < 3 {
            return None;
        }
        let mut dist = vec![0.0f64; n];
        let mut pred: Vec<Option<usize>> = vec![None; n];

        let mut last_relaxed = None;
        for _ in 0..n {
            last_relaxed = None;
            for (edge_idx, edge) in self.edges.iter().enumerate() {
                if dist[edge.from] + edge.weight < dist[edge.to] - 1e-12 {
                    dist[edge.to] = dist[edge.from] + edge.weight;
                    pred[edge.to] = Some(edge_idx);
                    last_relaxed = Some(edge.to);
                }
            }
            if last_relaxed.is_none() {
                return None;
            }
        }

        // A relaxation on the n-th pass pins a node reachable from a
        // negative cycle; walk predecessors n steps to land inside it.
        let mut node = last_relaxed?;
        for _ in 0..n {
            node = self.edges[pred[node]?].from;
        }

        let mut cycle_edges = Vec::new();
        let start = node;
        loop {
            let edge_idx = pred[node]?;
            cycle_edges.push(edge_idx);
            node = self.edges[edge_idx].from;
            if node == start {
                break;
            }
            if cycle_edges.len() > n {
                return None;
            }
        }
        cycle_edges.reverse();

        let mut legs = Vec::with_capacity(cycle_edges.len());
        let mut gross = 1.0f64;
        for edge_idx in cycle_edges {
            let edge = &self.edges[edge_idx];
            gross *= edge.rate;
            legs.push(TriangularLeg {
                from: self.assets[edge.from].clone(),
                to: self.assets[edge.to].clone(),
                pair: edge.pair.clone(),
                rate: Decimal::from_f64(edge.rate).unwrap_or(Decimal::ZERO),
            });
        }

        if gross <= 1.0 {
            return None;
        }
        Some(TriangularCycle {
            exchange: self.exchange.clone(),
            legs,
            gross_rate: gross,
            profit_percent: (gross - 1.0) * 100.0,
        })
    }
}
