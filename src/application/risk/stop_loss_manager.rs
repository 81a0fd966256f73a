//! Stop-loss lifecycle: creation, per-tick tightening, triggering, modify
//! and cancel. Stops only ever tighten: `new_stop = max(old, candidate)`
//! on longs and `min(old, candidate)` on shorts. Updates smaller than
//! 0.1% of the old stop are suppressed.

use crate::application::risk::data::RiskData;
use crate::config::RiskLimitsConfig;
use crate::domain::stops::{StopLossConfig, StopLossOrder, StopLossUpdate, StopStatus, StopType};
use crate::domain::store::{Store, containers};
use crate::domain::trading::{OrderSide, risk_multiplier};
use crate::infrastructure::messaging::{Message, MessageFabric, topics};
use crate::infrastructure::observability::Metrics;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Per-symbol market context the stop formulas draw on. Refreshed by the
/// risk service alongside its periodic sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketInputs {
    pub volatility: f64,
    pub atr: Option<f64>,
    pub support_level: Option<f64>,
    pub resistance_level: Option<f64>,
}

pub struct StopLossManager {
    stops: Mutex<HashMap<String, StopLossOrder>>,
    market_inputs: Mutex<HashMap<String, MarketInputs>>,
    data: Arc<RiskData>,
    fabric: MessageFabric,
    metrics: Metrics,
    limits: RiskLimitsConfig,
}

impl StopLossManager {
    pub fn new(
        data: Arc<RiskData>,
        fabric: MessageFabric,
        metrics: Metrics,
        limits: RiskLimitsConfig,
    ) -> Self {
        Self {
            stops: Mutex::new(HashMap::new()),
            market_inputs: Mutex::new(HashMap::new()),
            data,
            fabric,
            metrics,
            limits,
        }
    }

    pub async fn set_market_inputs(&self, symbol: &str, inputs: MarketInputs) {
        self.market_inputs
            .lock()
            .await
            .insert(symbol.to_string(), inputs);
    }

    async fn inputs_for(&self, symbol: &str) -> MarketInputs {
        self.market_inputs
            .lock()
            .await
            .get(symbol)
            .copied()
            .unwrap_or(MarketInputs {
                volatility: self.limits.default_volatility,
                ..Default::default()
            })
    }

    /// Rehydrate active stops from the store on startup.
    pub async fn load_active_stops(&self) -> Result<usize> {
        let docs = self
            .data
            .store()
            .query(
                containers::STOP_LOSS_ORDERS,
                &crate::domain::store::QueryFilter::new().eq("status", "active"),
            )
            .await?;
        let mut stops = self.stops.lock().await;
        let mut loaded = 0;
        for doc in docs {
            match serde_json::from_value::<StopLossOrder>(doc) {
                Ok(stop) => {
                    stops.insert(stop.id.clone(), stop);
                    loaded += 1;
                }
                Err(e) => warn!("StopLossManager: skipping malformed stop document: {}", e),
            }
        }
        info!("StopLossManager: loaded {} active stops", loaded);
        Ok(loaded)
    }

    pub async fn create_stop(
        &self,
        position_id: &str,
        symbol: &str,
        side: OrderSide,
        entry_price: Decimal,
        quantity: Decimal,
        config: StopLossConfig,
    ) -> Result<StopLossOrder> {
        let inputs = self.inputs_for(symbol).await;
        let stop_price = initial_stop_price(side, entry_price, symbol, &config, &inputs);
        let now = Utc::now();
        let order = StopLossOrder {
            id: Uuid::new_v4().to_string(),
            position_id: position_id.to_string(),
            symbol: symbol.to_string(),
            side,
            status: StopStatus::Active,
            entry_price,
            current_price: entry_price,
            stop_price,
            initial_stop_price: stop_price,
            highest_price: entry_price,
            lowest_price: entry_price,
            quantity,
            config,
            created_at: now,
            last_updated: now,
        };

        self.persist(&order).await;
        self.stops
            .lock()
            .await
            .insert(order.id.clone(), order.clone());
        info!(
            "StopLossManager: created {} stop {} for {} at {} (entry {})",
            order.config.stop_type, order.id, symbol, stop_price, entry_price
        );
        Ok(order)
    }

    /// Process one price tick for a symbol. Returns updates emitted and
    /// any triggers fired. Updates are serialised under the map lock, so
    /// per-position stop movement is totally ordered.
    pub async fn on_price_update(&self, symbol: &str, price: Decimal) -> Vec<StopLossUpdate> {
        let inputs = self.inputs_for(symbol).await;
        let mut updates = Vec::new();
        let mut triggered = Vec::new();

        {
            let mut stops = self.stops.lock().await;
            for order in stops.values_mut() {
                if order.symbol != symbol || order.status != StopStatus::Active {
                    continue;
                }
                order.current_price = price;
                if price > order.highest_price {
                    order.highest_price = price;
                }
                if price < order.lowest_price {
                    order.lowest_price = price;
                }

                if let Some(update) = tighten(order, &inputs) {
                    updates.push(update);
                }

                if is_triggered(order, price, &inputs, self.limits.high_volatility_threshold) {
                    order.status = StopStatus::Triggered;
                    order.last_updated = Utc::now();
                    triggered.push(order.clone());
                }
            }
            for order in &triggered {
                stops.remove(&order.id);
            }
        }

        for update in &updates {
            if let Some(order) = self.get_stop(&update.order_id).await {
                self.persist(&order).await;
            }
        }
        for order in triggered {
            self.fire_trigger(&order, price).await;
        }
        updates
    }

    async fn fire_trigger(&self, order: &StopLossOrder, price: Decimal) {
        warn!(
            "StopLossManager: stop {} TRIGGERED for {} at {} (stop {})",
            order.id, order.symbol, price, order.stop_price
        );
        self.persist(order).await;
        self.metrics
            .stop_triggers_total
            .with_label_values(&[&order.config.stop_type.to_string()])
            .inc();

        let event = crate::infrastructure::messaging::contracts::StopLossTriggerEvent::market_sell(
            &order.id,
            &order.position_id,
            &order.symbol,
            order.quantity,
            price,
            order.stop_price,
        );
        let payload = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => {
                error!("StopLossManager: trigger serialization failed: {}", e);
                return;
            }
        };
        let message = Message::new(
            topics::exchanges::ORDER_EXECUTION,
            topics::keys::STOP_LOSS_TRIGGER,
            payload,
        )
        .persistent()
        .with_priority(9);
        if let Err(e) = self.fabric.publish(message).await {
            error!("StopLossManager: trigger publish failed: {}", e);
        }
    }

    pub async fn modify_stop(&self, order_id: &str, config: StopLossConfig) -> Result<bool> {
        // Market inputs are read before taking the stops lock; the tick
        // path acquires in the same order.
        let symbol = match self.get_stop(order_id).await {
            Some(order) => order.symbol,
            None => return Ok(false),
        };
        let inputs = self.inputs_for(&symbol).await;
        let mut stops = self.stops.lock().await;
        let Some(order) = stops.get_mut(order_id) else {
            return Ok(false);
        };
        let candidate = initial_stop_price(
            order.side,
            order.current_price,
            &order.symbol,
            &config,
            &inputs,
        );
        // A modify may not widen the stop either.
        order.stop_price = match order.side {
            OrderSide::Buy => order.stop_price.max(candidate),
            OrderSide::Sell => order.stop_price.min(candidate),
        };
        order.config = config;
        order.status = StopStatus::Modified;
        order.last_updated = Utc::now();
        let snapshot = order.clone();
        // Modified stops keep protecting the position.
        order.status = StopStatus::Active;
        drop(stops);
        self.persist(&snapshot).await;
        Ok(true)
    }

    pub async fn cancel_stop(&self, order_id: &str) -> Result<bool> {
        let mut stops = self.stops.lock().await;
        let Some(mut order) = stops.remove(order_id) else {
            return Ok(false);
        };
        order.status = StopStatus::Cancelled;
        order.last_updated = Utc::now();
        drop(stops);
        self.persist(&order).await;
        info!("StopLossManager: cancelled stop {}", order_id);
        Ok(true)
    }

    pub async fn get_stop(&self, order_id: &str) -> Option<StopLossOrder> {
        self.stops.lock().await.get(order_id).cloned()
    }

    pub async fn stop_for_position(&self, position_id: &str) -> Option<StopLossOrder> {
        self.stops
            .lock()
            .await
            .values()
            .find(|o| o.position_id == position_id)
            .cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.stops.lock().await.len()
    }

    async fn persist(&self, order: &StopLossOrder) {
        match serde_json::to_value(order) {
            Ok(doc) => {
                if let Err(e) = self
                    .data
                    .store()
                    .upsert(containers::STOP_LOSS_ORDERS, &doc)
                    .await
                {
                    warn!("StopLossManager: persist failed for {}: {}", order.id, e);
                }
            }
            Err(e) => warn!("StopLossManager: serialize failed for {}: {}", order.id, e),
        }
    }
}

fn stop_fraction(symbol: &str, config: &StopLossConfig, inputs: &MarketInputs, price: f64) -> f64 {
    match config.stop_type {
        StopType::Fixed | StopType::Trailing => config.initial_stop_percent / 100.0,
        StopType::Volatility => {
            inputs.volatility * config.volatility_multiplier * risk_multiplier(symbol)
        }
        StopType::Atr => match inputs.atr {
            Some(atr) if price > 0.0 => atr / price * config.atr_multiplier,
            _ => config.initial_stop_percent / 100.0,
        },
        StopType::SupportResistance => config.initial_stop_percent / 100.0,
    }
}

fn initial_stop_price(
    side: OrderSide,
    entry: Decimal,
    symbol: &str,
    config: &StopLossConfig,
    inputs: &MarketInputs,
) -> Decimal {
    let entry_f = entry.to_f64().unwrap_or(0.0);

    if config.stop_type == StopType::SupportResistance {
        let buffer = config.support_resistance_buffer / 100.0;
        match side {
            OrderSide::Buy => {
                if let Some(support) = inputs.support_level {
                    return Decimal::from_f64(support * (1.0 - buffer))
                        .unwrap_or(entry)
                        .round_dp(8);
                }
            }
            OrderSide::Sell => {
                if let Some(resistance) = inputs.resistance_level {
                    return Decimal::from_f64(resistance * (1.0 + buffer))
                        .unwrap_or(entry)
                        .round_dp(8);
                }
            }
        }
    }

    let fraction = stop_fraction(symbol, config, inputs, entry_f);
    let price = match side {
        OrderSide::Buy => entry_f * (1.0 - fraction),
        OrderSide::Sell => entry_f * (1.0 + fraction),
    };
    Decimal::from_f64(price).unwrap_or(entry).round_dp(8)
}

/// Candidate stop for the current tick, before monotonicity.
fn candidate_stop(order: &StopLossOrder, inputs: &MarketInputs) -> Option<(Decimal, String)> {
    let config = &order.config;
    match config.stop_type {
        StopType::Trailing => {
            if order.profit_percent() < config.min_profit_before_trail {
                return None;
            }
            let distance = config.trailing_distance_percent / 100.0;
            let (anchor, factor) = match order.side {
                OrderSide::Buy => (order.highest_price, 1.0 - distance),
                OrderSide::Sell => (order.lowest_price, 1.0 + distance),
            };
            let anchor_f = anchor.to_f64()?;
            Some((
                Decimal::from_f64(anchor_f * factor)?.round_dp(8),
                format!("Trailing stop moved (anchor: {})", anchor),
            ))
        }
        StopType::Volatility | StopType::Atr => {
            let price_f = order.current_price.to_f64()?;
            let fraction = stop_fraction(&order.symbol, config, inputs, price_f);
            let candidate = match order.side {
                OrderSide::Buy => price_f * (1.0 - fraction),
                OrderSide::Sell => price_f * (1.0 + fraction),
            };
            Some((
                Decimal::from_f64(candidate)?.round_dp(8),
                format!("{} stop recalculated", config.stop_type),
            ))
        }
        StopType::SupportResistance => {
            let buffer = config.support_resistance_buffer / 100.0;
            match order.side {
                OrderSide::Buy => inputs.support_level.and_then(|s| {
                    Some((
                        Decimal::from_f64(s * (1.0 - buffer))?.round_dp(8),
                        "Support level stop recalculated".to_string(),
                    ))
                }),
                OrderSide::Sell => inputs.resistance_level.and_then(|r| {
                    Some((
                        Decimal::from_f64(r * (1.0 + buffer))?.round_dp(8),
                        "Resistance level stop recalculated".to_string(),
                    ))
                }),
            }
        }
        StopType::Fixed => None,
    }
}

/// Apply candidate, breakeven protection, and time decay under the
/// monotonicity rule. Returns an update when the stop moved materially.
fn tighten(order: &mut StopLossOrder, inputs: &MarketInputs) -> Option<StopLossUpdate> {
    let old_stop = order.stop_price;
    let mut candidate = candidate_stop(order, inputs);

    // Breakeven protection: once 2% in profit the stop may not sit below
    // entry (long) / above entry (short), with a 0.1% buffer.
    if order.config.breakeven_protection && order.profit_percent() > 2.0 {
        let breakeven = match order.side {
            OrderSide::Buy => order.entry_price * Decimal::from_f64(1.001)?,
            OrderSide::Sell => order.entry_price * Decimal::from_f64(0.999)?,
        };
        let better = match order.side {
            OrderSide::Buy => candidate.as_ref().map(|(p, _)| *p < breakeven).unwrap_or(true),
            OrderSide::Sell => candidate.as_ref().map(|(p, _)| *p > breakeven).unwrap_or(true),
        };
        if better {
            candidate = Some((breakeven.round_dp(8), "Breakeven protection".to_string()));
        }
    }

    // Time decay: unprofitable positions older than a day get squeezed by
    // 0.1% per elapsed day.
    if order.config.time_decay_enabled && order.profit_percent() < 0.0 {
        let days = (Utc::now() - order.created_at).num_days();
        if days >= 1 {
            let factor = 1.0 + days as f64 * 0.001;
            let decayed = match order.side {
                OrderSide::Buy => order.stop_price * Decimal::from_f64(factor)?,
                OrderSide::Sell => order.stop_price / Decimal::from_f64(factor)?,
            };
            let replace = match (&candidate, order.side) {
                (Some((p, _)), OrderSide::Buy) => decayed > *p,
                (Some((p, _)), OrderSide::Sell) => decayed < *p,
                (None, _) => true,
            };
            if replace {
                candidate = Some((decayed.round_dp(8), format!("Time decay ({} days)", days)));
            }
        }
    }

    let (candidate_price, reason) = candidate?;

    // Never widen.
    let new_stop = match order.side {
        OrderSide::Buy => old_stop.max(candidate_price),
        OrderSide::Sell => old_stop.min(candidate_price),
    };
    if new_stop == old_stop {
        return None;
    }

    // Suppress sub-0.1% moves.
    let threshold = old_stop.abs() * Decimal::from_f64(0.001)?;
    if (new_stop - old_stop).abs() <= threshold {
        return None;
    }

    order.stop_price = new_stop;
    order.last_updated = Utc::now();
    Some(StopLossUpdate {
        order_id: order.id.clone(),
        old_stop_price: old_stop,
        new_stop_price: new_stop,
        reason,
        ts: order.last_updated,
    })
}

/// Volatility spikes pull the trigger boundary 0.5% toward price.
fn is_triggered(
    order: &StopLossOrder,
    price: Decimal,
    inputs: &MarketInputs,
    high_vol_threshold: f64,
) -> bool {
    let spike = inputs.volatility > 1.5 * high_vol_threshold;
    let boundary = if spike {
        match order.side {
            OrderSide::Buy => order.stop_price * Decimal::from_f64(1.005).unwrap_or(Decimal::ONE),
            OrderSide::Sell => order.stop_price * Decimal::from_f64(0.995).unwrap_or(Decimal::ONE),
        }
    } else {
        order.stop_price
    };
    match order.side {
        OrderSide::Buy => price <= boundary,
        OrderSide::Sell => price >= boundary,
    }
}
