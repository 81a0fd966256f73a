//! Exchange names, routing keys, and AMQP-style topic pattern matching.

/// Exchanges declared by `declare_core_topology`.
pub mod exchanges {
    pub const RISK_CHECK: &str = "risk.check";
    pub const RISK_ALERTS: &str = "risk.alerts";
    pub const PORTFOLIO_UPDATES: &str = "portfolio.updates";
    pub const ORDER_EXECUTION: &str = "order.execution";
    pub const INDICATOR_CONFIG: &str = "indicator_config";
    pub const INDICATOR_RESULTS: &str = "indicator_results";
    pub const STRATEGY_REQUESTS: &str = "mastertrade.strategy.requests";
    pub const MARKET_RESPONSES: &str = "mastertrade.market.responses";
    pub const ARBITRAGE: &str = "mastertrade.arbitrage";
}

pub mod keys {
    pub const RISK_CHECK_REQUEST: &str = "risk.check.request";
    pub const RISK_CHECK_RESPONSE: &str = "risk.check.response";
    pub const PORTFOLIO_RISK_UPDATE: &str = "portfolio.risk.update";
    pub const STOP_LOSS_TRIGGER: &str = "order.stop_loss.trigger";
    pub const CONFIG_REQUEST_ADD: &str = "config.request.add";
    pub const CONFIG_REQUEST_UPDATE: &str = "config.request.update";
    pub const CONFIG_REQUEST_REMOVE: &str = "config.request.remove";
    pub const CONFIG_REQUEST_BULK: &str = "config.request.bulk";
    pub const CONFIG_REQUEST_SUBSCRIBE: &str = "config.request.subscribe";
    pub const STRATEGY_REQUEST_CANCEL: &str = "strategy.request.cancel";
    pub const ARBITRAGE_OPPORTUNITY: &str = "arbitrage.opportunity.detected";
    pub const ARBITRAGE_EXECUTION: &str = "arbitrage.execution.completed";

    /// `result.<symbol>.<interval>`; symbols have their `/` flattened so
    /// the key keeps exactly three segments.
    pub fn indicator_result(symbol: &str, interval: &str) -> String {
        format!("result.{}.{}", symbol.replace('/', "_"), interval)
    }

    /// `strategy.request.<data_type>.<priority>`
    pub fn strategy_request(data_type: &str, priority: &str) -> String {
        format!("strategy.request.{}.{}", data_type, priority)
    }

    /// `market.response.<data_type>`
    pub fn market_response(data_type: &str) -> String {
        format!("market.response.{}", data_type)
    }

    /// `portfolio.position.<symbol>` fill events.
    pub fn portfolio_position(symbol: &str) -> String {
        format!("portfolio.position.{}", symbol.replace('/', "_"))
    }

    pub fn market_price(symbol: &str) -> String {
        format!("market.price.{}", symbol.replace('/', "_"))
    }
}

/// AMQP topic match: `*` matches exactly one dot-separated word, `#`
/// matches zero or more words.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pat: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = key.split('.').collect();
    matches_from(&pat, &words)
}

fn matches_from(pat: &[&str], words: &[&str]) -> bool {
    match pat.split_first() {
        None => words.is_empty(),
        Some((seg, rest)) if *seg == "#" => {
            // '#' may consume any suffix length, including zero.
            (0..=words.len()).any(|n| matches_from(rest, &words[n..]))
        }
        Some((seg, rest)) => match words.split_first() {
            Some((word, word_rest)) if *seg == "*" || seg == word => {
                matches_from(rest, word_rest)
            }
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("risk.check.request", "risk.check.request"));
        assert!(!topic_matches("risk.check.request", "risk.check.response"));
    }

    #[test]
    fn test_star_matches_single_word() {
        assert!(topic_matches("market.price.*", "market.price.BTC_USDT"));
        assert!(!topic_matches("market.price.*", "market.price.BTC.USDT"));
        assert!(!topic_matches("market.price.*", "market.price"));
    }

    #[test]
    fn test_hash_matches_any_suffix() {
        assert!(topic_matches("config.request.#", "config.request.add"));
        assert!(topic_matches("config.request.#", "config.request"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches(
            "strategy.request.#",
            "strategy.request.order_flow.high"
        ));
    }

    #[test]
    fn test_hash_in_middle() {
        assert!(topic_matches("a.#.z", "a.z"));
        assert!(topic_matches("a.#.z", "a.b.c.z"));
        assert!(!topic_matches("a.#.z", "a.b.c"));
    }

    #[test]
    fn test_indicator_result_key_flattens_symbol() {
        assert_eq!(keys::indicator_result("BTC/USDT", "1h"), "result.BTC_USDT.1h");
        assert!(topic_matches("result.*.1h", &keys::indicator_result("BTC/USDT", "1h")));
    }
}
