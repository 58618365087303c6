//! Rebalance planning: diff target allocations against the current
//! valuation and emit a capped per-asset action list.
//!
//! Pure computation over a [`PortfolioState`] and a [`Strategy`]; nothing
//! here touches the network or the store.

use crate::model::{PortfolioState, Strategy};
use crate::normalize::{round2, round8};
use balancebot_exchange::OrderSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Buy,
    Sell,
    Hold,
}

impl ActionKind {
    pub fn side(&self) -> Option<OrderSide> {
        match self {
            ActionKind::Buy => Some(OrderSide::Buy),
            ActionKind::Sell => Some(OrderSide::Sell),
            ActionKind::Hold => None,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ActionKind::Buy => "buy",
            ActionKind::Sell => "sell",
            ActionKind::Hold => "hold",
        })
    }
}

/// One planned adjustment for a base asset.
#[derive(Debug, Clone)]
pub struct RebalanceAction {
    pub asset: String,
    pub kind: ActionKind,
    /// Current position value in quote units.
    pub current_value: f64,
    /// Target position value in quote units.
    pub target_value: f64,
    /// target − current, signed.
    pub delta: f64,
    /// Quote amount to trade this round, capped by `order_size_pct`.
    pub order_amount: f64,
    /// Limit price biased one step better than market.
    pub limit_price: f64,
    /// Base volume = order_amount / market_price, rounded to 8 decimals.
    /// Exchange lot-size normalization happens downstream.
    pub volume: f64,
    pub market_price: f64,
}

/// Full plan for one strategy at one point in time.
#[derive(Debug, Clone)]
pub struct RebalancePlan {
    pub strategy_id: u64,
    pub nav: f64,
    pub actions: Vec<RebalanceAction>,
    /// Sum of absolute deltas across all assets.
    pub total_delta: f64,
    /// Count of non-hold actions.
    pub orders_needed: usize,
    pub rebalance_needed: bool,
}

impl RebalancePlan {
    pub fn action(&self, asset: &str) -> Option<&RebalanceAction> {
        self.actions.iter().find(|a| a.asset == asset)
    }
}

impl std::fmt::Display for RebalancePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "plan for strategy {} (NAV {:.2}, total delta {:.2}, {} orders)",
            self.strategy_id, self.nav, self.total_delta, self.orders_needed
        )?;
        for a in &self.actions {
            writeln!(
                f,
                "  {:<8} {:<4} current {:>12.2} target {:>12.2} delta {:>+12.2} amount {:>12.2} @ {:.8}",
                a.asset, a.kind, a.current_value, a.target_value, a.delta, a.order_amount, a.limit_price
            )?;
        }
        Ok(())
    }
}

/// Build a plan from a strategy and its current valuation.
///
/// Covers every asset in the union of current positions and target
/// allocations, the quote asset included (its action is informational; the
/// tick engine never trades the quote against itself). Deltas under
/// `min_delta_quote` become holds; larger deltas are capped at
/// `order_size_pct` of NAV so big rebalances spread across multiple ticks.
pub fn build_plan(strategy: &Strategy, state: &PortfolioState) -> RebalancePlan {
    let nav = state.nav;
    let max_order = strategy.order_size_pct / 100.0 * nav;

    // Union of allocated and currently-held assets, in allocation order
    // first so plan output is stable.
    let mut assets: Vec<String> = strategy.allocations.iter().map(|a| a.asset.clone()).collect();
    for p in &state.positions {
        if !assets.contains(&p.asset) {
            assets.push(p.asset.clone());
        }
    }

    let mut actions = Vec::with_capacity(assets.len());
    let mut total_delta = 0.0;

    for asset in assets {
        let current_value = state
            .position(&asset)
            .map(|p| p.quote_value)
            .unwrap_or(0.0);
        let target_value = round2(strategy.target_pct(&asset) / 100.0 * nav);
        let delta = round2(target_value - current_value);
        total_delta += delta.abs();

        let market_price = state.price(&asset).unwrap_or(0.0);

        if delta.abs() < strategy.min_delta_quote || market_price <= 0.0 {
            actions.push(RebalanceAction {
                asset,
                kind: ActionKind::Hold,
                current_value,
                target_value,
                delta,
                order_amount: 0.0,
                limit_price: 0.0,
                volume: 0.0,
                market_price,
            });
            continue;
        }

        let kind = if delta > 0.0 {
            ActionKind::Buy
        } else {
            ActionKind::Sell
        };
        let order_amount = round2(delta.abs().min(max_order));
        // Quote one step better than market: under for buys, over for sells.
        let step = strategy.order_step_pct / 100.0;
        let limit_price = match kind {
            ActionKind::Buy => market_price * (1.0 - step),
            ActionKind::Sell => market_price * (1.0 + step),
            ActionKind::Hold => unreachable!(),
        };
        let volume = round8(order_amount / market_price);

        actions.push(RebalanceAction {
            asset,
            kind,
            current_value,
            target_value,
            delta,
            order_amount,
            limit_price,
            volume,
            market_price,
        });
    }

    let orders_needed = actions
        .iter()
        .filter(|a| a.kind != ActionKind::Hold)
        .count();
    let total_delta = round2(total_delta);

    RebalancePlan {
        strategy_id: strategy.id,
        nav,
        actions,
        total_delta,
        orders_needed,
        rebalance_needed: total_delta >= strategy.min_delta_quote,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PositionRecord, Strategy};
    use chrono::Utc;

    fn strategy(order_size_pct: f64) -> Strategy {
        let mut s = Strategy::from_json(
            r#"{
                "quote_asset": "USDT",
                "min_delta_quote": 10.0,
                "order_step_pct": 0.1,
                "allocations": [
                    { "asset": "BTC",  "target_percentage": 50.0 },
                    { "asset": "ETH",  "target_percentage": 30.0 },
                    { "asset": "USDT", "target_percentage": 20.0 }
                ]
            }"#,
        )
        .unwrap();
        s.id = 7;
        s.order_size_pct = order_size_pct;
        s
    }

    fn state(positions: Vec<PositionRecord>) -> PortfolioState {
        let nav = positions.iter().map(|p| p.quote_value).sum();
        PortfolioState {
            connector_id: 1,
            strategy_id: 7,
            timestamp: Utc::now(),
            quote_asset: "USDT".into(),
            nav,
            positions,
            source: "test".into(),
            universe: vec!["BTC".into(), "ETH".into()],
        }
    }

    fn pos(asset: &str, amount: f64, price: f64) -> PositionRecord {
        PositionRecord {
            asset: asset.into(),
            amount,
            quote_value: round2(amount * price),
            price,
        }
    }

    #[test]
    fn drift_vector_produces_expected_actions() {
        // current 40/20/40, target 50/30/20 at NAV 10000.
        let state = state(vec![
            pos("BTC", 0.1, 40_000.0),
            pos("ETH", 1.0, 2_000.0),
            pos("USDT", 4_000.0, 1.0),
        ]);
        let plan = build_plan(&strategy(100.0), &state);

        let btc = plan.action("BTC").unwrap();
        assert_eq!(btc.kind, ActionKind::Buy);
        assert!((btc.delta - 1_000.0).abs() < 1e-9);
        assert!((btc.order_amount - 1_000.0).abs() < 1e-9);

        let eth = plan.action("ETH").unwrap();
        assert_eq!(eth.kind, ActionKind::Buy);
        assert!((eth.delta - 1_000.0).abs() < 1e-9);

        let usdt = plan.action("USDT").unwrap();
        assert_eq!(usdt.kind, ActionKind::Sell);
        assert!((usdt.delta + 2_000.0).abs() < 1e-9);

        for a in &plan.actions {
            assert!(a.order_amount <= a.delta.abs() + 1e-9);
        }
        assert_eq!(plan.orders_needed, 3);
        assert!(plan.rebalance_needed);
        assert!((plan.total_delta - 4_000.0).abs() < 1e-9);
    }

    #[test]
    fn order_size_cap_limits_single_order() {
        let state = state(vec![
            pos("BTC", 0.1, 40_000.0),
            pos("ETH", 1.0, 2_000.0),
            pos("USDT", 4_000.0, 1.0),
        ]);
        // Cap at 5% of NAV = 500, below the 1000 delta.
        let plan = build_plan(&strategy(5.0), &state);

        let btc = plan.action("BTC").unwrap();
        assert!((btc.order_amount - 500.0).abs() < 1e-9);
        assert!((btc.delta - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn small_delta_is_hold() {
        // Already balanced within min_delta_quote.
        let state = state(vec![
            pos("BTC", 0.125, 40_000.0),
            pos("ETH", 1.5, 2_000.0),
            pos("USDT", 2_000.0, 1.0),
        ]);
        let plan = build_plan(&strategy(100.0), &state);

        assert!(plan.actions.iter().all(|a| a.kind == ActionKind::Hold));
        assert_eq!(plan.orders_needed, 0);
        assert!(!plan.rebalance_needed);
    }

    #[test]
    fn limit_prices_biased_one_step_off_market() {
        let state = state(vec![
            pos("BTC", 0.0, 40_000.0),
            pos("ETH", 2.5, 2_000.0),
            pos("USDT", 5_000.0, 1.0),
        ]);
        let plan = build_plan(&strategy(100.0), &state);

        // BTC buy: 0.1% under market.
        let btc = plan.action("BTC").unwrap();
        assert_eq!(btc.kind, ActionKind::Buy);
        assert!((btc.limit_price - 40_000.0 * 0.999).abs() < 1e-6);

        // ETH holds 5000 against a 3000 target: sell 0.1% over market.
        let eth = plan.action("ETH").unwrap();
        assert_eq!(eth.kind, ActionKind::Sell);
        assert!((eth.limit_price - 2_000.0 * 1.001).abs() < 1e-6);
    }

    #[test]
    fn held_asset_outside_target_is_sold_down() {
        // DOGE is held but not in the allocation: target value 0.
        let mut positions = vec![
            pos("BTC", 0.125, 40_000.0),
            pos("ETH", 1.5, 2_000.0),
            pos("USDT", 1_500.0, 1.0),
        ];
        positions.push(pos("DOGE", 5_000.0, 0.1));
        let plan = build_plan(&strategy(100.0), &state(positions));

        let doge = plan.action("DOGE").unwrap();
        assert_eq!(doge.kind, ActionKind::Sell);
        assert!((doge.target_value - 0.0).abs() < 1e-9);
        assert!((doge.order_amount - 500.0).abs() < 1e-9);
    }

    #[test]
    fn volume_is_order_amount_over_market() {
        let state = state(vec![
            pos("BTC", 0.0, 40_000.0),
            pos("ETH", 2.5, 2_000.0),
            pos("USDT", 5_000.0, 1.0),
        ]);
        let plan = build_plan(&strategy(100.0), &state);
        let btc = plan.action("BTC").unwrap();
        assert!((btc.volume - round8(btc.order_amount / 40_000.0)).abs() < 1e-12);
    }
}
