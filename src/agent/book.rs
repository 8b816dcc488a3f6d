//! Book application (spec.md §4.7): apply a decision against the
//! simulated account and holdings.

use crate::agent::types::*;
use crate::money::Money;
use chrono::{DateTime, Utc};

pub struct BookResult {
    pub account: Account,
    pub holdings: std::collections::HashMap<String, Holding>,
    pub trade_event: Option<TradeEvent>,
    pub closed_trades: Vec<ClosedTrade>,
    pub executed: bool,
    pub blocked_reason: Option<&'static str>,
}

pub struct BookInputs<'a> {
    pub account: Account,
    pub holdings: std::collections::HashMap<String, Holding>,
    pub decision: &'a Decision,
    pub mark_price: f64,
    pub commission_rate: f64,
    pub exchange: Exchange,
    pub lot_size: u64,
    pub now: DateTime<Utc>,
}

/// Apply one decision's action to the book. BUY/SELL mutate cash and
/// holdings; SHORT is rejected before any book mutation (this simulation
/// carries no borrow/margin model, so a synthetic negative book would
/// misstate realized P&L — see DESIGN.md Open Questions); HOLD and blocked
/// orders are a no-op other than updating mark price.
pub fn apply_decision(inputs: BookInputs<'_>) -> BookResult {
    let BookInputs {
        mut account,
        mut holdings,
        decision,
        mark_price,
        commission_rate,
        exchange,
        lot_size,
        now,
    } = inputs;

    let holding = holdings
        .entry(decision.symbol.clone())
        .or_insert_with(|| Holding {
            symbol: decision.symbol.clone(),
            ..Default::default()
        });
    holding.mark_price = mark_price;

    let mut trade_event = None;
    let mut closed_trades = Vec::new();
    let mut executed = false;
    let mut blocked_reason = None;

    let qty = round_to_lot(decision.quantity, lot_size);

    match decision.action {
        Action::Short => {
            blocked_reason = Some("short_not_supported");
        }
        Action::Buy => {
            if qty > 0 {
                let notional = Money::from_major(qty as f64 * mark_price);
                let fee = notional.scale(commission_rate).max(Money::ZERO);
                let total_cost = notional + fee;
                if total_cost <= account.available_balance {
                    account.available_balance -= total_cost;
                    holding.open_lots.push(OpenLot {
                        entry_order_id: format!("{}-{}", decision.trader_id, decision.cycle_number),
                        entry_time: now,
                        entry_price: mark_price,
                        entry_qty: qty,
                        entry_fee_remaining: fee,
                    });
                    holding.shares += qty;
                    holding.avg_cost = weighted_avg_cost(holding);
                    executed = true;
                    let own_value = holding.value();
                    let position_after_qty = holding.shares;
                    let position_after_avg_cost = holding.avg_cost;
                    let position_after_mark = holding.mark_price;
                    trade_event = Some(TradeEvent {
                        symbol: decision.symbol.clone(),
                        side: Side::Buy,
                        quantity: qty,
                        price: mark_price,
                        fee,
                        cash_after: account.available_balance,
                        total_equity_after: account.available_balance
                            + own_value
                            + holdings_value_excluding(&holdings, &decision.symbol),
                        position_after_qty,
                        position_after_avg_cost,
                        position_after_mark,
                        ts: now,
                    });
                } else {
                    blocked_reason = Some("insufficient_cash");
                }
            }
        }
        Action::Sell => {
            if qty > 0 && holding.shares > 0 {
                let sell_qty_requested = qty.min(holding.shares);
                if exchange.is_t_plus_one() && oldest_lot_same_day(holding, sell_qty_requested, now) {
                    blocked_reason = Some("t_plus_one_block");
                } else {
                    let sell_qty = qty.min(holding.shares);
                    let (realized, fee, mut trades) =
                        sell_fifo(holding, sell_qty, mark_price, commission_rate, now);
                    let notional = Money::from_major(sell_qty as f64 * mark_price);
                    account.available_balance += notional - fee;
                    executed = true;
                    closed_trades.append(&mut trades);
                    let own_value = holding.value();
                    let position_after_qty = holding.shares;
                    let position_after_avg_cost = holding.avg_cost;
                    let position_after_mark = holding.mark_price;
                    trade_event = Some(TradeEvent {
                        symbol: decision.symbol.clone(),
                        side: Side::Sell,
                        quantity: sell_qty,
                        price: mark_price,
                        fee,
                        cash_after: account.available_balance,
                        total_equity_after: account.available_balance
                            + own_value
                            + holdings_value_excluding(&holdings, &decision.symbol),
                        position_after_qty,
                        position_after_avg_cost,
                        position_after_mark,
                        ts: now,
                    });
                    let _ = realized;
                }
            }
        }
        Action::Hold => {}
    }

    account.position_count = holdings.values().filter(|h| h.shares > 0).count();

    BookResult {
        account,
        holdings,
        trade_event,
        closed_trades,
        executed,
        blocked_reason,
    }
}

fn round_to_lot(qty: u64, lot_size: u64) -> u64 {
    if lot_size <= 1 {
        return qty;
    }
    (qty / lot_size) * lot_size
}

fn weighted_avg_cost(holding: &Holding) -> f64 {
    if holding.shares == 0 {
        return 0.0;
    }
    let total: f64 = holding
        .open_lots
        .iter()
        .map(|l| l.entry_price * l.entry_qty as f64)
        .sum();
    total / holding.shares as f64
}

/// True if any lot the FIFO queue would actually consume to fill `sell_qty`
/// was opened today. Lots beyond what the sell needs don't block it even if
/// they are same-day (spec.md §4.2 T+1 restriction).
fn oldest_lot_same_day(holding: &Holding, sell_qty: u64, now: DateTime<Utc>) -> bool {
    let mut remaining = sell_qty;
    for lot in &holding.open_lots {
        if remaining == 0 {
            break;
        }
        if lot.entry_time.date_naive() == now.date_naive() {
            return true;
        }
        remaining = remaining.saturating_sub(lot.entry_qty);
    }
    false
}

/// Consume FIFO against open lots, crediting realized P&L and splitting
/// commission proportionally between the entry fee share and a fresh exit
/// fee.
fn sell_fifo(
    holding: &mut Holding,
    mut qty_to_sell: u64,
    exit_price: f64,
    commission_rate: f64,
    now: DateTime<Utc>,
) -> (Money, Money, Vec<ClosedTrade>) {
    let mut realized_total = Money::ZERO;
    let mut exit_fee_total = Money::ZERO;
    let mut closed = Vec::new();

    while qty_to_sell > 0 {
        let Some(lot) = holding.open_lots.first_mut() else {
            break;
        };
        let qty = qty_to_sell.min(lot.entry_qty);
        let entry_fee_share = if lot.entry_qty > 0 {
            lot.entry_fee_remaining.scale(qty as f64 / lot.entry_qty as f64)
        } else {
            Money::ZERO
        };
        let exit_notional = Money::from_major(qty as f64 * exit_price);
        let exit_fee = exit_notional.scale(commission_rate).max(Money::ZERO);

        let realized = Money::from_major((exit_price - lot.entry_price) * qty as f64)
            - entry_fee_share
            - exit_fee;

        closed.push(ClosedTrade {
            symbol: holding.symbol.clone(),
            side: Side::Sell,
            entry_time: lot.entry_time,
            exit_time: now,
            quantity: qty,
            entry_price: lot.entry_price,
            exit_price,
            realized_pnl: realized,
            fee: entry_fee_share + exit_fee,
        });

        realized_total += realized;
        exit_fee_total += exit_fee;

        lot.entry_qty -= qty;
        lot.entry_fee_remaining -= entry_fee_share;
        qty_to_sell -= qty;
        if lot.entry_qty == 0 {
            holding.open_lots.remove(0);
        }
    }

    holding.shares = holding.open_lots.iter().map(|l| l.entry_qty).sum();
    holding.avg_cost = weighted_avg_cost(holding);

    (realized_total, exit_fee_total, closed)
}

fn holdings_value_excluding(
    holdings: &std::collections::HashMap<String, Holding>,
    symbol: &str,
) -> Money {
    holdings
        .iter()
        .filter(|(s, _)| s.as_str() != symbol)
        .map(|(_, h)| h.value())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn decision(action: Action, qty: u64, symbol: &str) -> Decision {
        Decision {
            timestamp: Utc::now(),
            cycle_number: 1,
            trader_id: "t1".into(),
            symbol: symbol.into(),
            action,
            quantity: qty,
            confidence: 0.9,
            reasoning: "x".into(),
            decision_source: "test".into(),
            executed: false,
            llm_meta: None,
            decisions: vec![],
            execution_log: vec![],
        }
    }

    #[test]
    fn buy_debits_cash_and_opens_lot() {
        let account = Account::new_default();
        let result = apply_decision(BookInputs {
            account,
            holdings: HashMap::new(),
            decision: &decision(Action::Buy, 100, "AAPL"),
            mark_price: 10.0,
            commission_rate: 0.001,
            exchange: Exchange::Us,
            lot_size: 1,
            now: Utc::now(),
        });
        assert!(result.executed);
        let holding = &result.holdings["AAPL"];
        assert_eq!(holding.shares, 100);
        assert_eq!(holding.open_lots.len(), 1);
        assert!(result.account.available_balance < Account::new_default().available_balance);
    }

    #[test]
    fn sell_fifo_realizes_pnl_net_of_fees() {
        let account = Account::new_default();
        let buy = apply_decision(BookInputs {
            account,
            holdings: HashMap::new(),
            decision: &decision(Action::Buy, 100, "AAPL"),
            mark_price: 10.0,
            commission_rate: 0.0,
            exchange: Exchange::Us,
            lot_size: 1,
            now: Utc::now() - chrono::Duration::days(1),
        });

        let sell = apply_decision(BookInputs {
            account: buy.account,
            holdings: buy.holdings,
            decision: &decision(Action::Sell, 100, "AAPL"),
            mark_price: 12.0,
            commission_rate: 0.0,
            exchange: Exchange::Us,
            lot_size: 1,
            now: Utc::now(),
        });
        assert!(sell.executed);
        assert_eq!(sell.closed_trades.len(), 1);
        assert_eq!(sell.closed_trades[0].realized_pnl, Money::from_major(200.0));
        assert_eq!(sell.holdings["AAPL"].shares, 0);
    }

    #[test]
    fn t_plus_one_blocks_same_day_sell_on_cn_a() {
        let account = Account::new_default();
        let buy = apply_decision(BookInputs {
            account,
            holdings: HashMap::new(),
            decision: &decision(Action::Buy, 100, "600000.SH"),
            mark_price: 10.0,
            commission_rate: 0.0,
            exchange: Exchange::CnA,
            lot_size: 100,
            now: Utc::now(),
        });

        let sell = apply_decision(BookInputs {
            account: buy.account,
            holdings: buy.holdings,
            decision: &decision(Action::Sell, 100, "600000.SH"),
            mark_price: 11.0,
            commission_rate: 0.0,
            exchange: Exchange::CnA,
            lot_size: 100,
            now: Utc::now(),
        });
        assert!(!sell.executed);
        assert_eq!(sell.blocked_reason, Some("t_plus_one_block"));
    }

    #[test]
    fn t_plus_one_allows_sell_confined_to_older_fifo_lots() {
        let account = Account::new_default();
        let buy_yesterday = apply_decision(BookInputs {
            account,
            holdings: HashMap::new(),
            decision: &decision(Action::Buy, 100, "600000.SH"),
            mark_price: 10.0,
            commission_rate: 0.0,
            exchange: Exchange::CnA,
            lot_size: 100,
            now: Utc::now() - chrono::Duration::days(1),
        });
        let buy_today = apply_decision(BookInputs {
            account: buy_yesterday.account,
            holdings: buy_yesterday.holdings,
            decision: &decision(Action::Buy, 100, "600000.SH"),
            mark_price: 10.0,
            commission_rate: 0.0,
            exchange: Exchange::CnA,
            lot_size: 100,
            now: Utc::now(),
        });

        // Only the older (yesterday's) lot is needed to fill this sell, so
        // today's newly-opened lot shouldn't block it.
        let sell = apply_decision(BookInputs {
            account: buy_today.account,
            holdings: buy_today.holdings,
            decision: &decision(Action::Sell, 100, "600000.SH"),
            mark_price: 11.0,
            commission_rate: 0.0,
            exchange: Exchange::CnA,
            lot_size: 100,
            now: Utc::now(),
        });
        assert!(sell.executed);
        assert_eq!(sell.holdings["600000.SH"].shares, 100);
    }

    #[test]
    fn short_is_rejected_without_mutating_the_book() {
        let account = Account::new_default();
        let before = account.available_balance;
        let result = apply_decision(BookInputs {
            account,
            holdings: HashMap::new(),
            decision: &decision(Action::Short, 100, "AAPL"),
            mark_price: 10.0,
            commission_rate: 0.001,
            exchange: Exchange::Us,
            lot_size: 1,
            now: Utc::now(),
        });
        assert!(!result.executed);
        assert_eq!(result.blocked_reason, Some("short_not_supported"));
        assert_eq!(result.account.available_balance, before);
        assert_eq!(result.holdings["AAPL"].shares, 0);
    }

    #[test]
    fn lot_size_rounds_quantity_down() {
        assert_eq!(round_to_lot(250, 100), 200);
        assert_eq!(round_to_lot(99, 100), 0);
    }
}
