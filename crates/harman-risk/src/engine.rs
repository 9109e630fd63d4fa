//! Worst-case notional arithmetic, in integer cents.

use crate::types::{Exposure, Quote, QuoteBook, RiskConfig, RiskDecision, RiskRejection};
use chrono::{DateTime, Utc};
use harman_oms::Action;

/// Binary upper bound: the most one contract can ever cost.
const WORST_CASE_FALLBACK_CENTS: i64 = 100;

/// Worst-case cost of one contract for the given action.
///
/// Buys are charged the ask; sells are charged `100 − bid` (the payout owed
/// if the sold side resolves against the seller). A missing or stale quote
/// falls back to the 100¢ bound rather than admitting on bad data.
pub fn worst_case_unit_cost_cents(
    action: Action,
    quote: Option<&Quote>,
    now: DateTime<Utc>,
    cfg: &RiskConfig,
) -> i64 {
    let quote = match quote {
        Some(q) if !q.is_stale(now, cfg.quote_stale_after) => q,
        _ => return WORST_CASE_FALLBACK_CENTS,
    };

    let cost = match action {
        Action::Buy => i64::from(quote.yes_ask_cents),
        Action::Sell => 100 - i64::from(quote.yes_bid_cents),
    };
    // A crossed or corrupt quote must not understate exposure.
    cost.clamp(1, WORST_CASE_FALLBACK_CENTS)
}

/// Fold open exposures into total worst-case notional.
pub fn open_notional_cents(
    exposures: &[Exposure],
    quotes: &QuoteBook,
    now: DateTime<Utc>,
    cfg: &RiskConfig,
) -> i64 {
    exposures
        .iter()
        .map(|e| {
            let unit = worst_case_unit_cost_cents(e.action, quotes.get(&e.ticker), now, cfg);
            e.quantity.saturating_mul(unit)
        })
        .sum()
}

/// Headroom left under the effective limit; never negative.
pub fn available_notional_cents(max_notional_cents: i64, open_notional_cents: i64) -> i64 {
    (max_notional_cents - open_notional_cents).max(0)
}

/// Evaluate a candidate order against the session's effective limit.
///
/// `exposures` must be read under the admission transaction's session lock
/// so concurrent admissions serialize; `quotes` are fetched beforehand
/// (quote lookup is a suspension point and never happens inside the
/// transaction).
pub fn evaluate(
    candidate: &Exposure,
    exposures: &[Exposure],
    quotes: &QuoteBook,
    max_notional_cents: i64,
    now: DateTime<Utc>,
    cfg: &RiskConfig,
) -> RiskDecision {
    let open = open_notional_cents(exposures, quotes, now, cfg);
    let unit = worst_case_unit_cost_cents(candidate.action, quotes.get(&candidate.ticker), now, cfg);
    let candidate_notional = candidate.quantity.saturating_mul(unit);
    let available = available_notional_cents(max_notional_cents, open);

    let rejection = if candidate_notional > available {
        Some(RiskRejection::LimitBreached {
            candidate_notional_cents: candidate_notional,
            available_notional_cents: available,
        })
    } else {
        None
    };

    RiskDecision {
        open_notional_cents: open,
        candidate_notional_cents: candidate_notional,
        available_notional_cents: available,
        rejection,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashMap;

    fn cfg() -> RiskConfig {
        RiskConfig {
            default_max_notional_cents: 5_000, // $50
            quote_stale_after: Duration::seconds(30),
        }
    }

    fn quote(ticker: &str, bid: i32, ask: i32, as_of: DateTime<Utc>) -> Quote {
        Quote {
            ticker: ticker.to_string(),
            yes_bid_cents: bid,
            yes_ask_cents: ask,
            last_trade_cents: Some((bid + ask) / 2),
            as_of,
        }
    }

    fn book(now: DateTime<Utc>, entries: &[(&str, i32, i32)]) -> QuoteBook {
        entries
            .iter()
            .map(|(t, bid, ask)| (t.to_string(), quote(t, *bid, *ask, now)))
            .collect()
    }

    fn exposure(ticker: &str, action: Action, qty: i64) -> Exposure {
        Exposure {
            ticker: ticker.to_string(),
            action,
            quantity: qty,
        }
    }

    #[test]
    fn buy_uses_ask_sell_uses_complement_of_bid() {
        let now = Utc::now();
        let q = quote("T", 40, 45, now);
        assert_eq!(
            worst_case_unit_cost_cents(Action::Buy, Some(&q), now, &cfg()),
            45
        );
        assert_eq!(
            worst_case_unit_cost_cents(Action::Sell, Some(&q), now, &cfg()),
            60
        );
    }

    #[test]
    fn stale_or_missing_quote_falls_back_to_binary_bound() {
        let now = Utc::now();
        let old = quote("T", 40, 45, now - Duration::seconds(120));
        assert_eq!(
            worst_case_unit_cost_cents(Action::Buy, Some(&old), now, &cfg()),
            100
        );
        assert_eq!(worst_case_unit_cost_cents(Action::Buy, None, now, &cfg()), 100);
    }

    #[test]
    fn breach_scenario_eighty_dollar_candidate_on_fifty_limit() {
        // max_notional $50, candidate 100 @ ask $0.80 => worst case $80.
        let now = Utc::now();
        let quotes = book(now, &[("INXD-25-B4000", 78, 80)]);
        let candidate = exposure("INXD-25-B4000", Action::Buy, 100);

        let d = evaluate(&candidate, &[], &quotes, 5_000, now, &cfg());
        assert_eq!(d.candidate_notional_cents, 8_000);
        assert_eq!(d.available_notional_cents, 5_000);
        assert!(!d.admitted());
        assert!(matches!(
            d.rejection,
            Some(RiskRejection::LimitBreached { .. })
        ));
    }

    #[test]
    fn admits_within_headroom_left_by_open_exposure() {
        let now = Utc::now();
        let quotes = book(now, &[("A", 40, 45), ("B", 20, 25)]);
        // Open: 40 contracts buying A at ask 45c = 1800c.
        let open = vec![exposure("A", Action::Buy, 40)];
        // Candidate: 100 contracts buying B at ask 25c = 2500c; 1800 + 2500 < 5000.
        let candidate = exposure("B", Action::Buy, 100);

        let d = evaluate(&candidate, &open, &quotes, 5_000, now, &cfg());
        assert_eq!(d.open_notional_cents, 1_800);
        assert_eq!(d.available_notional_cents, 3_200);
        assert!(d.admitted());

        // One more contract of headroom gone and it tips over.
        let candidate = exposure("B", Action::Buy, 129);
        let d = evaluate(&candidate, &open, &quotes, 5_000, now, &cfg());
        assert!(!d.admitted());
    }

    #[test]
    fn sell_exposure_counts_the_short_side_payout() {
        let now = Utc::now();
        let quotes = book(now, &[("A", 90, 92)]);
        // Selling at bid 90 risks 10c per contract.
        let open = vec![exposure("A", Action::Sell, 100)];
        let candidate = exposure("A", Action::Buy, 10);

        let d = evaluate(&candidate, &open, &quotes, 5_000, now, &cfg());
        assert_eq!(d.open_notional_cents, 1_000);
        assert!(d.admitted());
    }

    #[test]
    fn available_notional_never_negative() {
        assert_eq!(available_notional_cents(1_000, 2_500), 0);

        let now = Utc::now();
        let quotes: QuoteBook = HashMap::new();
        // Open exposure already past the limit (stale fallback at 100c).
        let open = vec![exposure("A", Action::Buy, 100)];
        let candidate = exposure("B", Action::Buy, 1);
        let d = evaluate(&candidate, &open, &quotes, 5_000, now, &cfg());
        assert_eq!(d.available_notional_cents, 0);
        assert!(!d.admitted());
    }

    #[test]
    fn session_override_replaces_default() {
        let c = cfg();
        assert_eq!(c.effective_max_notional(None), 5_000);
        assert_eq!(c.effective_max_notional(Some(250_000)), 250_000);
    }

    #[test]
    fn crossed_quote_cannot_understate_exposure() {
        let now = Utc::now();
        // bid 100 would make the sell side cost zero; clamp keeps it at 1.
        let q = quote("T", 100, 100, now);
        assert_eq!(
            worst_case_unit_cost_cents(Action::Sell, Some(&q), now, &cfg()),
            1
        );
    }
}
