//! Optional payload validation.
//!
//! Validators are keyed by [`ChannelFamily`]. Validation is observability
//! only: the client logs failures and still delivers the raw envelope.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::channel::ChannelFamily;

/// Balance change caused by a fill (`balance_events`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BalanceEvent {
    /// Epoch milliseconds.
    pub created_at: i64,
    pub fees: String,
    pub fill_id: String,
    pub funding_index: String,
    pub market: String,
    pub realized_funding: String,
    pub realized_pnl: String,
    pub settlement_asset_balance_after: String,
    pub settlement_asset_balance_before: String,
    pub settlement_asset_price: String,
    pub status: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `s` = snapshot, `d` = delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BookUpdateType {
    #[serde(rename = "s")]
    Snapshot,
    #[serde(rename = "d")]
    Delta,
}

/// Order book update (`order_book.*`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceBookUpdate {
    pub best_ask_api: Map<String, Value>,
    pub best_ask_interactive: Map<String, Value>,
    pub best_bid_api: Map<String, Value>,
    pub best_bid_interactive: Map<String, Value>,
    pub deletes: Vec<Map<String, Value>>,
    pub inserts: Vec<Map<String, Value>>,
    pub updates: Vec<Map<String, Value>>,
    pub last_updated_at: i64,
    pub market: String,
    pub seq_no: u64,
    pub update_type: BookUpdateType,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A successfully validated payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedPayload {
    BalanceEvent(BalanceEvent),
    PriceBook(PriceBookUpdate),
    /// Accepted by a caller-supplied validator without a typed model.
    Other(Value),
}

/// `(channel, payload) -> validated model | reason`.
pub type PayloadValidator = Arc<dyn Fn(&str, &Value) -> Result<ValidatedPayload, String> + Send + Sync>;

/// Validators per channel family. Families without a validator pass unchecked.
#[derive(Clone, Default)]
pub struct ValidatorSet {
    validators: HashMap<ChannelFamily, PayloadValidator>,
}

impl std::fmt::Debug for ValidatorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.validators.keys()).finish()
    }
}

fn typed<T, F>(wrap: F) -> PayloadValidator
where
    T: for<'de> Deserialize<'de>,
    F: Fn(T) -> ValidatedPayload + Send + Sync + 'static,
{
    Arc::new(move |_channel, payload| T::deserialize(payload).map(&wrap).map_err(|e| e.to_string()))
}

impl ValidatorSet {
    /// No validators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed models for `balance_events` and `order_book`.
    pub fn with_defaults() -> Self {
        Self::new()
            .with(ChannelFamily::BalanceEvents, typed(ValidatedPayload::BalanceEvent))
            .with(ChannelFamily::OrderBook, typed(ValidatedPayload::PriceBook))
    }

    pub fn with(mut self, family: ChannelFamily, validator: PayloadValidator) -> Self {
        self.validators.insert(family, validator);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Validate `payload` for `channel`.
    ///
    /// Returns `None` when no validator covers the channel's family.
    pub fn validate(&self, channel: &str, payload: &Value) -> Option<Result<ValidatedPayload, String>> {
        let family = ChannelFamily::from_name(channel)?;
        let validator = self.validators.get(&family)?;
        Some(validator(channel, payload))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn balance_event() -> Value {
        json!({
            "created_at": 1_700_000_000_000_i64,
            "fees": "0.01",
            "fill_id": "f-1",
            "funding_index": "0",
            "market": "BTC-USD-PERP",
            "realized_funding": "0",
            "realized_pnl": "1.5",
            "settlement_asset_balance_after": "101.5",
            "settlement_asset_balance_before": "100",
            "settlement_asset_price": "1",
            "status": "FILLED",
            "type": "TRADE",
            "venue_extra": 7
        })
    }

    #[test]
    fn validates_balance_events() {
        let set = ValidatorSet::with_defaults();
        let Some(Ok(ValidatedPayload::BalanceEvent(ev))) = set.validate("balance_events", &balance_event()) else {
            panic!("expected a balance event");
        };
        assert_eq!(ev.event_type, "TRADE");
        assert_eq!(ev.extra["venue_extra"], 7);

        let mut bad = balance_event();
        bad.as_object_mut().unwrap().remove("fill_id");
        assert!(matches!(set.validate("balance_events", &bad), Some(Err(_))));
    }

    #[test]
    fn validates_order_book() {
        let payload = json!({
            "best_ask_api": {}, "best_ask_interactive": {},
            "best_bid_api": {}, "best_bid_interactive": {},
            "deletes": [], "inserts": [{"price": "50000", "size": "1"}], "updates": [],
            "last_updated_at": 1, "market": "BTC-USD-PERP", "seq_no": 42, "update_type": "s"
        });
        let set = ValidatorSet::with_defaults();
        let got = set.validate("order_book.BTC-USD-PERP.snapshot@15@100ms", &payload);
        let Some(Ok(ValidatedPayload::PriceBook(book))) = got else {
            panic!("expected a book update");
        };
        assert_eq!(book.update_type, BookUpdateType::Snapshot);
        assert_eq!(book.seq_no, 42);

        let wrong = json!({"update_type": "x"});
        assert!(matches!(set.validate("order_book.BTC-USD-PERP", &wrong), Some(Err(_))));
    }

    #[test]
    fn uncovered_families_pass() {
        let set = ValidatorSet::with_defaults();
        assert!(set.validate("trades.BTC-USD-PERP", &json!({})).is_none());
        assert!(set.validate("nonsense", &json!({})).is_none());
    }

    #[test]
    fn custom_validator() {
        let set = ValidatorSet::new().with(
            ChannelFamily::Bbo,
            Arc::new(|_, p| match p.get("bid") {
                Some(_) => Ok(ValidatedPayload::Other(p.clone())),
                None => Err("missing bid".into()),
            }),
        );
        assert!(matches!(set.validate("bbo.ETH-USD-PERP", &json!({"bid": "1"})), Some(Ok(_))));
        assert_eq!(set.validate("bbo.ETH-USD-PERP", &json!({})), Some(Err("missing bid".into())));
    }
}
