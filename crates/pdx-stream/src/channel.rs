//! Venue channel names.
//!
//! The streaming client treats channel names as opaque exact-match keys.
//! [`Channel`] only exists to render the names the venue expects, and
//! [`ChannelFamily`] to map a wire name back to its family (the text before
//! the first `.`), which payload validation and callers use.

use std::fmt;

/// Markets summary defaults to every market.
pub const ALL_MARKETS: &str = "ALL";

/// A channel family, i.e. the un-parameterized prefix of a channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelFamily {
    Account,
    BalanceEvents,
    Bbo,
    Fills,
    FundingData,
    FundingPayments,
    FundingRateComparison,
    MarketsSummary,
    Orders,
    OrderBook,
    Positions,
    Trades,
    Tradebusts,
    Transaction,
    Transfers,
}

impl ChannelFamily {
    pub const ALL: [ChannelFamily; 15] = [
        ChannelFamily::Account,
        ChannelFamily::BalanceEvents,
        ChannelFamily::Bbo,
        ChannelFamily::Fills,
        ChannelFamily::FundingData,
        ChannelFamily::FundingPayments,
        ChannelFamily::FundingRateComparison,
        ChannelFamily::MarketsSummary,
        ChannelFamily::Orders,
        ChannelFamily::OrderBook,
        ChannelFamily::Positions,
        ChannelFamily::Trades,
        ChannelFamily::Tradebusts,
        ChannelFamily::Transaction,
        ChannelFamily::Transfers,
    ];

    /// Wire prefix of this family.
    pub fn prefix(&self) -> &'static str {
        match self {
            ChannelFamily::Account => "account",
            ChannelFamily::BalanceEvents => "balance_events",
            ChannelFamily::Bbo => "bbo",
            ChannelFamily::Fills => "fills",
            ChannelFamily::FundingData => "funding_data",
            ChannelFamily::FundingPayments => "funding_payments",
            ChannelFamily::FundingRateComparison => "funding_rate_comparison",
            ChannelFamily::MarketsSummary => "markets_summary",
            ChannelFamily::Orders => "orders",
            ChannelFamily::OrderBook => "order_book",
            ChannelFamily::Positions => "positions",
            ChannelFamily::Trades => "trades",
            ChannelFamily::Tradebusts => "tradebusts",
            ChannelFamily::Transaction => "transaction",
            ChannelFamily::Transfers => "transfers",
        }
    }

    /// Family of a wire channel name, e.g. `"bbo.BTC-USD-PERP"` → `Bbo`.
    pub fn from_name(name: &str) -> Option<Self> {
        let prefix = channel_family(name);
        Self::ALL.into_iter().find(|f| f.prefix() == prefix)
    }
}

impl fmt::Display for ChannelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Split the family prefix off a channel name.
pub fn channel_family(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// A fully parameterized channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Channel {
    Account,
    BalanceEvents,
    Bbo { market: String },
    Fills { market: String },
    FundingData { market: String },
    FundingPayments { market: String },
    FundingRateComparison { market: String },
    MarketsSummary { market: Option<String> },
    Orders { market: String },
    /// Order book snapshots: depth, refresh rate (e.g. `"100ms"`) and an
    /// optional price-tick grouping.
    OrderBook {
        market: String,
        depth: u32,
        refresh_rate: String,
        price_tick: Option<String>,
    },
    Positions,
    Trades { market: String },
    Tradebusts,
    Transaction,
    Transfers,
}

impl Channel {
    pub fn family(&self) -> ChannelFamily {
        match self {
            Channel::Account => ChannelFamily::Account,
            Channel::BalanceEvents => ChannelFamily::BalanceEvents,
            Channel::Bbo { .. } => ChannelFamily::Bbo,
            Channel::Fills { .. } => ChannelFamily::Fills,
            Channel::FundingData { .. } => ChannelFamily::FundingData,
            Channel::FundingPayments { .. } => ChannelFamily::FundingPayments,
            Channel::FundingRateComparison { .. } => ChannelFamily::FundingRateComparison,
            Channel::MarketsSummary { .. } => ChannelFamily::MarketsSummary,
            Channel::Orders { .. } => ChannelFamily::Orders,
            Channel::OrderBook { .. } => ChannelFamily::OrderBook,
            Channel::Positions => ChannelFamily::Positions,
            Channel::Trades { .. } => ChannelFamily::Trades,
            Channel::Tradebusts => ChannelFamily::Tradebusts,
            Channel::Transaction => ChannelFamily::Transaction,
            Channel::Transfers => ChannelFamily::Transfers,
        }
    }

    /// Exact wire name of the channel.
    pub fn name(&self) -> String {
        let prefix = self.family().prefix();
        match self {
            Channel::Account
            | Channel::BalanceEvents
            | Channel::Positions
            | Channel::Tradebusts
            | Channel::Transaction
            | Channel::Transfers => prefix.to_owned(),
            Channel::Bbo { market }
            | Channel::Fills { market }
            | Channel::FundingData { market }
            | Channel::FundingPayments { market }
            | Channel::FundingRateComparison { market }
            | Channel::Orders { market }
            | Channel::Trades { market } => format!("{prefix}.{market}"),
            Channel::MarketsSummary { market } => {
                format!("{prefix}.{}", market.as_deref().unwrap_or(ALL_MARKETS))
            }
            Channel::OrderBook { market, depth, refresh_rate, price_tick } => match price_tick {
                Some(tick) => format!("{prefix}.{market}.snapshot@{depth}@{refresh_rate}@{tick}"),
                None => format!("{prefix}.{market}.snapshot@{depth}@{refresh_rate}"),
            },
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl From<Channel> for String {
    fn from(c: Channel) -> Self {
        c.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_names() {
        assert_eq!(Channel::Bbo { market: "BTC-USD-PERP".into() }.name(), "bbo.BTC-USD-PERP");
        assert_eq!(Channel::Account.name(), "account");
        assert_eq!(Channel::MarketsSummary { market: None }.name(), "markets_summary.ALL");
        assert_eq!(
            Channel::OrderBook {
                market: "BTC-USD-PERP".into(),
                depth: 15,
                refresh_rate: "100ms".into(),
                price_tick: None,
            }
            .name(),
            "order_book.BTC-USD-PERP.snapshot@15@100ms"
        );
        assert_eq!(
            Channel::OrderBook {
                market: "ETH-USD-PERP".into(),
                depth: 10,
                refresh_rate: "50ms".into(),
                price_tick: Some("0.1".into()),
            }
            .name(),
            "order_book.ETH-USD-PERP.snapshot@10@50ms@0.1"
        );
    }

    #[test]
    fn family_lookup() {
        assert_eq!(channel_family("order_book.BTC-USD-PERP.snapshot@15@100ms"), "order_book");
        assert_eq!(ChannelFamily::from_name("trades.BTC-USD-PERP"), Some(ChannelFamily::Trades));
        assert_eq!(ChannelFamily::from_name("positions"), Some(ChannelFamily::Positions));
        // "transaction" must not be confused with "transfers" or "tradebusts".
        assert_eq!(ChannelFamily::from_name("transaction"), Some(ChannelFamily::Transaction));
        assert_eq!(ChannelFamily::from_name("unknown.X"), None);
    }
}
