//! Canonical instrument identifiers.
//!
//! Every tradable thing in the gateway is addressed by one string grammar:
//!
//! `[<asset-class>:]<venue>:<type>:<payload>[@<chain-or-settlement>]`
//!
//! Parsing is total: any string that does not match the grammar is rejected
//! with a structural [`InstrumentError`], and `render(parse(s)) == s` holds
//! for every accepted `s`. The venue segment is advisory for routing
//! instruments (`SPOT_PAIR`) and an identity component for everything else.

pub mod registry;

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub use registry::{InstrumentMetadata, InstrumentRegistry, StaticInstrumentRegistry};

/// Structural parse failure. The variant names the first segment that broke.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstrumentError {
    #[error("empty canonical id")]
    Empty,
    #[error("no instrument type segment in '{0}'")]
    MissingKind(String),
    #[error("unknown asset class '{0}'")]
    UnknownAssetClass(String),
    #[error("instrument type '{kind}' requires a venue segment")]
    MissingVenue { kind: &'static str },
    #[error("invalid venue segment '{0}'")]
    InvalidVenue(String),
    #[error("expected exactly one payload segment, got {0}")]
    PayloadSegments(usize),
    #[error("invalid {kind} payload '{payload}'")]
    InvalidPayload { kind: &'static str, payload: String },
    #[error("invalid settlement suffix '{0}'")]
    InvalidSettlement(String),
    #[error("bet position key requires a selection")]
    MissingSelection,
    #[error("unknown instrument '{0}'")]
    Unknown(String),
}

/// Optional leading segment. Recognised tokens only; anything else in the
/// asset-class position is a parse error rather than a silent venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetClass {
    Crypto,
    Defi,
    Equity,
    Sports,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crypto => "CRYPTO",
            Self::Defi => "DEFI",
            Self::Equity => "EQUITY",
            Self::Sports => "SPORTS",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "CRYPTO" => Some(Self::Crypto),
            "DEFI" => Some(Self::Defi),
            "EQUITY" => Some(Self::Equity),
            "SPORTS" => Some(Self::Sports),
            _ => None,
        }
    }
}

/// Instrument type segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentKind {
    SpotPair,
    SpotAsset,
    Perpetual,
    Future,
    Option,
    Pool,
    Lst,
    AToken,
    DebtToken,
    Equity,
    Index,
    MatchWinner,
    TotalGoalsOu25,
    Btts,
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpotPair => "SPOT_PAIR",
            Self::SpotAsset => "SPOT_ASSET",
            Self::Perpetual => "PERPETUAL",
            Self::Future => "FUTURE",
            Self::Option => "OPTION",
            Self::Pool => "POOL",
            Self::Lst => "LST",
            Self::AToken => "A_TOKEN",
            Self::DebtToken => "DEBT_TOKEN",
            Self::Equity => "EQUITY",
            Self::Index => "INDEX",
            Self::MatchWinner => "MATCH_WINNER",
            Self::TotalGoalsOu25 => "TOTAL_GOALS_OU_2_5",
            Self::Btts => "BTTS",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "SPOT_PAIR" => Some(Self::SpotPair),
            "SPOT_ASSET" => Some(Self::SpotAsset),
            "PERPETUAL" => Some(Self::Perpetual),
            "FUTURE" => Some(Self::Future),
            "OPTION" => Some(Self::Option),
            "POOL" => Some(Self::Pool),
            "LST" => Some(Self::Lst),
            "A_TOKEN" => Some(Self::AToken),
            "DEBT_TOKEN" => Some(Self::DebtToken),
            "EQUITY" => Some(Self::Equity),
            "INDEX" => Some(Self::Index),
            "MATCH_WINNER" => Some(Self::MatchWinner),
            "TOTAL_GOALS_OU_2_5" => Some(Self::TotalGoalsOu25),
            "BTTS" => Some(Self::Btts),
            _ => None,
        }
    }

    /// Routing instruments may be re-venued by the smart router. Everything
    /// else carries its venue as identity.
    pub fn is_routable(&self) -> bool {
        matches!(self, Self::SpotPair)
    }

    /// Betting markets settle per selection, not per instrument.
    pub fn is_betting(&self) -> bool {
        matches!(self, Self::MatchWinner | Self::TotalGoalsOu25 | Self::Btts)
    }
}

/// A parsed canonical instrument identifier.
///
/// Segments are stored as validated raw strings so that rendering
/// reconstructs the input byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalId {
    asset_class: Option<AssetClass>,
    venue: Option<String>,
    kind: InstrumentKind,
    payload: String,
    settlement: Option<String>,
}

fn is_token(s: &str, allow_lower: bool) -> bool {
    !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_uppercase()
                || c.is_ascii_digit()
                || c == '_'
                || c == '.'
                || c == '-'
                || (allow_lower && c.is_ascii_lowercase())
        })
}

fn is_symbol(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

fn is_yymmdd(s: &str) -> bool {
    if s.len() != 6 || !s.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let mm: u32 = s[2..4].parse().unwrap_or(0);
    let dd: u32 = s[4..6].parse().unwrap_or(0);
    (1..=12).contains(&mm) && (1..=31).contains(&dd)
}

fn is_decimal_literal(s: &str) -> bool {
    let mut parts = s.splitn(2, '.');
    let int = parts.next().unwrap_or("");
    let frac = parts.next();
    !int.is_empty()
        && int.chars().all(|c| c.is_ascii_digit())
        && frac.map_or(true, |f| !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()))
}

impl CanonicalId {
    pub fn parse(input: &str) -> Result<Self, InstrumentError> {
        if input.is_empty() {
            return Err(InstrumentError::Empty);
        }

        // Settlement suffix is always at the tail of the payload segment.
        let (head, settlement) = match input.rsplit_once('@') {
            Some((head, tail)) => {
                if !is_token(tail, false) {
                    return Err(InstrumentError::InvalidSettlement(tail.to_string()));
                }
                (head, Some(tail.to_string()))
            }
            None => (input, None),
        };

        let segments: Vec<&str> = head.split(':').collect();
        let kind_pos = segments
            .iter()
            .position(|s| InstrumentKind::parse(s).is_some())
            .ok_or_else(|| InstrumentError::MissingKind(input.to_string()))?;
        let kind = InstrumentKind::parse(segments[kind_pos]).expect("position() checked");

        let (asset_class, venue) = match kind_pos {
            0 => (None, None),
            1 => (None, Some(segments[0])),
            2 => {
                let class = AssetClass::parse(segments[0])
                    .ok_or_else(|| InstrumentError::UnknownAssetClass(segments[0].to_string()))?;
                (Some(class), Some(segments[1]))
            }
            _ => return Err(InstrumentError::MissingKind(input.to_string())),
        };

        if venue.is_none() && !kind.is_routable() {
            return Err(InstrumentError::MissingVenue { kind: kind.as_str() });
        }
        if let Some(v) = venue {
            if !is_token(v, false) {
                return Err(InstrumentError::InvalidVenue(v.to_string()));
            }
        }

        let payload_segments = &segments[kind_pos + 1..];
        if payload_segments.len() != 1 {
            return Err(InstrumentError::PayloadSegments(payload_segments.len()));
        }
        let payload = payload_segments[0];
        Self::validate_payload(kind, payload)?;

        Ok(Self {
            asset_class,
            venue: venue.map(str::to_string),
            kind,
            payload: payload.to_string(),
            settlement,
        })
    }

    fn validate_payload(kind: InstrumentKind, payload: &str) -> Result<(), InstrumentError> {
        let parts: Vec<&str> = payload.split('-').collect();
        let ok = match kind {
            InstrumentKind::SpotPair | InstrumentKind::Perpetual => {
                parts.len() == 2 && parts.iter().all(|p| is_symbol(p))
            }
            InstrumentKind::SpotAsset
            | InstrumentKind::Lst
            | InstrumentKind::AToken
            | InstrumentKind::DebtToken
            | InstrumentKind::Equity
            | InstrumentKind::Index => parts.len() == 1 && is_symbol(parts[0]),
            InstrumentKind::Future => {
                parts.len() == 3
                    && is_symbol(parts[0])
                    && is_symbol(parts[1])
                    && is_yymmdd(parts[2])
            }
            InstrumentKind::Option => {
                parts.len() == 5
                    && is_symbol(parts[0])
                    && is_symbol(parts[1])
                    && is_yymmdd(parts[2])
                    && is_decimal_literal(parts[3])
                    && matches!(parts[4], "CALL" | "PUT")
            }
            InstrumentKind::Pool => !parts.is_empty() && parts.iter().all(|p| is_symbol(p)),
            InstrumentKind::MatchWinner | InstrumentKind::TotalGoalsOu25 | InstrumentKind::Btts => {
                is_token(payload, true)
            }
        };
        if ok {
            Ok(())
        } else {
            Err(InstrumentError::InvalidPayload {
                kind: kind.as_str(),
                payload: payload.to_string(),
            })
        }
    }

    /// Reconstruct the exact input string.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(48);
        if let Some(class) = self.asset_class {
            out.push_str(class.as_str());
            out.push(':');
        }
        if let Some(venue) = &self.venue {
            out.push_str(venue);
            out.push(':');
        }
        out.push_str(self.kind.as_str());
        out.push(':');
        out.push_str(&self.payload);
        if let Some(settlement) = &self.settlement {
            out.push('@');
            out.push_str(settlement);
        }
        out
    }

    pub fn asset_class(&self) -> Option<AssetClass> {
        self.asset_class
    }

    pub fn venue(&self) -> Option<&str> {
        self.venue.as_deref()
    }

    pub fn kind(&self) -> InstrumentKind {
        self.kind
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn settlement(&self) -> Option<&str> {
        self.settlement.as_deref()
    }

    pub fn is_routable(&self) -> bool {
        self.kind.is_routable()
    }

    /// First dash-separated payload token. For pairs and derivatives this is
    /// the base symbol; for single-token payloads it is the payload itself.
    pub fn base(&self) -> &str {
        self.payload.split('-').next().unwrap_or(&self.payload)
    }

    /// Second payload token, where the schema has one.
    pub fn quote(&self) -> Option<&str> {
        let mut parts = self.payload.split('-');
        parts.next()?;
        parts.next()
    }

    /// The canonical key under which a holding from trading this instrument
    /// accrues.
    ///
    /// - `SPOT_PAIR` trades accrue into the base asset on the resolved
    ///   venue: `V:SPOT_ASSET:BTC`.
    /// - Venue-bound instruments accrue under their own identity.
    /// - Bets accrue per selection: `<id>:<selection>`.
    pub fn position_key(
        &self,
        resolved_venue: &str,
        selection: Option<&str>,
    ) -> Result<String, InstrumentError> {
        if self.kind.is_betting() {
            let selection = selection.ok_or(InstrumentError::MissingSelection)?;
            return Ok(format!("{}:{}", self.render(), selection));
        }
        if self.kind == InstrumentKind::SpotPair {
            return Ok(format!("{}:SPOT_ASSET:{}", resolved_venue, self.base()));
        }
        Ok(self.render())
    }

    /// Base asset for position records (what `aggregate(base_asset)` groups by).
    pub fn base_asset(&self) -> String {
        self.base().to_string()
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for CanonicalId {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for CanonicalId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.render())
    }
}

impl<'de> Deserialize<'de> for CanonicalId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let inputs = [
            "BINANCE-SPOT:SPOT_PAIR:BTC-USDT",
            "SPOT_PAIR:ETH-USDC",
            "CRYPTO:BINANCE-SPOT:SPOT_PAIR:BTC-USDT",
            "DERIBIT:PERPETUAL:BTC-USD@INV",
            "DERIBIT:OPTION:BTC-USD-251226-90000-CALL",
            "DERIBIT:FUTURE:BTC-USD-250926",
            "AAVE-V3:A_TOKEN:AUSDC@ARBITRUM",
            "AAVE-V3:DEBT_TOKEN:DWETH@ARBITRUM",
            "LIDO:LST:STETH@ETHEREUM",
            "UNISWAP-V3:POOL:WETH-USDC-3000@ETHEREUM",
            "IBKR:EQUITY:AAPL",
            "IBKR:INDEX:SPX",
            "BETFAIR:MATCH_WINNER:epl-2026-ars-che",
            "BETFAIR:TOTAL_GOALS_OU_2_5:epl-2026-ars-che",
            "BETFAIR:BTTS:epl-2026-liv-mun",
            "KRAKEN:SPOT_ASSET:BTC",
        ];
        for input in inputs {
            let parsed = CanonicalId::parse(input).unwrap_or_else(|e| {
                panic!("'{input}' should parse: {e}");
            });
            assert_eq!(parsed.render(), input, "round trip for '{input}'");
        }
    }

    #[test]
    fn test_rejects_malformed() {
        let bad = [
            "",
            "BTC-USDT",
            "BINANCE-SPOT:BTC-USDT",
            "BINANCE-SPOT:SPOT_PAIR:",
            "BINANCE-SPOT:SPOT_PAIR:BTCUSDT",
            "BINANCE-SPOT:SPOT_PAIR:BTC-USDT:EXTRA",
            "PERPETUAL:BTC-USD",
            "DERIBIT:OPTION:BTC-USD-991340-90000-CALL",
            "DERIBIT:OPTION:BTC-USD-251226-90000-STRADDLE",
            "DERIBIT:PERPETUAL:BTC-USD@",
            "WHAT:BINANCE-SPOT:SPOT_PAIR:BTC-USDT",
            "MYSTERY:BTC",
        ];
        for input in bad {
            assert!(
                CanonicalId::parse(input).is_err(),
                "'{input}' should be rejected"
            );
        }
    }

    #[test]
    fn test_single_prefix_segment_is_always_the_venue() {
        // With exactly one segment before the type, that segment is the
        // venue, never a bare asset class. An asset class can only appear
        // together with a venue.
        let id = CanonicalId::parse("CRYPTO:SPOT_PAIR:BTC-USDT").unwrap();
        assert_eq!(id.venue(), Some("CRYPTO"));
        assert_eq!(id.asset_class(), None);
        assert_eq!(id.render(), "CRYPTO:SPOT_PAIR:BTC-USDT");

        // Even a venue that happens to spell an asset-class token stays a
        // venue in this position.
        let id = CanonicalId::parse("EQUITY:EQUITY:AAPL").unwrap();
        assert_eq!(id.venue(), Some("EQUITY"));
        assert_eq!(id.asset_class(), None);
        assert_eq!(id.kind(), InstrumentKind::Equity);
        assert_eq!(id.render(), "EQUITY:EQUITY:AAPL");

        // Both-prefix form still resolves class then venue.
        let id = CanonicalId::parse("CRYPTO:BINANCE-SPOT:SPOT_PAIR:BTC-USDT").unwrap();
        assert_eq!(id.asset_class(), Some(AssetClass::Crypto));
        assert_eq!(id.venue(), Some("BINANCE-SPOT"));
    }

    #[test]
    fn test_venue_optional_only_for_spot_pair() {
        assert!(CanonicalId::parse("SPOT_PAIR:BTC-USDT").is_ok());
        let err = CanonicalId::parse("SPOT_ASSET:BTC").unwrap_err();
        assert!(matches!(err, InstrumentError::MissingVenue { .. }));
    }

    #[test]
    fn test_position_keys() {
        let pair = CanonicalId::parse("BINANCE-SPOT:SPOT_PAIR:BTC-USDT").unwrap();
        assert_eq!(
            pair.position_key("BINANCE-SPOT", None).unwrap(),
            "BINANCE-SPOT:SPOT_ASSET:BTC"
        );

        let perp = CanonicalId::parse("DERIBIT:PERPETUAL:BTC-USD@INV").unwrap();
        assert_eq!(
            perp.position_key("DERIBIT", None).unwrap(),
            "DERIBIT:PERPETUAL:BTC-USD@INV"
        );

        let bet = CanonicalId::parse("BETFAIR:MATCH_WINNER:epl-2026-ars-che").unwrap();
        assert_eq!(
            bet.position_key("BETFAIR", Some("HOME")).unwrap(),
            "BETFAIR:MATCH_WINNER:epl-2026-ars-che:HOME"
        );
        assert!(matches!(
            bet.position_key("BETFAIR", None),
            Err(InstrumentError::MissingSelection)
        ));
    }

    #[test]
    fn test_accessors() {
        let opt = CanonicalId::parse("DERIBIT:OPTION:BTC-USD-251226-90000-CALL").unwrap();
        assert_eq!(opt.base(), "BTC");
        assert_eq!(opt.quote(), Some("USD"));
        assert_eq!(opt.venue(), Some("DERIBIT"));
        assert!(!opt.is_routable());

        let pair = CanonicalId::parse("SPOT_PAIR:SOL-USDT").unwrap();
        assert!(pair.is_routable());
        assert_eq!(pair.venue(), None);
        assert_eq!(pair.base_asset(), "SOL");
    }
}
