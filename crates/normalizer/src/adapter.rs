//! Upstream feed frame adapter.
//!
//! The upstream market-data WebSocket speaks a compact JSON protocol: every
//! payload is an array of frames, each discriminated by a `"T"` field
//! (`t` trade, `b` bar, `success`/`subscription`/`error` control). This
//! module parses those frames into normalized [`MarketMessage`]s and builds
//! the outbound auth/subscribe payloads.

use crate::error::{NormalizerError, Result};
use crate::schema::{BarMessage, TradeMessage, DEFAULT_TIMEFRAME};
use chrono::DateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One parsed upstream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFrame {
    Trade(TradeMessage),
    Bar(BarMessage),
    Control(ControlFrame),
    /// Unrecognized frame kind; callers log and drop these.
    Unknown(String),
}

/// Control frames are acknowledged and otherwise ignored, except for
/// authentication outcomes which drive the connect handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    /// `{"T":"success","msg":"authenticated"}`
    Authenticated,
    /// Any other success message (e.g. "connected").
    Success(String),
    /// Subscription confirmation.
    Subscription,
    /// Error frame; auth-related codes are fatal for the connection.
    Error { code: i64, msg: String },
}

impl ControlFrame {
    /// Upstream auth error codes (401 unauthorized, 402 auth failed,
    /// 404 auth timeout) mean the credentials are bad; retrying is useless.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ControlFrame::Error { code, .. } if matches!(code, 401 | 402 | 404))
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "T")]
    kind: String,
    #[serde(rename = "S")]
    symbol: Option<String>,
    #[serde(rename = "p")]
    price: Option<Decimal>,
    #[serde(rename = "s")]
    size: Option<Decimal>,
    #[serde(rename = "t")]
    timestamp: Option<String>,
    #[serde(rename = "o")]
    open: Option<Decimal>,
    #[serde(rename = "h")]
    high: Option<Decimal>,
    #[serde(rename = "l")]
    low: Option<Decimal>,
    #[serde(rename = "c")]
    close: Option<Decimal>,
    #[serde(rename = "v")]
    volume: Option<Decimal>,
    #[serde(rename = "n")]
    trade_count: Option<i64>,
    #[serde(rename = "vw")]
    vwap: Option<Decimal>,
    msg: Option<String>,
    code: Option<i64>,
}

/// Parse a raw upstream payload into frames.
///
/// Payloads are arrays of frames; a bare object is tolerated as a
/// single-frame array.
pub fn parse_frames(raw: &str) -> Result<Vec<UpstreamFrame>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let raw_frames: Vec<RawFrame> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        serde_json::Value::Object(_) => vec![serde_json::from_value(value)?],
        _ => return Err(NormalizerError::MalformedFrame("not an object or array".into())),
    };

    raw_frames.into_iter().map(convert_frame).collect()
}

fn convert_frame(raw: RawFrame) -> Result<UpstreamFrame> {
    match raw.kind.as_str() {
        "t" => Ok(UpstreamFrame::Trade(TradeMessage {
            symbol: required(raw.symbol, "S")?.to_uppercase(),
            price: required(raw.price, "p")?,
            size: required(raw.size, "s")?,
            timestamp: parse_timestamp(&required(raw.timestamp, "t")?)?,
        })),
        "b" => Ok(UpstreamFrame::Bar(BarMessage {
            symbol: required(raw.symbol, "S")?.to_uppercase(),
            timeframe: DEFAULT_TIMEFRAME.to_string(),
            timestamp: parse_timestamp(&required(raw.timestamp, "t")?)?,
            open: required(raw.open, "o")?,
            high: required(raw.high, "h")?,
            low: required(raw.low, "l")?,
            close: required(raw.close, "c")?,
            volume: required(raw.volume, "v")?,
            trade_count: raw.trade_count.unwrap_or(0),
            vwap: raw.vwap,
        })),
        "success" => {
            let msg = raw.msg.unwrap_or_default();
            if msg == "authenticated" {
                Ok(UpstreamFrame::Control(ControlFrame::Authenticated))
            } else {
                Ok(UpstreamFrame::Control(ControlFrame::Success(msg)))
            }
        }
        "subscription" => Ok(UpstreamFrame::Control(ControlFrame::Subscription)),
        "error" => Ok(UpstreamFrame::Control(ControlFrame::Error {
            code: raw.code.unwrap_or(0),
            msg: raw.msg.unwrap_or_default(),
        })),
        other => Ok(UpstreamFrame::Unknown(other.to_string())),
    }
}

fn required<T>(field: Option<T>, name: &'static str) -> Result<T> {
    field.ok_or(NormalizerError::MissingField(name))
}

/// Convert an upstream ISO-8601 timestamp to epoch milliseconds.
pub fn parse_timestamp(iso: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(iso)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| NormalizerError::BadTimestamp(format!("{iso}: {e}")))
}

#[derive(Debug, Serialize)]
struct AuthMessage<'a> {
    action: &'static str,
    key: &'a str,
    secret: &'a str,
}

/// Build the authentication payload sent on connect.
pub fn build_auth_message(key: &str, secret: &str) -> String {
    serde_json::to_string(&AuthMessage {
        action: "auth",
        key,
        secret,
    })
    .expect("auth message serializes")
}

#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    action: &'static str,
    trades: &'a [String],
    bars: &'a [String],
}

/// Build the subscription payload for the configured symbol set.
pub fn build_subscribe_message(symbols: &[String]) -> String {
    serde_json::to_string(&SubscribeMessage {
        action: "subscribe",
        trades: symbols,
        bars: symbols,
    })
    .expect("subscribe message serializes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_trade_frame() {
        let raw = r#"[{"T":"t","S":"aapl","p":150.25,"s":100,"t":"2025-01-15T10:30:00Z"}]"#;
        let frames = parse_frames(raw).unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            UpstreamFrame::Trade(t) => {
                assert_eq!(t.symbol, "AAPL");
                assert_eq!(t.price, dec!(150.25));
                assert_eq!(t.size, dec!(100));
                assert_eq!(t.timestamp, 1736937000000);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn parses_bar_frame() {
        let raw = r#"[{"T":"b","S":"MSFT","o":10,"h":12,"l":9,"c":11,"v":500,
            "t":"2025-01-15T10:31:00Z","n":37,"vw":10.42}]"#;
        let frames = parse_frames(raw).unwrap();
        match &frames[0] {
            UpstreamFrame::Bar(b) => {
                assert_eq!(b.symbol, "MSFT");
                assert_eq!(b.timeframe, "1m");
                assert_eq!(b.trade_count, 37);
                assert_eq!(b.vwap, Some(dec!(10.42)));
                assert_eq!(b.timestamp, 1736937060000);
            }
            other => panic!("expected bar, got {other:?}"),
        }
    }

    #[test]
    fn bare_object_is_single_frame() {
        let raw = r#"{"T":"success","msg":"connected"}"#;
        let frames = parse_frames(raw).unwrap();
        assert_eq!(
            frames,
            vec![UpstreamFrame::Control(ControlFrame::Success(
                "connected".to_string()
            ))]
        );
    }

    #[test]
    fn detects_authenticated_control() {
        let raw = r#"[{"T":"success","msg":"authenticated"}]"#;
        let frames = parse_frames(raw).unwrap();
        assert_eq!(frames, vec![UpstreamFrame::Control(ControlFrame::Authenticated)]);
    }

    #[test]
    fn auth_error_codes_are_fatal() {
        let raw = r#"[{"T":"error","code":402,"msg":"auth failed"}]"#;
        let frames = parse_frames(raw).unwrap();
        match &frames[0] {
            UpstreamFrame::Control(c) => assert!(c.is_auth_failure()),
            other => panic!("expected control, got {other:?}"),
        }

        let raw = r#"[{"T":"error","code":429,"msg":"rate limited"}]"#;
        let frames = parse_frames(raw).unwrap();
        match &frames[0] {
            UpstreamFrame::Control(c) => assert!(!c.is_auth_failure()),
            other => panic!("expected control, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_preserved_for_logging() {
        let raw = r#"[{"T":"q","S":"AAPL"}]"#;
        let frames = parse_frames(raw).unwrap();
        assert_eq!(frames, vec![UpstreamFrame::Unknown("q".to_string())]);
    }

    #[test]
    fn timestamp_conversion_matches_contract() {
        assert_eq!(parse_timestamp("2025-01-15T10:30:00Z").unwrap(), 1736937000000);
        assert_eq!(
            parse_timestamp("2025-01-15T10:30:00.123Z").unwrap(),
            1736937000123
        );
        assert!(parse_timestamp("not-a-time").is_err());
    }

    #[test]
    fn subscribe_message_covers_trades_and_bars() {
        let symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
        let msg = build_subscribe_message(&symbols);
        let value: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(value["action"], "subscribe");
        assert_eq!(value["trades"][0], "AAPL");
        assert_eq!(value["bars"][1], "MSFT");
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(parse_frames("not json").is_err());
        assert!(parse_frames("42").is_err());
    }
}
