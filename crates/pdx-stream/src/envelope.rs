//! JSON-RPC 2.0 envelope codec.
//!
//! Outbound requests are typed ([`RpcRequest`]). Inbound frames are decoded
//! once into the [`Inbound`] tagged union so dispatch can match exhaustively.
//! Acknowledgments are told apart by correlating their `id` with the client's
//! table of pending requests.
//!
//! # Wire shapes
//!
//! ```text
//! -> {"id":1,"jsonrpc":"2.0","method":"auth","params":{"bearer":"<jwt>"}}
//! -> {"id":2,"jsonrpc":"2.0","method":"subscribe","params":{"channel":"trades.BTC-USD-PERP"}}
//! <- {"id":2,"jsonrpc":"2.0","result":{"channel":"trades.BTC-USD-PERP"}}
//! <- {"id":1,"jsonrpc":"2.0","error":{"code":40111,"message":"Invalid Bearer Token"}}
//! <- {"jsonrpc":"2.0","method":"subscription","params":{"channel":"trades.BTC-USD-PERP","data":{..}}}
//! ```

use pdx_core::PdxError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const JSONRPC_VERSION: &str = "2.0";

/// Method name the venue uses for data notifications.
pub const NOTIFICATION_METHOD: &str = "subscription";

pub type RequestId = u64;

/// Outbound RPC methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    Auth,
    Subscribe,
    Unsubscribe,
}

impl RpcMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcMethod::Auth => "auth",
            RpcMethod::Subscribe => "subscribe",
            RpcMethod::Unsubscribe => "unsubscribe",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestParams<'a> {
    Auth { bearer: &'a str },
    Channel { channel: &'a str },
}

/// An outbound request envelope.
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    id: RequestId,
    jsonrpc: &'static str,
    method: &'static str,
    params: RequestParams<'a>,
}

impl<'a> RpcRequest<'a> {
    pub fn auth(id: RequestId, bearer: &'a str) -> Self {
        Self::new(id, RpcMethod::Auth, RequestParams::Auth { bearer })
    }

    pub fn subscribe(id: RequestId, channel: &'a str) -> Self {
        Self::new(id, RpcMethod::Subscribe, RequestParams::Channel { channel })
    }

    pub fn unsubscribe(id: RequestId, channel: &'a str) -> Self {
        Self::new(id, RpcMethod::Unsubscribe, RequestParams::Channel { channel })
    }

    fn new(id: RequestId, method: RpcMethod, params: RequestParams<'a>) -> Self {
        Self { id, jsonrpc: JSONRPC_VERSION, method: method.as_str(), params }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn encode(&self) -> Result<String, PdxError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What an in-flight request was for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRequest {
    Auth,
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    #[serde(default)]
    message: String,
}

/// A data notification for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub channel: String,
    /// The full parsed envelope, as delivered to callbacks.
    pub envelope: Value,
}

static NULL: Value = Value::Null;

impl Notification {
    /// The payload: `params.data`, or a top-level `data` when that is absent.
    pub fn data(&self) -> &Value {
        self.envelope
            .pointer("/params/data")
            .or_else(|| self.envelope.get("data"))
            .unwrap_or(&NULL)
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Success response to our `auth` request.
    AuthAck { id: RequestId },
    /// A subscription was applied.
    SubAck { id: Option<RequestId>, channel: String },
    /// An unsubscription was applied.
    UnsubAck { id: RequestId, channel: String },
    /// Error response; `request` is what the failed request was for, if known.
    ErrorResponse {
        id: Option<RequestId>,
        code: i64,
        message: String,
        request: Option<PendingRequest>,
    },
    /// Data notification.
    Data(Notification),
    /// Success response that could not be correlated with anything.
    Response { id: Option<RequestId>, result: Value },
}

/// Decode one inbound text frame.
///
/// `take_pending` is asked (once) for the request matching the frame's `id`.
pub fn decode<F>(text: &str, take_pending: F) -> Result<Inbound, PdxError>
where
    F: FnOnce(RequestId) -> Option<PendingRequest>,
{
    let envelope: Value = serde_json::from_str(text)?;
    let Some(obj) = envelope.as_object() else {
        return Err(PdxError::Malformed("envelope is not a JSON object".into()));
    };

    let id = obj.get("id").and_then(parse_id);

    if let Some(error) = obj.get("error").filter(|e| !e.is_null()) {
        let body = RpcErrorBody::deserialize(error).map_err(|e| PdxError::Malformed(format!("error body: {e}")))?;
        return Ok(Inbound::ErrorResponse {
            id,
            code: body.code,
            message: body.message,
            request: id.and_then(take_pending),
        });
    }

    if let Some(result) = obj.get("result").filter(|r| !r.is_null()) {
        let result_channel = result.get("channel").and_then(Value::as_str).map(str::to_owned);
        return Ok(match (id, id.and_then(take_pending)) {
            (Some(id), Some(PendingRequest::Auth)) => Inbound::AuthAck { id },
            (Some(id), Some(PendingRequest::Subscribe(channel))) => Inbound::SubAck {
                id: Some(id),
                channel: result_channel.unwrap_or(channel),
            },
            (Some(id), Some(PendingRequest::Unsubscribe(channel))) => Inbound::UnsubAck {
                id,
                channel: result_channel.unwrap_or(channel),
            },
            (id, _) => match result_channel {
                Some(channel) => Inbound::SubAck { id, channel },
                None => Inbound::Response { id, result: result.clone() },
            },
        });
    }

    let channel = obj
        .get("params")
        .and_then(|p| p.get("channel"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    match channel {
        Some(channel) => Ok(Inbound::Data(Notification { channel, envelope })),
        None => Err(PdxError::Malformed("no result, error or params.channel".into())),
    }
}

/// Request ids are numbers, but some servers echo them back as strings.
fn parse_id(v: &Value) -> Option<RequestId> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Frame builders for simulators
// ---------------------------------------------------------------------------

/// A data notification frame.
pub fn data_message(channel: &str, data: Value) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": NOTIFICATION_METHOD,
        "params": {"channel": channel, "data": data},
    })
    .to_string()
}

/// A success response frame.
pub fn success_response(id: RequestId, result: Value) -> String {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": result}).to_string()
}

/// An error response frame.
pub fn error_response(id: Option<RequestId>, code: i64, message: &str) -> String {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "error": {"code": code, "message": message}}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_pending(_: RequestId) -> Option<PendingRequest> {
        None
    }

    #[test]
    fn encodes_requests_in_wire_order() {
        let auth = RpcRequest::auth(1, "jwt").encode().unwrap();
        assert_eq!(auth, r#"{"id":1,"jsonrpc":"2.0","method":"auth","params":{"bearer":"jwt"}}"#);

        let sub = RpcRequest::subscribe(2, "bbo.BTC-USD-PERP").encode().unwrap();
        assert_eq!(sub, r#"{"id":2,"jsonrpc":"2.0","method":"subscribe","params":{"channel":"bbo.BTC-USD-PERP"}}"#);

        let unsub = RpcRequest::unsubscribe(3, "bbo.BTC-USD-PERP").encode().unwrap();
        assert!(unsub.contains(r#""method":"unsubscribe""#));
    }

    #[test]
    fn correlates_acks_with_pending() {
        let text = success_response(5, json!({"node_id": "n1"}));
        assert_eq!(decode(&text, |_| Some(PendingRequest::Auth)).unwrap(), Inbound::AuthAck { id: 5 });

        let text = success_response(6, json!({"channel": "trades.ETH-USD-PERP"}));
        let got = decode(&text, |id| {
            assert_eq!(id, 6);
            Some(PendingRequest::Unsubscribe("trades.ETH-USD-PERP".into()))
        })
        .unwrap();
        assert_eq!(got, Inbound::UnsubAck { id: 6, channel: "trades.ETH-USD-PERP".into() });
    }

    #[test]
    fn uncorrelated_channel_result_is_sub_ack() {
        let text = r#"{"jsonrpc":"2.0","id":"1700000000000001","result":{"channel":"account"}}"#;
        let got = decode(text, no_pending).unwrap();
        assert_eq!(got, Inbound::SubAck { id: Some(1_700_000_000_000_001), channel: "account".into() });

        let text = success_response(9, json!({"ok": true}));
        assert!(matches!(decode(&text, no_pending).unwrap(), Inbound::Response { id: Some(9), .. }));
    }

    #[test]
    fn decodes_error_with_request() {
        let text = error_response(Some(4), 40111, "Invalid Bearer Token");
        let got = decode(&text, |_| Some(PendingRequest::Auth)).unwrap();
        assert_eq!(
            got,
            Inbound::ErrorResponse {
                id: Some(4),
                code: 40111,
                message: "Invalid Bearer Token".into(),
                request: Some(PendingRequest::Auth),
            }
        );

        // Code alone is enough.
        let got = decode(r#"{"error":{"code":40111}}"#, no_pending).unwrap();
        assert!(matches!(got, Inbound::ErrorResponse { id: None, code: 40111, .. }));
    }

    #[test]
    fn decodes_notifications() {
        let text = data_message("trades.BTC-USD-PERP", json!({"price": "50000"}));
        let Inbound::Data(n) = decode(&text, no_pending).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(n.channel, "trades.BTC-USD-PERP");
        assert_eq!(n.data()["price"], "50000");
        assert_eq!(n.envelope["method"], "subscription");

        // Payload beside params rather than inside it.
        let text = r#"{"params":{"channel":"bbo.BTC-USD-PERP"},"data":{"bid":"50000","ask":"50001"}}"#;
        let Inbound::Data(n) = decode(text, no_pending).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(n.data()["ask"], "50001");
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(decode("not json", no_pending), Err(PdxError::Malformed(_))));
        assert!(matches!(decode("[1,2]", no_pending), Err(PdxError::Malformed(_))));
        assert!(matches!(decode(r#"{"jsonrpc":"2.0"}"#, no_pending), Err(PdxError::Malformed(_))));
        assert!(matches!(decode(r#"{"error":{"message":"x"}}"#, no_pending), Err(PdxError::Malformed(_))));
    }
}
