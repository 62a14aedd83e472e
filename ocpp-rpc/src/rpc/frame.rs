//! Wire frames exchanged between neighbouring nodes
//!
//! A frame is either a bare OCPP array (plain OCPP between direct
//! neighbours) or a routed object carrying the networking-node headers:
//!
//! ```text
//! {"sourceRouting": "CS001" | ["A","B","C"], "networkPath": ["A","B"], "message": [2, ...]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::messages::{EnvelopeError, OcppMessage};
use super::types::{NetworkPath, RequestId, SourceRouting};

/// Networking-node headers of a routed frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingHeader {
    pub source_routing: SourceRouting,
    pub network_path: NetworkPath,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRoutedFrame {
    source_routing: SourceRouting,
    network_path: NetworkPath,
    message: Value,
}

/// A message plus its optional routing header
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Option<RoutingHeader>,
    pub message: OcppMessage,
}

impl Frame {
    pub fn bare(message: impl Into<OcppMessage>) -> Self {
        Self {
            header: None,
            message: message.into(),
        }
    }

    pub fn routed(
        message: impl Into<OcppMessage>,
        source_routing: SourceRouting,
        network_path: NetworkPath,
    ) -> Self {
        Self {
            header: Some(RoutingHeader {
                source_routing,
                network_path,
            }),
            message: message.into(),
        }
    }

    pub fn is_routed(&self) -> bool {
        self.header.is_some()
    }

    pub fn to_value(&self) -> Value {
        match &self.header {
            None => self.message.to_value(),
            Some(header) => json!({
                "sourceRouting": header.source_routing,
                "networkPath": header.network_path,
                "message": self.message.to_value(),
            }),
        }
    }

    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }

    /// Parse either wire form
    pub fn parse(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::Array(_) => Ok(Frame::bare(OcppMessage::from_value(value)?)),
            Value::Object(_) => {
                let wire: WireRoutedFrame = serde_json::from_value(value)
                    .map_err(|e| EnvelopeError::InvalidRoutingHeader(e.to_string()))?;
                let message = OcppMessage::from_value(wire.message)?;

                Ok(Frame::routed(message, wire.source_routing, wire.network_path))
            }
            _ => Err(EnvelopeError::NotAnArray),
        }
    }

    /// Salvage the id and header of a CALL whose frame failed to decode
    pub fn recover_call(bytes: &[u8]) -> Option<(RequestId, Option<RoutingHeader>)> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        match &value {
            Value::Array(_) => OcppMessage::recover_call_id(&value).map(|id| (id, None)),
            Value::Object(map) => {
                let id = OcppMessage::recover_call_id(map.get("message")?)?;
                let header = RoutingHeader {
                    source_routing: serde_json::from_value(map.get("sourceRouting")?.clone()).ok()?,
                    network_path: serde_json::from_value(map.get("networkPath")?.clone()).ok()?,
                };
                Some((id, Some(header)))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::messages::Call;

    fn heartbeat(id: &str) -> Call {
        Call::new(RequestId::new(id), "Heartbeat", json!({})).unwrap()
    }

    #[test]
    fn test_bare_frame_is_plain_ocpp() {
        let frame = Frame::bare(heartbeat("m1"));
        assert_eq!(frame.to_text(), r#"[2,"m1","Heartbeat",{}]"#);

        let parsed = Frame::parse(frame.to_text().as_bytes()).unwrap();
        assert!(!parsed.is_routed());
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_routed_frame_round_trip() {
        let routing = SourceRouting::path(["A", "B", "C"]).unwrap();
        let path: NetworkPath = ["A", "B"].into_iter().collect();
        let frame = Frame::routed(heartbeat("m2"), routing.clone(), path.clone());

        let text = frame.to_text();
        assert!(text.contains(r#""sourceRouting":["A","B","C"]"#));
        assert!(text.contains(r#""networkPath":["A","B"]"#));

        let parsed = Frame::parse(text.as_bytes()).unwrap();
        let header = parsed.header.clone().unwrap();
        assert_eq!(header.source_routing, routing);
        assert_eq!(header.network_path, path);
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_routed_frame_rejects_looping_source_route() {
        let text = r#"{"sourceRouting":["A","B","A"],"networkPath":[],"message":[2,"m3","Heartbeat",{}]}"#;
        assert!(matches!(
            Frame::parse(text.as_bytes()),
            Err(EnvelopeError::InvalidRoutingHeader(_))
        ));
    }

    #[test]
    fn test_recover_call_from_broken_routed_frame() {
        let text = r#"{"sourceRouting":"C","networkPath":["A"],"message":[2,"m4","Heartbeat"]}"#;
        assert!(Frame::parse(text.as_bytes()).is_err());

        let (id, header) = Frame::recover_call(text.as_bytes()).unwrap();
        assert_eq!(id.as_str(), "m4");
        assert_eq!(header.unwrap().source_routing, SourceRouting::direct("C"));
    }
}
