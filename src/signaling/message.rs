//! Signaling messages exchanged through the relay.
//!
//! On the wire every message is a json object
//! `{ "type": ..., "sessionId": ..., "payload": {...}, "seq"?: n, "msgId"?: "..." }`.
//! `msgId` is stamped by the [`SignalingChannel`](super::channel::SignalingChannel) and
//! used to drop echoes and duplicates, it is not part of the message proper.
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use simple_error::bail;
use std::fmt;

use crate::common::box_error::BoxError;

/// An SDP blob produced by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

/// Host's offset estimate piggybacked on a ping so the guest can adopt it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SharedEstimate {
    pub offset_us: i64,
    pub error_us: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    ClockPing {
        seq: u64,
        send_time: u128,
        estimate: Option<SharedEstimate>,
        /// host's latest probe round trip, usec
        rtt_us: Option<f64>,
    },
    ClockPong {
        seq: u64,
        receive_time: u128,
        send_time: u128,
    },
    Bye {
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalingMessage {
    pub session_id: String,
    pub body: MessageBody,
    pub msg_id: Option<String>,
}

impl SignalingMessage {
    pub fn new(session_id: &str, body: MessageBody) -> SignalingMessage {
        SignalingMessage {
            session_id: String::from(session_id),
            body: body,
            msg_id: None,
        }
    }

    /// The wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self.body {
            MessageBody::Offer(_) => "offer",
            MessageBody::Answer(_) => "answer",
            MessageBody::IceCandidate(_) => "candidate",
            MessageBody::ClockPing { .. } => "ping",
            MessageBody::ClockPong { .. } => "pong",
            MessageBody::Bye { .. } => "bye",
        }
    }

    pub fn is_clock(&self) -> bool {
        matches!(
            self.body,
            MessageBody::ClockPing { .. } | MessageBody::ClockPong { .. }
        )
    }

    pub fn as_json(&self) -> Value {
        let (payload, seq): (Value, Option<u64>) = match &self.body {
            MessageBody::Offer(desc) | MessageBody::Answer(desc) => (json!({ "sdp": desc.sdp }), None),
            MessageBody::IceCandidate(cand) => (serde_json::to_value(cand).unwrap_or(Value::Null), None),
            MessageBody::ClockPing {
                seq,
                send_time,
                estimate,
                rtt_us,
            } => {
                let mut payload = json!({ "sendTime": *send_time as u64 });
                if let Some(est) = estimate {
                    payload["offsetUs"] = json!(est.offset_us);
                    payload["errorUs"] = json!(est.error_us);
                }
                if let Some(rtt) = rtt_us {
                    payload["rttUs"] = json!(rtt);
                }
                (payload, Some(*seq))
            }
            MessageBody::ClockPong {
                seq,
                receive_time,
                send_time,
            } => (
                json!({ "receiveTime": *receive_time as u64, "sendTime": *send_time as u64 }),
                Some(*seq),
            ),
            MessageBody::Bye { reason } => match reason {
                Some(r) => (json!({ "reason": r }), None),
                None => (json!({}), None),
            },
        };
        let mut msg = json!({
            "type": self.kind(),
            "sessionId": self.session_id,
            "payload": payload,
        });
        if let Some(s) = seq {
            msg["seq"] = json!(s);
        }
        if let Some(id) = &self.msg_id {
            msg["msgId"] = json!(id);
        }
        msg
    }

    pub fn from_string(data: &str) -> Result<SignalingMessage, BoxError> {
        let raw: Value = serde_json::from_str(data)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &Value) -> Result<SignalingMessage, BoxError> {
        let kind = match raw["type"].as_str() {
            Some(k) => k,
            None => {
                bail!("no type in message")
            }
        };
        let session_id = match raw["sessionId"].as_str() {
            Some(id) if !id.is_empty() => id,
            _ => {
                bail!("no sessionId in message")
            }
        };
        let payload = &raw["payload"];
        let body = match kind {
            "offer" => MessageBody::Offer(serde_json::from_value(payload.clone())?),
            "answer" => MessageBody::Answer(serde_json::from_value(payload.clone())?),
            "candidate" => MessageBody::IceCandidate(serde_json::from_value(payload.clone())?),
            "ping" => {
                let estimate = match (payload["offsetUs"].as_i64(), payload["errorUs"].as_f64()) {
                    (Some(_), Some(error_us)) if !error_us.is_finite() || error_us < 0.0 => {
                        bail!("ping estimate with bad errorUs {}", error_us)
                    }
                    (Some(offset_us), Some(error_us)) => Some(SharedEstimate { offset_us, error_us }),
                    _ => None,
                };
                let rtt_us = match payload["rttUs"].as_f64() {
                    Some(rtt) if !rtt.is_finite() || rtt < 0.0 => {
                        bail!("ping with bad rttUs {}", rtt)
                    }
                    rtt => rtt,
                };
                MessageBody::ClockPing {
                    seq: Self::required_seq(raw)?,
                    send_time: Self::required_time(payload, "sendTime")?,
                    estimate: estimate,
                    rtt_us: rtt_us,
                }
            }
            "pong" => MessageBody::ClockPong {
                seq: Self::required_seq(raw)?,
                receive_time: Self::required_time(payload, "receiveTime")?,
                send_time: Self::required_time(payload, "sendTime")?,
            },
            "bye" => MessageBody::Bye {
                reason: payload["reason"].as_str().map(String::from),
            },
            other => {
                bail!("unknown message type {}", other)
            }
        };
        Ok(SignalingMessage {
            session_id: String::from(session_id),
            body: body,
            msg_id: raw["msgId"].as_str().map(String::from),
        })
    }

    fn required_seq(raw: &Value) -> Result<u64, BoxError> {
        match raw["seq"].as_u64() {
            Some(s) => Ok(s),
            None => {
                bail!("clock message without seq")
            }
        }
    }

    fn required_time(payload: &Value, key: &str) -> Result<u128, BoxError> {
        match payload[key].as_u64() {
            Some(t) => Ok(t as u128),
            None => {
                bail!("clock message without {}", key)
            }
        }
    }
}

impl fmt::Display for SignalingMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_json())
    }
}

#[cfg(test)]
mod test_signaling_message {
    use super::*;

    #[test]
    fn offer_wire_format() {
        let msg = SignalingMessage::new(
            "123456",
            MessageBody::Offer(SessionDescription {
                sdp: String::from("v=0"),
            }),
        );
        let v = msg.as_json();
        assert_eq!(v["type"], "offer");
        assert_eq!(v["sessionId"], "123456");
        assert_eq!(v["payload"]["sdp"], "v=0");
        assert!(v["seq"].is_null());
        assert!(v["msgId"].is_null());
    }

    #[test]
    fn ping_with_estimate_parses() {
        let data = r#"{"type":"ping","sessionId":"s1","seq":4,"payload":{"sendTime":1000,"offsetUs":-250,"errorUs":1200.5},"msgId":"ab-1"}"#;
        let msg = SignalingMessage::from_string(data).unwrap();
        assert_eq!(msg.msg_id.as_deref(), Some("ab-1"));
        match msg.body {
            MessageBody::ClockPing {
                seq,
                send_time,
                estimate,
                rtt_us,
            } => {
                assert_eq!(seq, 4);
                assert_eq!(send_time, 1000);
                assert_eq!(rtt_us, None);
                assert_eq!(
                    estimate,
                    Some(SharedEstimate {
                        offset_us: -250,
                        error_us: 1200.5
                    })
                );
            }
            _ => panic!("expected a ping"),
        }
    }

    #[test]
    fn ping_carries_round_trip() {
        let msg = SignalingMessage::new(
            "s1",
            MessageBody::ClockPing {
                seq: 7,
                send_time: 5000,
                estimate: None,
                rtt_us: Some(12_000.0),
            },
        );
        let v = msg.as_json();
        assert_eq!(v["payload"]["rttUs"], 12_000.0);
        assert!(v["payload"]["offsetUs"].is_null());
        assert_eq!(SignalingMessage::from_json(&v).unwrap(), msg);
    }

    #[test]
    fn ping_with_bad_error_bound_is_dropped() {
        let negative = r#"{"type":"ping","sessionId":"s1","seq":4,"payload":{"sendTime":1000,"offsetUs":-250,"errorUs":-1.0}}"#;
        assert!(SignalingMessage::from_string(negative).is_err());
        let bad_rtt = r#"{"type":"ping","sessionId":"s1","seq":4,"payload":{"sendTime":1000,"rttUs":-5}}"#;
        assert!(SignalingMessage::from_string(bad_rtt).is_err());
        let zero = r#"{"type":"ping","sessionId":"s1","seq":4,"payload":{"sendTime":1000,"offsetUs":3,"errorUs":0}}"#;
        assert!(SignalingMessage::from_string(zero).is_ok());
    }

    #[test]
    fn candidate_keeps_optional_fields() {
        let msg = SignalingMessage::new(
            "s1",
            MessageBody::IceCandidate(IceCandidate {
                candidate: String::from("candidate:1 1 udp 1 10.0.0.1 5000 typ host"),
                sdp_mid: Some(String::from("audio")),
                sdp_mline_index: None,
            }),
        );
        let back = SignalingMessage::from_json(&msg.as_json()).unwrap();
        assert_eq!(back, msg);
        assert!(msg.as_json()["payload"]["sdpMLineIndex"].is_null());
    }

    #[test]
    fn bye_without_payload() {
        let msg = SignalingMessage::from_string(r#"{"type":"bye","sessionId":"s1"}"#).unwrap();
        assert_eq!(msg.body, MessageBody::Bye { reason: None });
    }

    #[test]
    fn malformed_messages() {
        assert!(SignalingMessage::from_string("not json").is_err());
        assert!(SignalingMessage::from_string(r#"{"sessionId":"s1"}"#).is_err());
        assert!(SignalingMessage::from_string(r#"{"type":"offer"}"#).is_err());
        assert!(SignalingMessage::from_string(r#"{"type":"offer","sessionId":"s1","payload":{}}"#).is_err());
        assert!(SignalingMessage::from_string(r#"{"type":"pong","sessionId":"s1","payload":{"receiveTime":1,"sendTime":2}}"#).is_err());
        assert!(SignalingMessage::from_string(r#"{"type":"dance","sessionId":"s1","payload":{}}"#).is_err());
    }
}
