//! Vehicle wire messages.
//!
//! Hand-written prost structs for the two protobuf surfaces the node speaks:
//! the push-telemetry stream (hello handshake + payload frames) and the
//! signed-command envelope relayed through the fleet REST service.
//!
//! Field numbers are wire contract; do not renumber.

use serde::{Deserialize, Serialize};

// ── Command routing domains ───────────────────────────────────────────────────

/// Command-routing namespace on the vehicle. Signed commands carry the
/// numeric value in their TLV metadata and envelope destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    VehicleSecurity,
    Infotainment,
}

impl Domain {
    pub fn wire_value(&self) -> u32 {
        match self {
            Domain::VehicleSecurity => 2,
            Domain::Infotainment => 3,
        }
    }

    /// Authentication tags are truncated to 17 bytes on the security domain
    /// and kept at the full 32 on infotainment.
    pub fn tag_len(&self) -> usize {
        match self {
            Domain::VehicleSecurity => 17,
            Domain::Infotainment => 32,
        }
    }
}

// ── Push-telemetry handshake ──────────────────────────────────────────────────

/// Server → vehicle, immediately after the WebSocket upgrade.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HelloChallenge {
    #[prost(bytes = "vec", tag = "1")]
    pub nonce: Vec<u8>,
}

/// Vehicle → server, first inbound message. `signature` is a 64-byte
/// Schnorr signature over the challenge nonce under the vehicle's
/// registered telemetry key.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub vin: String,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

// ── Push-telemetry frames ─────────────────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LocationValue {
    #[prost(double, tag = "1")]
    pub lat: f64,
    #[prost(double, tag = "2")]
    pub lon: f64,
    #[prost(double, optional, tag = "3")]
    pub heading: Option<f64>,
    #[prost(double, optional, tag = "4")]
    pub speed: Option<f64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TelemetryValue {
    #[prost(oneof = "telemetry_value::Value", tags = "1, 2, 3, 4, 5")]
    pub value: Option<telemetry_value::Value>,
}

pub mod telemetry_value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(double, tag = "1")]
        Double(f64),
        #[prost(int64, tag = "2")]
        Int(i64),
        #[prost(bool, tag = "3")]
        Flag(bool),
        #[prost(string, tag = "4")]
        Text(String),
        #[prost(message, tag = "5")]
        Loc(super::LocationValue),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TelemetryDatum {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(message, optional, tag = "2")]
    pub value: Option<TelemetryValue>,
}

/// One push-stream message: a batch of field updates captured together.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TelemetryPayload {
    #[prost(message, repeated, tag = "1")]
    pub data: Vec<TelemetryDatum>,
    #[prost(message, optional, tag = "2")]
    pub created_at: Option<::prost_types::Timestamp>,
    #[prost(string, tag = "3")]
    pub vin: String,
}

// ── Signed-command envelope ───────────────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvelopeDestination {
    #[prost(oneof = "envelope_destination::Recipient", tags = "1, 2")]
    pub recipient: Option<envelope_destination::Recipient>,
}

pub mod envelope_destination {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Recipient {
        /// Numeric command-routing domain on the vehicle.
        #[prost(uint32, tag = "1")]
        Domain(u32),
        /// Opaque return address chosen by the sender.
        #[prost(bytes, tag = "2")]
        RoutingAddress(Vec<u8>),
    }
}

/// Request for session info, carrying the sender's 65-byte uncompressed
/// P-256 public key.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionInfoRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,
}

/// Vehicle session state, embedded as bytes inside the envelope's
/// `session_info` so its HMAC tag can be verified over the exact encoding.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionInfo {
    #[prost(uint32, tag = "1")]
    pub counter: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub epoch: Vec<u8>,
    /// Vehicle clock, seconds since its epoch base.
    #[prost(uint32, tag = "4")]
    pub clock_time: u32,
    #[prost(int32, tag = "5")]
    pub status: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HmacSignature {
    #[prost(bytes = "vec", tag = "1")]
    pub epoch: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub counter: u32,
    #[prost(uint32, tag = "3")]
    pub expires_at: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub tag: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandSignature {
    #[prost(bytes = "vec", tag = "1")]
    pub signer_public_key: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub hmac: Option<HmacSignature>,
}

/// The outer envelope POSTed (base64) to the fleet `signed_command`
/// endpoint and returned by handshake responses.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedEnvelope {
    #[prost(message, optional, tag = "1")]
    pub to_destination: Option<EnvelopeDestination>,
    #[prost(message, optional, tag = "2")]
    pub from_destination: Option<EnvelopeDestination>,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
    #[prost(message, optional, tag = "4")]
    pub signature: Option<CommandSignature>,
    #[prost(bytes = "vec", tag = "5")]
    pub session_info: Vec<u8>,
    #[prost(message, optional, tag = "6")]
    pub session_info_request: Option<SessionInfoRequest>,
}

/// Compact action record carried as the signed payload. The vehicle-side
/// action schema is a collaborator; this node treats it as opaque bytes
/// once signed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandPayload {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub params_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn telemetry_payload_roundtrip() {
        let payload = TelemetryPayload {
            data: vec![
                TelemetryDatum {
                    key: "Soc".into(),
                    value: Some(TelemetryValue {
                        value: Some(telemetry_value::Value::Double(72.5)),
                    }),
                },
                TelemetryDatum {
                    key: "Location".into(),
                    value: Some(TelemetryValue {
                        value: Some(telemetry_value::Value::Loc(LocationValue {
                            lat: 37.7749,
                            lon: -122.4194,
                            heading: Some(88.0),
                            speed: None,
                        })),
                    }),
                },
            ],
            created_at: Some(::prost_types::Timestamp { seconds: 1_700_000_000, nanos: 0 }),
            vin: "5YJ3E1EA1NF000000".into(),
        };
        let bytes = payload.encode_to_vec();
        let back = TelemetryPayload::decode(bytes.as_slice()).unwrap();
        assert_eq!(payload, back);
    }

    #[test]
    fn signed_envelope_roundtrip() {
        let env = SignedEnvelope {
            to_destination: Some(EnvelopeDestination {
                recipient: Some(envelope_destination::Recipient::Domain(
                    Domain::VehicleSecurity.wire_value(),
                )),
            }),
            from_destination: Some(EnvelopeDestination {
                recipient: Some(envelope_destination::Recipient::RoutingAddress(vec![7; 16])),
            }),
            payload: b"payload-bytes".to_vec(),
            signature: Some(CommandSignature {
                signer_public_key: vec![4; 65],
                hmac: Some(HmacSignature {
                    epoch: vec![1, 2, 3],
                    counter: 9,
                    expires_at: 1_700_000_005,
                    tag: vec![0xAA; 17],
                }),
            }),
            session_info: Vec::new(),
            session_info_request: None,
        };
        let back = SignedEnvelope::decode(env.encode_to_vec().as_slice()).unwrap();
        assert_eq!(env, back);
        assert_eq!(back.payload, b"payload-bytes");
    }
}
