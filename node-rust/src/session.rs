//! Vehicle command sessions and envelope signing.
//!
//! Each `(vin, domain)` pair owns an independent session: a 16-byte shared
//! key agreed over ECDH P-256 through the fleet REST relay, two HMAC-derived
//! subkeys, the vehicle-assigned epoch, and a strictly monotonic counter.
//! All handshake and counter operations for one pair are serialized by a
//! per-pair mutex; distinct pairs sign in parallel.
//!
//! The counter is consumed only when the vehicle acknowledges the command —
//! transport failures and cancelled POSTs leave it untouched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use prost::Message;
use rand::RngCore;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use vehicle_types::wire::{
    envelope_destination::Recipient, CommandSignature, Domain, EnvelopeDestination,
    HmacSignature, SessionInfo, SessionInfoRequest, SignedEnvelope,
};

use crate::errors::{NodeError, Result};
use crate::fleet::{signed_command_path, FleetTransport};
use crate::tlv::{
    TlvWriter, SIGNATURE_TYPE_HMAC_PERSONALIZED, TAG_COUNTER, TAG_DOMAIN, TAG_EPOCH,
    TAG_EXPIRES_AT, TAG_FLAGS, TAG_PERSONALIZATION, TAG_SIGNATURE_TYPE,
};

type HmacSha256 = Hmac<Sha256>;

/// Sessions are re-established after this long regardless of counter state.
pub const SESSION_TTL: Duration = Duration::from_secs(300);

/// Default signed-command validity window.
pub const COMMAND_TTL_SECS: u32 = 5;

const KDF_COMMAND: &[u8] = b"authenticated command";
const KDF_SESSION_INFO: &[u8] = b"session info";

fn unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

// ── Session state ─────────────────────────────────────────────────────────────

pub struct Session {
    signing_key: [u8; 32],
    epoch: Vec<u8>,
    counter: u32,
    clock_offset_secs: i64,
    established_at: Instant,
}

impl Session {
    /// Derive a session from the vehicle's session-info reply, verifying its
    /// HMAC tag before trusting anything in it.
    fn derive(local: &SecretKey, info_bytes: &[u8], tag: &[u8]) -> Result<Session> {
        let info = SessionInfo::decode(info_bytes)
            .map_err(|e| NodeError::HandshakeFailed(format!("session info decode: {e}")))?;

        let peer = PublicKey::from_sec1_bytes(&info.public_key)
            .map_err(|e| NodeError::HandshakeFailed(format!("peer public key: {e}")))?;
        let shared = p256::ecdh::diffie_hellman(local.to_nonzero_scalar(), peer.as_affine());
        let shared_key: [u8; 16] = Sha1::digest(shared.raw_secret_bytes())[..16]
            .try_into()
            .expect("SHA-1 digest is 20 bytes");

        let session_info_key = hmac_sha256(&shared_key, KDF_SESSION_INFO);
        let mut mac = HmacSha256::new_from_slice(&session_info_key)
            .expect("HMAC accepts any key length");
        mac.update(info_bytes);
        mac.verify_slice(tag).map_err(|_| {
            NodeError::HandshakeFailed("session info tag did not verify".into())
        })?;

        Ok(Session {
            signing_key: hmac_sha256(&shared_key, KDF_COMMAND),
            epoch: info.epoch,
            counter: info.counter,
            clock_offset_secs: info.clock_time as i64 - unix_secs(),
            established_at: Instant::now(),
        })
    }

    fn expired(&self) -> bool {
        self.established_at.elapsed() >= SESSION_TTL
    }
}

// ── Session manager ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Slot {
    session: Option<Session>,
}

pub struct SessionManager {
    transport: Arc<dyn FleetTransport>,
    key: SecretKey,
    public_key_sec1: Vec<u8>,
    slots: Mutex<HashMap<(String, Domain), Arc<Mutex<Slot>>>>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn FleetTransport>, key: SecretKey) -> Self {
        let public_key_sec1 = key
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        Self {
            transport,
            key,
            public_key_sec1,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Discard any cached session; the next signed command re-handshakes.
    pub async fn invalidate(&self, vin: &str, domain: Domain) {
        let slot = self.slot(vin, domain).await;
        slot.lock().await.session = None;
    }

    async fn slot(&self, vin: &str, domain: Domain) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry((vin.to_string(), domain))
            .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
            .clone()
    }

    /// Execute a signed command transactionally: handshake on demand, sign
    /// with `counter + 1`, POST, and consume the counter only on success.
    /// One re-handshake is attempted when the vehicle rejects the signature;
    /// a second rejection surfaces as `SignatureMismatch`.
    pub async fn execute(&self, vin: &str, domain: Domain, payload: &[u8]) -> Result<Value> {
        let slot = self.slot(vin, domain).await;
        let mut guard = slot.lock().await;

        for attempt in 0..2 {
            if guard.session.as_ref().map_or(true, Session::expired) {
                guard.session = Some(self.handshake(vin, domain).await?);
            }
            let session = guard.session.as_ref().expect("session just established");
            let counter_next = session.counter + 1;

            let envelope = self.build_signed(vin, domain, session, counter_next, payload)?;
            let resp = self.post_routable(vin, &envelope).await?;

            let (ok, reason) = command_outcome(&resp);
            if ok || !is_signature_rejection(&reason) {
                // The vehicle processed the message, so its anti-replay
                // window moved: the counter is spent either way.
                if let Some(session) = guard.session.as_mut() {
                    session.counter = counter_next;
                }
                return Ok(resp);
            }

            warn!("Signed command rejected for {vin}/{domain:?} (attempt {attempt}): {reason}");
            guard.session = None;
        }

        Err(NodeError::SignatureMismatch)
    }

    /// ECDH handshake through the REST relay for one `(vin, domain)` pair.
    async fn handshake(&self, vin: &str, domain: Domain) -> Result<Session> {
        debug!("Establishing command session for {vin}/{domain:?}");
        let request = SignedEnvelope {
            to_destination: Some(EnvelopeDestination {
                recipient: Some(Recipient::Domain(domain.wire_value())),
            }),
            from_destination: Some(EnvelopeDestination {
                recipient: Some(Recipient::RoutingAddress(random_routing_address())),
            }),
            payload: Vec::new(),
            signature: None,
            session_info: Vec::new(),
            session_info_request: Some(SessionInfoRequest {
                public_key: self.public_key_sec1.clone(),
            }),
        };

        let resp = self.post_routable(vin, &request.encode_to_vec()).await?;
        let reply = decode_reply_envelope(&resp)?;
        if reply.session_info.is_empty() {
            return Err(NodeError::HandshakeFailed(
                "handshake reply carried no session info".into(),
            ));
        }
        let tag = reply
            .signature
            .as_ref()
            .and_then(|s| s.hmac.as_ref())
            .map(|h| h.tag.as_slice())
            .ok_or_else(|| NodeError::HandshakeFailed("handshake reply unsigned".into()))?;

        let session = Session::derive(&self.key, &reply.session_info, tag)?;
        info!(
            "Command session established for {vin}/{domain:?} (counter {}, epoch {})",
            session.counter,
            hex::encode(&session.epoch)
        );
        Ok(session)
    }

    /// Assemble the signed envelope for one command attempt.
    fn build_signed(
        &self,
        vin: &str,
        domain: Domain,
        session: &Session,
        counter: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let expires_at = (unix_secs() + session.clock_offset_secs) as u32 + COMMAND_TTL_SECS;

        let mut meta = TlvWriter::new();
        meta.push(TAG_SIGNATURE_TYPE, &[SIGNATURE_TYPE_HMAC_PERSONALIZED])?;
        meta.push(TAG_DOMAIN, &[domain.wire_value() as u8])?;
        meta.push(TAG_PERSONALIZATION, vin.as_bytes())?;
        // Epoch bytes go out exactly as the vehicle returned them.
        meta.push(TAG_EPOCH, &session.epoch)?;
        meta.push(TAG_EXPIRES_AT, &expires_at.to_be_bytes())?;
        meta.push(TAG_COUNTER, &counter.to_be_bytes())?;
        meta.push(TAG_FLAGS, &0u32.to_be_bytes())?;
        let metadata = meta.finish();

        let mut mac = HmacSha256::new_from_slice(&session.signing_key)
            .expect("HMAC accepts any key length");
        mac.update(&metadata);
        mac.update(payload);
        let full_tag: [u8; 32] = mac.finalize().into_bytes().into();
        let tag = full_tag[..domain.tag_len()].to_vec();

        let envelope = SignedEnvelope {
            to_destination: Some(EnvelopeDestination {
                recipient: Some(Recipient::Domain(domain.wire_value())),
            }),
            from_destination: Some(EnvelopeDestination {
                recipient: Some(Recipient::RoutingAddress(random_routing_address())),
            }),
            payload: payload.to_vec(),
            signature: Some(CommandSignature {
                signer_public_key: self.public_key_sec1.clone(),
                hmac: Some(HmacSignature {
                    epoch: session.epoch.clone(),
                    counter,
                    expires_at,
                    tag,
                }),
            }),
            session_info: Vec::new(),
            session_info_request: None,
        };
        Ok(envelope.encode_to_vec())
    }

    async fn post_routable(&self, vin: &str, envelope: &[u8]) -> Result<Value> {
        self.transport
            .post(
                &signed_command_path(vin),
                json!({ "routable_message": B64.encode(envelope) }),
            )
            .await
    }
}

fn random_routing_address() -> Vec<u8> {
    let mut addr = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut addr);
    addr
}

/// Pull the base64 envelope out of a handshake reply.
fn decode_reply_envelope(resp: &Value) -> Result<SignedEnvelope> {
    let b64 = resp
        .pointer("/response/routable_message")
        .and_then(Value::as_str)
        .ok_or_else(|| NodeError::HandshakeFailed("no routable_message in reply".into()))?;
    let bytes = B64
        .decode(b64)
        .map_err(|e| NodeError::HandshakeFailed(format!("reply base64: {e}")))?;
    SignedEnvelope::decode(bytes.as_slice())
        .map_err(|e| NodeError::HandshakeFailed(format!("reply envelope: {e}")))
}

fn command_outcome(resp: &Value) -> (bool, String) {
    let ok = resp
        .pointer("/response/result")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let reason = resp
        .pointer("/response/reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    (ok, reason)
}

fn is_signature_rejection(reason: &str) -> bool {
    let r = reason.to_ascii_lowercase();
    r.contains("signature") || r.contains("counter") || r.contains("epoch") || r.contains("token")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Vehicle-side half of the protocol, enough to answer handshakes and
    /// check command tags.
    pub struct MockVehicle {
        key: SecretKey,
        pub epoch: Vec<u8>,
        pub counter: u32,
        pub clock_time: u32,
    }

    impl MockVehicle {
        pub fn new() -> Self {
            Self {
                key: SecretKey::random(&mut rand::rngs::OsRng),
                epoch: vec![0xE0; 16],
                counter: 100,
                clock_time: 5_000,
            }
        }

        fn shared_key(&self, peer_sec1: &[u8]) -> [u8; 16] {
            let peer = PublicKey::from_sec1_bytes(peer_sec1).unwrap();
            let shared =
                p256::ecdh::diffie_hellman(self.key.to_nonzero_scalar(), peer.as_affine());
            Sha1::digest(shared.raw_secret_bytes())[..16].try_into().unwrap()
        }

        pub fn handshake_reply(&self, peer_sec1: &[u8]) -> Value {
            let info = SessionInfo {
                counter: self.counter,
                public_key: self.key.public_key().to_encoded_point(false).as_bytes().to_vec(),
                epoch: self.epoch.clone(),
                clock_time: self.clock_time,
                status: 0,
            };
            let info_bytes = info.encode_to_vec();
            let shared = self.shared_key(peer_sec1);
            let info_key = hmac_sha256(&shared, KDF_SESSION_INFO);
            let tag = hmac_sha256(&info_key, &info_bytes);

            let reply = SignedEnvelope {
                to_destination: None,
                from_destination: None,
                payload: Vec::new(),
                signature: Some(CommandSignature {
                    signer_public_key: Vec::new(),
                    hmac: Some(HmacSignature {
                        epoch: self.epoch.clone(),
                        counter: self.counter,
                        expires_at: 0,
                        tag: tag.to_vec(),
                    }),
                }),
                session_info: info_bytes,
                session_info_request: None,
            };
            json!({ "response": { "routable_message": B64.encode(reply.encode_to_vec()) } })
        }

        /// Verify a command envelope the way the vehicle would.
        pub fn verify_command(&self, peer_sec1: &[u8], envelope: &SignedEnvelope) -> bool {
            let hmac_sig = envelope.signature.as_ref().unwrap().hmac.as_ref().unwrap();
            let shared = self.shared_key(peer_sec1);
            let signing_key = hmac_sha256(&shared, KDF_COMMAND);

            let mut meta = TlvWriter::new();
            meta.push(TAG_SIGNATURE_TYPE, &[SIGNATURE_TYPE_HMAC_PERSONALIZED]).unwrap();
            meta.push(TAG_DOMAIN, &[2]).unwrap();
            meta.push(TAG_PERSONALIZATION, b"5YJ3E1EA1NF000000").unwrap();
            meta.push(TAG_EPOCH, &hmac_sig.epoch).unwrap();
            meta.push(TAG_EXPIRES_AT, &hmac_sig.expires_at.to_be_bytes()).unwrap();
            meta.push(TAG_COUNTER, &hmac_sig.counter.to_be_bytes()).unwrap();
            meta.push(TAG_FLAGS, &0u32.to_be_bytes()).unwrap();
            let metadata = meta.finish();

            let mut mac = HmacSha256::new_from_slice(&signing_key).unwrap();
            mac.update(&metadata);
            mac.update(&envelope.payload);
            let full: [u8; 32] = mac.finalize().into_bytes().into();
            full[..hmac_sig.tag.len()] == hmac_sig.tag[..]
        }
    }

    /// Records every POST body and plays scripted replies.
    pub struct MockTransport {
        pub vehicle: MockVehicle,
        pub posts: StdMutex<Vec<(String, Value)>>,
        pub fail_signatures: StdMutex<u32>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                vehicle: MockVehicle::new(),
                posts: StdMutex::new(Vec::new()),
                fail_signatures: StdMutex::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl FleetTransport for MockTransport {
        async fn get(&self, _path: &str) -> Result<Value> {
            Ok(json!({}))
        }

        async fn post(&self, path: &str, body: Value) -> Result<Value> {
            self.posts.lock().unwrap().push((path.to_string(), body.clone()));
            let b64 = body["routable_message"].as_str().unwrap();
            let envelope =
                SignedEnvelope::decode(B64.decode(b64).unwrap().as_slice()).unwrap();

            if let Some(req) = &envelope.session_info_request {
                return Ok(self.vehicle.handshake_reply(&req.public_key));
            }

            let mut failures = self.fail_signatures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Ok(json!({ "response": { "result": false, "reason": "signature mismatch" } }));
            }
            Ok(json!({ "response": { "result": true, "reason": "" } }))
        }
    }

    fn captured_command_envelopes(transport: &MockTransport) -> Vec<SignedEnvelope> {
        transport
            .posts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| {
                let b64 = body["routable_message"].as_str().unwrap();
                SignedEnvelope::decode(B64.decode(b64).unwrap().as_slice()).unwrap()
            })
            .filter(|e| e.session_info_request.is_none())
            .collect()
    }

    #[tokio::test]
    async fn counter_is_strictly_monotonic_across_commands() {
        let transport = Arc::new(MockTransport::new());
        let manager = SessionManager::new(
            transport.clone(),
            SecretKey::random(&mut rand::rngs::OsRng),
        );
        let vin = "5YJ3E1EA1NF000000";

        for _ in 0..3 {
            manager
                .execute(vin, Domain::VehicleSecurity, b"door-lock-payload")
                .await
                .unwrap();
        }

        let envelopes = captured_command_envelopes(&transport);
        assert_eq!(envelopes.len(), 3);
        let counters: Vec<u32> = envelopes
            .iter()
            .map(|e| e.signature.as_ref().unwrap().hmac.as_ref().unwrap().counter)
            .collect();
        assert_eq!(counters, vec![101, 102, 103]);

        let epochs: Vec<&Vec<u8>> = envelopes
            .iter()
            .map(|e| &e.signature.as_ref().unwrap().hmac.as_ref().unwrap().epoch)
            .collect();
        assert!(epochs.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn command_tag_verifies_on_the_vehicle_side() {
        let transport = Arc::new(MockTransport::new());
        let local = SecretKey::random(&mut rand::rngs::OsRng);
        let local_pub = local.public_key().to_encoded_point(false).as_bytes().to_vec();
        let manager = SessionManager::new(transport.clone(), local);

        manager
            .execute("5YJ3E1EA1NF000000", Domain::VehicleSecurity, b"payload")
            .await
            .unwrap();

        let envelopes = captured_command_envelopes(&transport);
        assert_eq!(envelopes.len(), 1);
        assert!(transport.vehicle.verify_command(&local_pub, &envelopes[0]));
        // Security-domain tags are truncated to 17 bytes.
        let tag = &envelopes[0].signature.as_ref().unwrap().hmac.as_ref().unwrap().tag;
        assert_eq!(tag.len(), 17);
    }

    #[tokio::test]
    async fn signature_rejection_rehandshakes_once_then_fails() {
        let transport = Arc::new(MockTransport::new());
        *transport.fail_signatures.lock().unwrap() = 2;
        let manager = SessionManager::new(
            transport.clone(),
            SecretKey::random(&mut rand::rngs::OsRng),
        );

        let err = manager
            .execute("5YJ3E1EA1NF000000", Domain::VehicleSecurity, b"payload")
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::SignatureMismatch));

        // Two handshakes (initial + retry), two rejected command posts.
        let handshakes = transport
            .posts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, body)| {
                let b64 = body["routable_message"].as_str().unwrap();
                SignedEnvelope::decode(B64.decode(b64).unwrap().as_slice())
                    .unwrap()
                    .session_info_request
                    .is_some()
            })
            .count();
        assert_eq!(handshakes, 2);
    }

    #[tokio::test]
    async fn rejection_for_non_signature_reason_is_not_retried() {
        struct RefusingTransport(MockTransport);
        #[async_trait::async_trait]
        impl FleetTransport for RefusingTransport {
            async fn get(&self, p: &str) -> Result<Value> {
                self.0.get(p).await
            }
            async fn post(&self, path: &str, body: Value) -> Result<Value> {
                let resp = self.0.post(path, body).await?;
                if resp.pointer("/response/result").is_some() {
                    return Ok(json!({ "response": { "result": false, "reason": "user_present" } }));
                }
                Ok(resp)
            }
        }

        let transport = Arc::new(RefusingTransport(MockTransport::new()));
        let manager = SessionManager::new(
            transport.clone(),
            SecretKey::random(&mut rand::rngs::OsRng),
        );
        let resp = manager
            .execute("5YJ3E1EA1NF000000", Domain::VehicleSecurity, b"payload")
            .await
            .unwrap();
        assert_eq!(resp.pointer("/response/result"), Some(&json!(false)));
    }
}
