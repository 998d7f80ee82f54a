// src/core/jwt.rs

//! Short-lived HMAC-signed tokens exchanged between nodes on every internal
//! HTTPS call (`X-Cluster-Token: Bearer <jwt>`). Deliberately not a general
//! JWT library dependency: the claim set is one field and HS256 over it is
//! a few lines with crates already on the dependency list.

use crate::core::errors::{FleetError, FleetResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    node_uuid: uuid::Uuid,
    exp: i64,
}

pub struct ClusterJwt {
    secret: Vec<u8>,
}

impl ClusterJwt {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    pub fn issue(&self, node_uuid: uuid::Uuid, ttl: chrono::Duration) -> FleetResult<String> {
        let claims = Claims {
            node_uuid,
            exp: (chrono::Utc::now() + ttl).timestamp(),
        };
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signing_input = format!("{header}.{payload}");
        let signature = self.sign(signing_input.as_bytes());
        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
    }

    pub fn verify(&self, token: &str) -> FleetResult<uuid::Uuid> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(sig_b64)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(FleetError::ClusterSshInvalid("malformed cluster jwt".into()));
        };
        let signing_input = format!("{header}.{payload}");
        let expected = self.sign(signing_input.as_bytes());
        let actual = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| FleetError::ClusterSshInvalid("bad jwt signature encoding".into()))?;
        if actual != expected {
            return Err(FleetError::ClusterSshInvalid("cluster jwt signature mismatch".into()));
        }

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| FleetError::ClusterSshInvalid("bad jwt payload encoding".into()))?;
        let claims: Claims = serde_json::from_slice(&payload_bytes)?;
        if claims.exp < chrono::Utc::now().timestamp() {
            return Err(FleetError::ClusterSshInvalid("cluster jwt expired".into()));
        }
        Ok(claims.node_uuid)
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_node_uuid() {
        let jwt = ClusterJwt::new(b"test-secret".to_vec());
        let node = uuid::Uuid::new_v4();
        let token = jwt.issue(node, chrono::Duration::seconds(30)).unwrap();
        assert_eq!(jwt.verify(&token).unwrap(), node);
    }

    #[test]
    fn rejects_expired_token() {
        let jwt = ClusterJwt::new(b"test-secret".to_vec());
        let node = uuid::Uuid::new_v4();
        let token = jwt.issue(node, chrono::Duration::seconds(-1)).unwrap();
        assert!(jwt.verify(&token).is_err());
    }

    #[test]
    fn rejects_tampered_signature() {
        let jwt = ClusterJwt::new(b"test-secret".to_vec());
        let other = ClusterJwt::new(b"other-secret".to_vec());
        let node = uuid::Uuid::new_v4();
        let token = jwt.issue(node, chrono::Duration::seconds(30)).unwrap();
        assert!(other.verify(&token).is_err());
    }
}
