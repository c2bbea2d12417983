use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::document::Scope;
use crate::hash::Hash;

/// One committed entry in a scope's operation log.
///
/// `index` is the position in the log; `skip` counts predecessors
/// invalidated by this operation; `hash` chains to the previous operation's
/// hash. Exactly one operation is canonical per index within a scope.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub index: u64,
    pub skip: u64,
    pub hash: Hash,
    pub timestamp_utc_ms: u64,
    pub action: Action,
}

impl Operation {
    /// Computes the chained hash for an operation extending `prev_hash`.
    pub fn chain_hash(prev_hash: &Hash, action: &Action) -> serde_json::Result<Hash> {
        let action_digest = Hash::hash_json(action)?;
        Ok(prev_hash.chain(action_digest.as_bytes()))
    }
}

/// A proposed mutation, not yet committed to a log.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: String,
    /// Action type understood by the document model's reducer.
    #[serde(rename = "type")]
    pub kind: String,
    pub scope: Scope,
    pub timestamp_utc_ms: u64,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ActionContext>,
}

impl Action {
    #[must_use]
    pub fn signer(&self) -> Option<&SignerContext> {
        self.context.as_ref()?.signer.as_ref()
    }

    #[must_use]
    pub fn signer_mut(&mut self) -> Option<&mut SignerContext> {
        self.context.as_mut()?.signer.as_mut()
    }

    /// True if the action carries at least one signature.
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.signer().is_some_and(|s| !s.signatures.is_empty())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<SignerContext>,
}

/// Provenance of an action: the app and user that produced it, plus the
/// signature chain binding it to prior state.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerContext {
    pub app: SignerApp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<SignerUser>,
    #[serde(default)]
    pub signatures: Vec<ActionSignature>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerApp {
    pub name: String,
    /// Hex-encoded ed25519 public key.
    pub key: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerUser {
    pub address: String,
    pub network_id: String,
    pub chain_id: u64,
}

/// The signature 5-tuple, serialized as a JSON array of strings:
/// `[timestamp, signerPublicKey, actionHash, prevStateHash, signatureBytes]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionSignature {
    pub timestamp_utc_ms: u64,
    /// Hex-encoded ed25519 public key of the signer.
    pub signer_public_key: String,
    /// Base58 digest of the signed action.
    pub action_hash: Hash,
    /// Base58 digest of the state this action extends.
    pub prev_state_hash: Hash,
    /// Hex-encoded ed25519 signature bytes.
    pub signature_bytes: String,
}

impl Serialize for ActionSignature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let tuple = [
            self.timestamp_utc_ms.to_string(),
            self.signer_public_key.clone(),
            self.action_hash.to_base58(),
            self.prev_state_hash.to_base58(),
            self.signature_bytes.clone(),
        ];
        tuple.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ActionSignature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let [timestamp, key, action_hash, prev_state_hash, signature] =
            <[String; 5]>::deserialize(deserializer)?;

        Ok(Self {
            timestamp_utc_ms: timestamp.parse().map_err(D::Error::custom)?,
            signer_public_key: key,
            action_hash: action_hash.parse().map_err(D::Error::custom)?,
            prev_state_hash: prev_state_hash.parse().map_err(D::Error::custom)?,
            signature_bytes: signature,
        })
    }
}
