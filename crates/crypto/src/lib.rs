//! Action signing and verification.
//!
//! Binds an action to an identity and to the hash of the state it extends,
//! forming a verifiable chain:
//!
//! - `action_hash = sha256(scope ‖ type ‖ jcs(input))` with RFC 8785 (JCS)
//!   canonical JSON, so every reactor derives the same digest.
//! - The signature tuple is `[timestamp, signerPublicKey, actionHash,
//!   prevStateHash, signatureBytes]`, signed over a fixed message prefix.
//! - A present, valid signature is never silently replaced: a foreign
//!   pre-signed action passes through verification unchanged.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use sha2::{Digest, Sha256};
use strand_primitives::{
    Action, ActionContext, ActionSignature, Hash, SignerApp, SignerContext,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Domain separator prefixed to every signed message.
const MESSAGE_PREFIX: &[u8] = b"strand-action-signature-v1\n";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SignError {
    /// The action carries a signer context but no signature tuple.
    #[error("no signature found")]
    NoSignatureFound,

    /// The signature does not verify against the action. Fatal for the
    /// action; never auto-corrected.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("operation aborted")]
    Aborted,

    #[error("failed to canonicalize action input: {0}")]
    Canonicalization(String),
}

pub type SignResult<T> = Result<T, SignError>;

/// Computes the canonical digest of an action: scope, type and the JCS
/// serialization of the input.
pub fn action_hash(action: &Action) -> SignResult<Hash> {
    let canonical_input = serde_json_canonicalizer::to_vec(&action.input)
        .map_err(|err| SignError::Canonicalization(err.to_string()))?;

    let mut hasher = Sha256::default();
    hasher.update(action.scope.as_str().as_bytes());
    hasher.update(action.kind.as_bytes());
    hasher.update(&canonical_input);

    Ok(Hash::from(<[u8; 32]>::from(hasher.finalize())))
}

/// The exact bytes the ed25519 signature covers.
fn signing_message(timestamp_utc_ms: u64, action_hash: &Hash, prev_state_hash: &Hash) -> Vec<u8> {
    let timestamp = timestamp_utc_ms.to_string();

    let mut message =
        Vec::with_capacity(MESSAGE_PREFIX.len() + timestamp.len() + 64);
    message.extend_from_slice(MESSAGE_PREFIX);
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(action_hash.as_bytes());
    message.extend_from_slice(prev_state_hash.as_bytes());

    message
}

/// Signs actions on behalf of one app identity.
#[derive(Debug)]
pub struct ActionSigner {
    signing_key: SigningKey,
    app_name: String,
}

impl ActionSigner {
    #[must_use]
    pub fn new(signing_key: SigningKey, app_name: impl Into<String>) -> Self {
        Self {
            signing_key,
            app_name: app_name.into(),
        }
    }

    /// Hex encoding of this signer's public key.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Signs an action, chaining it to `prev_state_hash`.
    ///
    /// If the action is already signed and `override_signature` is false,
    /// the existing signature is verified and the action returned
    /// unchanged, guaranteeing a foreign pre-signed action is never
    /// overwritten by the local signer.
    ///
    /// # Errors
    ///
    /// [`SignError::Aborted`] when `signal` is cancelled;
    /// [`SignError::InvalidSignature`] / [`SignError::NoSignatureFound`]
    /// when verification of a pre-signed action fails.
    pub async fn sign_action(
        &self,
        mut action: Action,
        prev_state_hash: &Hash,
        signal: Option<&CancellationToken>,
        override_signature: bool,
    ) -> SignResult<Action> {
        check_signal(signal)?;

        if !override_signature {
            if let Some(signer) = action.signer() {
                if signer.signatures.is_empty() {
                    return Err(SignError::NoSignatureFound);
                }

                verify_action(&action)?;
                return Ok(action);
            }
        }

        let digest = action_hash(&action)?;

        check_signal(signal)?;

        let timestamp_utc_ms = action.timestamp_utc_ms;
        let message = signing_message(timestamp_utc_ms, &digest, prev_state_hash);
        let signature = self.signing_key.sign(&message);

        check_signal(signal)?;

        let tuple = ActionSignature {
            timestamp_utc_ms,
            signer_public_key: self.public_key_hex(),
            action_hash: digest,
            prev_state_hash: *prev_state_hash,
            signature_bytes: hex::encode(signature.to_bytes()),
        };

        let context = action.context.get_or_insert_with(ActionContext::default);
        context.signer = Some(SignerContext {
            app: SignerApp {
                name: self.app_name.clone(),
                key: self.public_key_hex(),
            },
            user: None,
            signatures: vec![tuple],
        });

        Ok(action)
    }
}

/// Verifies an action's signature chain.
///
/// # Errors
///
/// [`SignError::NoSignatureFound`] if the action carries no signature;
/// [`SignError::InvalidSignature`] if the digest or the ed25519 signature
/// does not check out.
pub fn verify_action(action: &Action) -> SignResult<()> {
    let signer = action.signer().ok_or(SignError::NoSignatureFound)?;
    let tuple = signer
        .signatures
        .first()
        .ok_or(SignError::NoSignatureFound)?;

    if tuple.signer_public_key != signer.app.key {
        return Err(SignError::InvalidSignature(
            "signature public key does not match signer app key".to_owned(),
        ));
    }

    let expected = action_hash(action)?;
    if tuple.action_hash != expected {
        return Err(SignError::InvalidSignature(
            "action hash mismatch".to_owned(),
        ));
    }

    let key_bytes = decode_fixed::<32>(&tuple.signer_public_key, "public key")?;
    let sig_bytes = decode_fixed::<64>(&tuple.signature_bytes, "signature")?;

    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|err| SignError::InvalidSignature(format!("invalid public key: {err}")))?;
    let signature = Signature::from_bytes(&sig_bytes);

    let message = signing_message(tuple.timestamp_utc_ms, &tuple.action_hash, &tuple.prev_state_hash);

    verifying_key
        .verify(&message, &signature)
        .map_err(|err| SignError::InvalidSignature(err.to_string()))
}

fn decode_fixed<const N: usize>(encoded: &str, what: &str) -> SignResult<[u8; N]> {
    let bytes = hex::decode(encoded)
        .map_err(|err| SignError::InvalidSignature(format!("invalid hex {what}: {err}")))?;

    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| SignError::InvalidSignature(format!("invalid {what} length: {len}")))
}

fn check_signal(signal: Option<&CancellationToken>) -> SignResult<()> {
    if signal.is_some_and(CancellationToken::is_cancelled) {
        return Err(SignError::Aborted);
    }
    Ok(())
}
