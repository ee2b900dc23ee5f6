//! BIP341 key-path tweak.
//!
//! `t = taggedHash("TapTweak", P_x || merkle_root?)`. The private key is
//! negated when its public key has an odd Y coordinate, so the tweaked key
//! always corresponds to the even-Y internal key the output commits to.

use miniscript::bitcoin::hashes::{sha256, Hash, HashEngine};
use miniscript::bitcoin::secp256k1::{
    Keypair, Parity, Scalar, Secp256k1, SecretKey, Signing, Verification, XOnlyPublicKey,
};
use miniscript::bitcoin::TapNodeHash;

use crate::error::SendError;

const TAP_TWEAK_TAG: &[u8] = b"TapTweak";

/// `sha256(sha256(tag) || sha256(tag) || data)`
pub fn tagged_hash(tag: &[u8], data: &[&[u8]]) -> [u8; 32] {
    let tag_hash = sha256::Hash::hash(tag).to_byte_array();
    let mut engine = sha256::Hash::engine();
    engine.input(&tag_hash);
    engine.input(&tag_hash);
    for chunk in data {
        engine.input(chunk);
    }
    sha256::Hash::from_engine(engine).to_byte_array()
}

pub fn tap_tweak_hash(internal_key: &XOnlyPublicKey, merkle_root: Option<TapNodeHash>) -> [u8; 32] {
    let key = internal_key.serialize();
    match merkle_root {
        Some(root) => {
            let root = root.to_byte_array();
            tagged_hash(TAP_TWEAK_TAG, &[key.as_slice(), root.as_slice()])
        }
        None => tagged_hash(TAP_TWEAK_TAG, &[key.as_slice()]),
    }
}

fn tweak_scalar(
    internal_key: &XOnlyPublicKey,
    merkle_root: Option<TapNodeHash>,
) -> Result<Scalar, SendError> {
    Scalar::from_be_bytes(tap_tweak_hash(internal_key, merkle_root))
        .map_err(|_| SendError::Signing("taproot tweak out of range".to_string()))
}

/// A tweaked signing key together with both x-only keys it relates to.
pub struct TweakedKey {
    pub keypair: Keypair,
    pub internal_key: XOnlyPublicKey,
    pub output_key: XOnlyPublicKey,
}

impl Drop for TweakedKey {
    fn drop(&mut self) {
        self.keypair.non_secure_erase();
    }
}

pub fn tweak_secret_key<C: Signing>(
    secp: &Secp256k1<C>,
    secret: &SecretKey,
    merkle_root: Option<TapNodeHash>,
) -> Result<TweakedKey, SendError> {
    let (internal_key, parity) = secret.x_only_public_key(secp);
    let even = if parity == Parity::Odd {
        secret.negate()
    } else {
        *secret
    };
    let tweaked = even
        .add_tweak(&tweak_scalar(&internal_key, merkle_root)?)
        .map_err(|e| SendError::Signing(format!("taproot tweak failed: {}", e)))?;
    let keypair = Keypair::from_secret_key(secp, &tweaked);
    let (output_key, _) = keypair.x_only_public_key();
    Ok(TweakedKey {
        keypair,
        internal_key,
        output_key,
    })
}

/// Output key committed to by a P2TR output with this internal key.
pub fn output_key<C: Verification>(
    secp: &Secp256k1<C>,
    internal_key: &XOnlyPublicKey,
    merkle_root: Option<TapNodeHash>,
) -> Result<XOnlyPublicKey, SendError> {
    internal_key
        .add_tweak(secp, &tweak_scalar(internal_key, merkle_root)?)
        .map(|(key, _)| key)
        .map_err(|e| SendError::Signing(format!("taproot tweak failed: {}", e)))
}
