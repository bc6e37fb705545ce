use atrium_crypto::verify::verify_signature;
use base64ct::{Base64UrlUnpadded, Encoding};

use super::{Error, SignedOperation};

/// Verifies `op.sig` against an ordered set of candidate did-keys, in
/// order, returning the first one that verifies.
pub(crate) fn verify_sig(
    allowed_did_keys: &[String],
    op: &SignedOperation,
) -> Result<String, Error> {
    if op.sig.is_empty() || op.sig.ends_with('=') {
        return Err(Error::InvalidSignature { op: op.clone() });
    }

    let sig_bytes = Base64UrlUnpadded::decode_vec(&op.sig)
        .map_err(|_| Error::InvalidSignature { op: op.clone() })?;

    let data = op.unsigned_bytes();

    allowed_did_keys
        .iter()
        .find(|did_key| verify_signature(did_key, &data, &sig_bytes).unwrap_or(false))
        .cloned()
        .ok_or_else(|| Error::InvalidSignature { op: op.clone() })
}
