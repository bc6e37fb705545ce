use std::collections::HashMap;

use atrium_api::types::string::{Cid as AtriumCid, Datetime, Did};
use cid::multihash::Multihash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

mod crypto;
mod validate;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests;

pub(crate) use validate::{resolve, step, validate_log, Error, StepResult};

pub(crate) const ATPROTO_VERIFICATION_METHOD: &str = "atproto";
pub(crate) const ATPROTO_PDS_KIND: &str = "atproto_pds";
pub(crate) const ATPROTO_PDS_TYPE: &str = "AtprotoPersonalDataServer";

/// The body of a v2 `plc_operation`, and also the shape produced by
/// normalizing any compatible operation. Reused for both, since they
/// are structurally identical once legacy fields are mapped across.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PlcData {
    pub(crate) rotation_keys: Vec<String>,
    pub(crate) verification_methods: HashMap<String, String>,
    pub(crate) also_known_as: Vec<String>,
    pub(crate) services: HashMap<String, Service>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Service {
    pub(crate) r#type: String,
    pub(crate) endpoint: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChangeOp {
    #[serde(flatten)]
    pub(crate) data: PlcData,
    pub(crate) prev: Option<AtriumCid>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TombstoneOp {
    pub(crate) prev: AtriumCid,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LegacyCreateOp {
    pub(crate) signing_key: String,
    pub(crate) recovery_key: String,
    pub(crate) handle: String,
    pub(crate) service: String,
    /// Legacy creates always carry a literal `null` here on the wire.
    pub(crate) prev: (),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub(crate) enum Operation {
    #[serde(rename = "plc_operation")]
    Change(ChangeOp),
    #[serde(rename = "plc_tombstone")]
    Tombstone(TombstoneOp),
    #[serde(rename = "create")]
    LegacyCreate(LegacyCreateOp),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub(crate) struct SignedOperation {
    #[serde(flatten)]
    pub(crate) content: Operation,
    pub(crate) sig: String,
}

/// A single entry in a DID's operation log, as stored and replayed by the
/// validator. `nullified` is carried only as the importer's own bookkeeping
/// hint (see §3/§8 of the design notes); the validator never reads it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LogEntry {
    pub(crate) did: Did,
    pub(crate) operation: SignedOperation,
    pub(crate) cid: AtriumCid,
    #[serde(default)]
    pub(crate) nullified: bool,
    pub(crate) created_at: Datetime,
}

/// The resolved identity state for a DID: the document produced by
/// normalizing its most recent non-tombstone operation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct State {
    pub(crate) did: Did,
    pub(crate) plc: PlcData,
}

impl SignedOperation {
    /// Canonical dag-cbor encoding with `sig` removed, used for hashing
    /// and signature verification. Never the encoding used for CIDs.
    pub(crate) fn unsigned_bytes(&self) -> Vec<u8> {
        serde_ipld_dagcbor::to_vec(&self.content).expect("operation content always encodes")
    }

    /// Canonical dag-cbor encoding including `sig`, used for CIDs and for
    /// genesis DID derivation.
    pub(crate) fn signed_bytes(&self) -> Vec<u8> {
        serde_ipld_dagcbor::to_vec(self).expect("signed operation always encodes")
    }

    pub(crate) fn cid(&self) -> AtriumCid {
        AtriumCid::new(raw_cid_of(&self.signed_bytes()))
    }
}

fn raw_cid_of(bytes: &[u8]) -> cid::Cid {
    let digest = Sha256::digest(bytes);
    let mh = Multihash::<64>::wrap(0x12, &digest).expect("a sha2-256 digest is 32 bytes");
    cid::Cid::new_v1(0x71, mh)
}

pub(crate) fn cid_to_string(cid: &AtriumCid) -> String {
    cid.as_ref().to_string()
}

pub(crate) fn cid_from_string(s: &str) -> Result<AtriumCid, cid::Error> {
    s.parse::<cid::Cid>().map(AtriumCid::new)
}

/// Derives the DID a genesis operation must be indexed under.
pub(crate) fn did_for(genesis: &SignedOperation) -> Did {
    let digest = Sha256::digest(genesis.signed_bytes());
    let encoded = base32::encode(base32::Alphabet::Rfc4648Lower { padding: false }, &digest);
    Did::new(format!("did:plc:{}", &encoded[..24])).expect("well-formed by construction")
}

fn operation_prev(op: &Operation) -> Option<AtriumCid> {
    match op {
        Operation::Change(op) => op.prev.clone(),
        Operation::Tombstone(op) => Some(op.prev.clone()),
        Operation::LegacyCreate(_) => None,
    }
}

/// Maps a compatible operation (v2 `plc_operation` or legacy v1
/// `create`) into the canonical v2 shape. `None` for tombstones, which
/// have no normalized form.
pub(crate) fn normalize(op: &Operation) -> Option<PlcData> {
    match op {
        Operation::Tombstone(_) => None,
        Operation::Change(op) => Some(op.data.clone()),
        Operation::LegacyCreate(op) => {
            let mut verification_methods = HashMap::new();
            verification_methods.insert(ATPROTO_VERIFICATION_METHOD.to_string(), op.signing_key.clone());

            let mut services = HashMap::new();
            services.insert(
                ATPROTO_PDS_KIND.to_string(),
                Service {
                    r#type: ATPROTO_PDS_TYPE.to_string(),
                    endpoint: ensure_https(&op.service),
                },
            );

            Some(PlcData {
                rotation_keys: vec![op.recovery_key.clone(), op.signing_key.clone()],
                verification_methods,
                also_known_as: vec![ensure_at(&op.handle)],
                services,
            })
        }
    }
}

fn ensure_https(s: &str) -> String {
    if s.starts_with("http://") || s.starts_with("https://") {
        s.to_string()
    } else {
        format!("https://{s}")
    }
}

fn ensure_at(s: &str) -> String {
    if s.starts_with("at://") {
        return s.to_string();
    }

    let s = replace_first(s, "http://");
    let s = replace_first(&s, "https://");
    format!("at://{s}")
}

fn replace_first(s: &str, pat: &str) -> String {
    match s.find(pat) {
        Some(idx) => format!("{}{}", &s[..idx], &s[idx + pat.len()..]),
        None => s.to_string(),
    }
}

impl State {
    /// Renders the resolved identity as a W3C DID document.
    pub(crate) fn into_doc(self) -> Result<atrium_api::did_doc::DidDocument, ()> {
        use atrium_api::did_doc::{Service as DocService, VerificationMethod};

        let did = self.did.as_str().to_string();

        let verification_method = self
            .plc
            .verification_methods
            .into_iter()
            .map(|(name, key)| {
                let (algorithm, _) = atrium_crypto::did::parse_did_key(&key).map_err(|_| ())?;
                let multikey_type = match algorithm {
                    atrium_crypto::Algorithm::Secp256k1 => "EcdsaSecp256k1VerificationKey2019",
                    atrium_crypto::Algorithm::P256 => "EcdsaSecp256r1VerificationKey2019",
                };
                Ok(VerificationMethod {
                    id: format!("{did}#{name}"),
                    r#type: multikey_type.to_string(),
                    controller: did.clone(),
                    public_key_multibase: Some(key.trim_start_matches("did:key:z").to_string()),
                })
            })
            .collect::<Result<Vec<_>, ()>>()?;

        let service = self
            .plc
            .services
            .into_iter()
            .map(|(id, service)| DocService {
                id: format!("#{id}"),
                r#type: service.r#type,
                service_endpoint: service.endpoint,
            })
            .collect();

        Ok(atrium_api::did_doc::DidDocument {
            id: did,
            also_known_as: Some(self.plc.also_known_as),
            verification_method: Some(verification_method),
            service: Some(service),
        })
    }
}
