use std::collections::HashMap;

use atrium_api::types::string::{Cid, Datetime, Did};
use atrium_crypto::keypair::{Did as _, Export as _, P256Keypair};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Duration;
use rand_core::OsRng;

use super::{ChangeOp, LogEntry, Operation, PlcData, SignedOperation, TombstoneOp};

/// A real P-256 keypair, used to sign test operations so the validator's
/// actual crypto stack (not a mock) is exercised.
pub(crate) struct TestKey(P256Keypair);

impl TestKey {
    pub(crate) fn generate() -> Self {
        Self(P256Keypair::create(&mut OsRng))
    }

    pub(crate) fn did_key(&self) -> String {
        self.0.did()
    }

    fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.0.sign(msg).expect("signing over a valid key never fails")
    }
}

/// A deterministic timestamp, offset from a fixed epoch, avoiding any call
/// to `Datetime::now()` so tests are reproducible.
pub(crate) fn at_offset(offset_ms: i64) -> Datetime {
    let base = "2024-01-01T00:00:00Z"
        .parse::<chrono::DateTime<chrono::Utc>>()
        .expect("valid fixed epoch");
    Datetime::new((base + Duration::milliseconds(offset_ms)).fixed_offset())
}

pub(crate) fn rotation_only(rotation_keys: Vec<String>) -> PlcData {
    PlcData {
        rotation_keys,
        verification_methods: HashMap::new(),
        also_known_as: Vec::new(),
        services: HashMap::new(),
    }
}

/// A fluent builder for a single DID's operation log, signed with real
/// keys, for constructing both well-formed and adversarial histories.
pub(crate) struct TestLog {
    did: Did,
    entries: Vec<LogEntry>,
}

impl TestLog {
    /// Starts a log with a signed v2 genesis operation, deriving the DID
    /// from the operation itself (as a real importer would observe it).
    pub(crate) fn genesis(data: PlcData, key: &TestKey, created_at: Datetime) -> Self {
        Self::genesis_op(Operation::Change(ChangeOp { data, prev: None }), key, created_at)
    }

    /// Like [`Self::genesis`] but takes any operation variant, so callers
    /// can build a log whose genesis is a legacy v1 `create`.
    pub(crate) fn genesis_op(content: Operation, key: &TestKey, created_at: Datetime) -> Self {
        let signed = sign(content, key);
        let did = super::did_for(&signed);
        let cid = signed.cid();

        let entries = vec![LogEntry {
            did: did.clone(),
            operation: signed,
            cid,
            nullified: false,
            created_at,
        }];

        Self { did, entries }
    }

    pub(crate) fn did(&self) -> &Did {
        &self.did
    }

    pub(crate) fn head_cid(&self) -> Cid {
        self.entries.last().expect("never empty after genesis").cid.clone()
    }

    pub(crate) fn push_change(&mut self, data: PlcData, key: &TestKey, created_at: Datetime) -> Cid {
        let prev = self.head_cid();
        self.push_change_after(prev, data, key, created_at)
    }

    pub(crate) fn push_change_after(
        &mut self,
        prev: Cid,
        data: PlcData,
        key: &TestKey,
        created_at: Datetime,
    ) -> Cid {
        let content = Operation::Change(ChangeOp { data, prev: Some(prev) });
        self.push(content, key, created_at)
    }

    pub(crate) fn push_tombstone(&mut self, key: &TestKey, created_at: Datetime) -> Cid {
        let content = Operation::Tombstone(TombstoneOp { prev: self.head_cid() });
        self.push(content, key, created_at)
    }

    fn push(&mut self, content: Operation, key: &TestKey, created_at: Datetime) -> Cid {
        let signed = sign(content, key);
        let cid = signed.cid();

        self.entries.push(LogEntry {
            did: self.did.clone(),
            operation: signed,
            cid: cid.clone(),
            nullified: false,
            created_at,
        });

        cid
    }

    pub(crate) fn entries(&self) -> Vec<LogEntry> {
        self.entries.clone()
    }
}

fn sign(content: Operation, key: &TestKey) -> SignedOperation {
    let bytes = serde_ipld_dagcbor::to_vec(&content).expect("operation content always encodes");
    let sig = Base64UrlUnpadded::encode_string(&key.sign(&bytes));
    SignedOperation { content, sig }
}
