use std::fmt;

use atrium_api::types::string::{Cid, Did};

use super::{crypto, did_for, normalize, operation_prev, Operation, PlcData, SignedOperation, State};
use crate::plc::LogEntry;

const RECOVERY_WINDOW_MS: i64 = 72 * 3600 * 1000;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Error {
    MisorderedOperation,
    InvalidSignature { op: SignedOperation },
    GenesisHash { expected: Did },
    ImproperOperation { message: String, op: SignedOperation },
    LateRecovery { elapsed_ms: i64 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MisorderedOperation => write!(
                f,
                "operation does not chain onto the confirmed history, or extends past a tombstone"
            ),
            Error::InvalidSignature { op } => write!(
                f,
                "signature on operation {} does not verify under any allowed rotation key",
                op.cid().as_ref()
            ),
            Error::GenesisHash { expected } => write!(
                f,
                "genesis operation hash does not match its DID; expected {}",
                expected.as_str()
            ),
            Error::ImproperOperation { message, op } => {
                write!(f, "improper operation {}: {}", op.cid().as_ref(), message)
            }
            Error::LateRecovery { elapsed_ms } => write!(
                f,
                "recovery operation arrived {elapsed_ms}ms after the operation it nullifies, past the 72-hour window"
            ),
        }
    }
}

impl std::error::Error for Error {}

pub(crate) struct StepResult {
    pub(crate) nullified: Vec<Cid>,
    pub(crate) prev: Option<Cid>,
    pub(crate) ops: Vec<LogEntry>,
}

/// Given the confirmed prefix and a proposed next operation, decides
/// whether to accept it outright, accept it as a recovery fork that
/// nullifies part of the tail, or reject it.
pub(crate) fn step(
    did: &Did,
    confirmed: &[LogEntry],
    proposed: LogEntry,
) -> Result<StepResult, Error> {
    if confirmed.is_empty() {
        assure_valid_genesis(did, &proposed)?;
        return Ok(StepResult {
            nullified: Vec::new(),
            prev: None,
            ops: vec![proposed],
        });
    }

    let prev_cid = operation_prev(&proposed.operation.content).ok_or(Error::MisorderedOperation)?;

    let idx = confirmed
        .iter()
        .position(|entry| entry.cid == prev_cid)
        .ok_or(Error::MisorderedOperation)?;

    let head = &confirmed[idx];
    if matches!(head.operation.content, Operation::Tombstone(_)) {
        return Err(Error::MisorderedOperation);
    }

    let allowed_keys = normalize(&head.operation.content)
        .expect("head is not a tombstone")
        .rotation_keys;

    let tail = &confirmed[idx + 1..];

    if tail.is_empty() {
        crypto::verify_sig(&allowed_keys, &proposed.operation)?;

        let mut ops = confirmed.to_vec();
        ops.push(proposed);

        Ok(StepResult {
            nullified: Vec::new(),
            prev: Some(prev_cid),
            ops,
        })
    } else {
        let first_nullified = &tail[0];
        let disputed_signer = crypto::verify_sig(&allowed_keys, &first_nullified.operation)?;

        let power_index = allowed_keys
            .iter()
            .position(|key| key == &disputed_signer)
            .unwrap_or(allowed_keys.len());
        let more_powerful = &allowed_keys[..power_index];

        crypto::verify_sig(more_powerful, &proposed.operation)?;

        let elapsed_ms = proposed
            .created_at
            .as_ref()
            .signed_duration_since(*first_nullified.created_at.as_ref())
            .num_milliseconds();

        if elapsed_ms > RECOVERY_WINDOW_MS {
            return Err(Error::LateRecovery { elapsed_ms });
        }

        let nullified = tail.iter().map(|entry| entry.cid.clone()).collect();

        let mut ops: Vec<LogEntry> = confirmed[..=idx].to_vec();
        ops.push(proposed);

        Ok(StepResult {
            nullified,
            prev: Some(prev_cid),
            ops,
        })
    }
}

fn assure_valid_genesis(did: &Did, proposed: &LogEntry) -> Result<(), Error> {
    if matches!(proposed.operation.content, Operation::Tombstone(_)) {
        return Err(Error::MisorderedOperation);
    }

    let allowed_keys = normalize(&proposed.operation.content)
        .expect("not a tombstone")
        .rotation_keys;

    crypto::verify_sig(&allowed_keys, &proposed.operation)?;

    let expected = did_for(&proposed.operation);
    if &expected != did {
        return Err(Error::GenesisHash { expected });
    }

    if operation_prev(&proposed.operation.content).is_some() {
        return Err(Error::ImproperOperation {
            message: "genesis operation must not reference a previous operation".into(),
            op: proposed.operation.clone(),
        });
    }

    Ok(())
}

/// Folds `step` across a full operation sequence, producing the final
/// document or error. `ops` must be non-empty; callers are responsible
/// for treating "no stored entries" as not-registered before calling in.
pub(crate) fn validate_log(did: &Did, ops: Vec<LogEntry>) -> Result<Option<PlcData>, Error> {
    let mut history: Vec<LogEntry> = Vec::new();

    for op in ops {
        history = step(did, &history, op)?.ops;
    }

    let last = history
        .last()
        .expect("caller guarantees at least one operation");

    match &last.operation.content {
        Operation::Tombstone(_) => Ok(None),
        content => Ok(Some(normalize(content).expect("not a tombstone"))),
    }
}

pub(crate) fn resolve(did: Did, ops: Vec<LogEntry>) -> Result<Option<State>, Error> {
    Ok(validate_log(&did, ops)?.map(|plc| State { did, plc }))
}
