use super::testing::{at_offset, rotation_only, TestKey, TestLog};
use super::{cid_from_string, cid_to_string, did_for, normalize, validate_log, Error};

#[test]
fn s1_linear_extension() {
    let genesis_key = TestKey::generate();
    let data = rotation_only(vec![genesis_key.did_key()]);
    let mut log = TestLog::genesis(data, &genesis_key, at_offset(0));

    let mut next_data = rotation_only(vec![genesis_key.did_key()]);
    next_data.also_known_as = vec!["at://alice.example.com".into()];
    log.push_change(next_data.clone(), &genesis_key, at_offset(1000));

    let document = validate_log(log.did(), log.entries())
        .expect("validates")
        .expect("not tombstoned");

    assert_eq!(document.also_known_as, next_data.also_known_as);
    assert_eq!(document.rotation_keys, vec![genesis_key.did_key()]);
}

#[test]
fn s2_bad_genesis_hash() {
    let genesis_key = TestKey::generate();
    let data = rotation_only(vec![genesis_key.did_key()]);
    let log = TestLog::genesis(data, &genesis_key, at_offset(0));

    let wrong_did = "did:plc:aaaaaaaaaaaaaaaaaaaaaaaa".parse().expect("valid did");
    let err = validate_log(&wrong_did, log.entries()).unwrap_err();

    match err {
        Error::GenesisHash { expected } => assert_eq!(&expected, log.did()),
        other => panic!("expected GenesisHash, got {other:?}"),
    }
}

#[test]
fn s3_recovery_within_window_nullifies_expected_entry() {
    let recovery_key = TestKey::generate();
    let signing_key = TestKey::generate();

    let data = rotation_only(vec![recovery_key.did_key(), signing_key.did_key()]);
    let mut log = TestLog::genesis(data, &recovery_key, at_offset(0));
    let genesis_cid = log.head_cid();

    let stale_data = rotation_only(vec![recovery_key.did_key(), signing_key.did_key()]);
    let stale_cid = log.push_change(stale_data, &signing_key, at_offset(0));

    let recovery_data = rotation_only(vec![recovery_key.did_key(), signing_key.did_key()]);
    let recovery_cid = log.push_change_after(
        genesis_cid.clone(),
        recovery_data,
        &recovery_key,
        at_offset(24 * 3600 * 1000),
    );

    let mut entries = log.entries();
    let recovery_op = entries.pop().expect("recovery op present");
    let confirmed = entries; // [genesis, stale]

    let result = super::step(log.did(), &confirmed, recovery_op).expect("recovery accepted");

    assert_eq!(result.nullified, vec![stale_cid]);
    assert_eq!(result.ops.len(), 2);
    assert_eq!(result.ops.last().expect("present").cid, recovery_cid);

    let document = validate_log(log.did(), log.entries())
        .expect("validates")
        .expect("not tombstoned");
    assert_eq!(document.rotation_keys.len(), 2);
}

#[test]
fn s4_late_recovery() {
    let recovery_key = TestKey::generate();
    let signing_key = TestKey::generate();

    let data = rotation_only(vec![recovery_key.did_key(), signing_key.did_key()]);
    let mut log = TestLog::genesis(data, &recovery_key, at_offset(0));
    let genesis_cid = log.head_cid();

    let stale_data = rotation_only(vec![recovery_key.did_key(), signing_key.did_key()]);
    log.push_change(stale_data, &signing_key, at_offset(0));

    let recovery_data = rotation_only(vec![recovery_key.did_key(), signing_key.did_key()]);
    let elapsed = 72 * 3600 * 1000 + 1;
    log.push_change_after(genesis_cid, recovery_data, &recovery_key, at_offset(elapsed));

    let err = validate_log(log.did(), log.entries()).unwrap_err();

    match err {
        Error::LateRecovery { elapsed_ms } => assert_eq!(elapsed_ms, elapsed),
        other => panic!("expected LateRecovery, got {other:?}"),
    }
}

#[test]
fn recovery_window_boundary_exactly_72h_is_accepted() {
    let recovery_key = TestKey::generate();
    let signing_key = TestKey::generate();

    let data = rotation_only(vec![recovery_key.did_key(), signing_key.did_key()]);
    let mut log = TestLog::genesis(data, &recovery_key, at_offset(0));
    let genesis_cid = log.head_cid();

    let stale_data = rotation_only(vec![recovery_key.did_key(), signing_key.did_key()]);
    log.push_change(stale_data, &signing_key, at_offset(0));

    let recovery_data = rotation_only(vec![recovery_key.did_key(), signing_key.did_key()]);
    log.push_change_after(
        genesis_cid,
        recovery_data,
        &recovery_key,
        at_offset(72 * 3600 * 1000),
    );

    validate_log(log.did(), log.entries())
        .expect("exactly 72h must be accepted")
        .expect("not tombstoned");
}

#[test]
fn s5_insufficient_power() {
    let recovery_key = TestKey::generate();
    let signing_key = TestKey::generate();

    let data = rotation_only(vec![recovery_key.did_key(), signing_key.did_key()]);
    let mut log = TestLog::genesis(data, &recovery_key, at_offset(0));
    let genesis_cid = log.head_cid();

    let a_data = rotation_only(vec![recovery_key.did_key(), signing_key.did_key()]);
    log.push_change(a_data, &recovery_key, at_offset(0));

    let b_data = rotation_only(vec![recovery_key.did_key(), signing_key.did_key()]);
    log.push_change_after(genesis_cid, b_data, &signing_key, at_offset(1000));

    let err = validate_log(log.did(), log.entries()).unwrap_err();
    assert!(matches!(err, Error::InvalidSignature { .. }));
}

#[test]
fn s6_extension_past_tombstone() {
    let key = TestKey::generate();
    let data = rotation_only(vec![key.did_key()]);
    let mut log = TestLog::genesis(data, &key, at_offset(0));
    let tombstone_cid = log.push_tombstone(&key, at_offset(1000));

    let more_data = rotation_only(vec![key.did_key()]);
    log.push_change_after(tombstone_cid, more_data, &key, at_offset(2000));

    let err = validate_log(log.did(), log.entries()).unwrap_err();
    assert!(matches!(err, Error::MisorderedOperation));
}

#[test]
fn tombstoned_log_resolves_to_no_document() {
    let key = TestKey::generate();
    let data = rotation_only(vec![key.did_key()]);
    let mut log = TestLog::genesis(data, &key, at_offset(0));
    log.push_tombstone(&key, at_offset(1000));

    let document = validate_log(log.did(), log.entries()).expect("validates");
    assert!(document.is_none());
}

#[test]
fn s7_v1_legacy_genesis() {
    use super::{LegacyCreateOp, Operation};

    let recovery_key = TestKey::generate();
    let signing_key = TestKey::generate();

    let content = Operation::LegacyCreate(LegacyCreateOp {
        signing_key: signing_key.did_key(),
        recovery_key: recovery_key.did_key(),
        handle: "alice.example.com".into(),
        service: "pds.example.com".into(),
        prev: (),
    });

    let log = TestLog::genesis_op(content, &recovery_key, at_offset(0));

    let document = validate_log(log.did(), log.entries())
        .expect("validates")
        .expect("not tombstoned");

    assert_eq!(document.also_known_as, vec!["at://alice.example.com".to_string()]);
    assert_eq!(
        document.rotation_keys,
        vec![recovery_key.did_key(), signing_key.did_key()]
    );
    let pds = document.services.get("atproto_pds").expect("present");
    assert_eq!(pds.endpoint, "https://pds.example.com");
}

#[test]
fn cid_string_roundtrip() {
    let key = TestKey::generate();
    let data = rotation_only(vec![key.did_key()]);
    let log = TestLog::genesis(data, &key, at_offset(0));

    let cid = log.head_cid();
    let round_tripped = cid_from_string(&cid_to_string(&cid)).expect("parses");
    assert_eq!(round_tripped, cid);
}

#[test]
fn cid_survives_cbor_round_trip() {
    let key = TestKey::generate();
    let data = rotation_only(vec![key.did_key()]);
    let log = TestLog::genesis(data, &key, at_offset(0));

    let op = &log.entries()[0].operation;
    let bytes = serde_ipld_dagcbor::to_vec(op).expect("encodes");
    let decoded: super::SignedOperation =
        serde_ipld_dagcbor::from_slice(&bytes).expect("decodes");

    assert_eq!(decoded.cid(), op.cid());
}

#[test]
fn normalization_is_idempotent() {
    let key = TestKey::generate();
    let data = rotation_only(vec![key.did_key()]);
    let log = TestLog::genesis(data, &key, at_offset(0));

    let content = &log.entries()[0].operation.content;
    let once = normalize(content).expect("not a tombstone");
    let reencoded = super::Operation::Change(super::ChangeOp {
        data: once.clone(),
        prev: None,
    });
    let twice = normalize(&reencoded).expect("not a tombstone");

    assert_eq!(once, twice);
}

#[test]
fn genesis_binding_holds_for_legitimate_logs() {
    let key = TestKey::generate();
    let data = rotation_only(vec![key.did_key()]);
    let log = TestLog::genesis(data, &key, at_offset(0));

    assert_eq!(did_for(&log.entries()[0].operation), *log.did());
}

#[test]
fn signature_ending_in_padding_is_rejected_before_crypto() {
    let key = TestKey::generate();
    let data = rotation_only(vec![key.did_key()]);
    let log = TestLog::genesis(data, &key, at_offset(0));

    let mut entries = log.entries();
    entries[0].operation.sig.push('=');

    let err = validate_log(log.did(), entries).unwrap_err();
    assert!(matches!(err, Error::InvalidSignature { .. }));
}

#[test]
#[should_panic]
fn empty_ops_is_a_caller_error() {
    let _ = validate_log(
        &"did:plc:aaaaaaaaaaaaaaaaaaaaaaaa".parse().expect("valid"),
        Vec::new(),
    );
}
