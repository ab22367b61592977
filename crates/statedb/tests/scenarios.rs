//! End-to-end scenarios driving the overlay, the live state and the
//! archive together.

use amber_common::constants::EMPTY_CODE_HASH;
use amber_common::{Address, Balance, Bytes, Key, Value};
use amber_statedb::StateDb;
use amber_storage::{open_state, Options, State};
use std::sync::Arc;
use tempdir::TempDir;

fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

fn open(dir: &TempDir) -> (StateDb, Arc<dyn State>) {
    let state = open_state(dir.path(), Options::default()).unwrap();
    (StateDb::new(state.clone()), state as Arc<dyn State>)
}

#[test]
fn maximum_balance_survives_a_round_trip() {
    let dir = TempDir::new("scenario").unwrap();
    let (mut db, state) = open(&dir);
    let address = addr(0x03);

    db.begin_block();
    db.begin_transaction();
    db.set_nonce(address, 1);
    db.add_balance(address, Balance::MAX);
    db.end_transaction();
    db.end_block(1).unwrap();
    assert_eq!(db.get_balance(address), Balance::MAX);

    db.begin_block();
    db.begin_transaction();
    db.sub_balance(address, Balance::MAX);
    db.end_transaction();
    db.end_block(2).unwrap();
    db.flush().unwrap();

    assert_eq!(db.get_balance(address), Balance::zero());
    let at_one = state.archive_state(1).unwrap();
    assert_eq!(at_one.balance(&address).unwrap(), Balance::MAX);
    let at_two = state.archive_state(2).unwrap();
    assert_eq!(at_two.balance(&address).unwrap(), Balance::zero());
    db.close().unwrap();
}

#[test]
fn a_populated_state_survives_close_and_reopen() {
    let dir = TempDir::new("scenario").unwrap();
    let address = addr(0x01);
    let code = Bytes::from_static(&[1, 2, 3]);

    {
        let (mut db, _) = open(&dir);
        db.begin_block();
        db.begin_transaction();
        db.create_account(address);
        db.add_balance(address, Balance::from(153u64));
        db.set_nonce(address, 58);
        db.set_code(address, code.clone());
        for i in 0u64..1000 {
            db.set_state(
                address,
                Key::from_low_u64_be(i),
                Value::from_low_u64_be(i),
            );
        }
        db.end_transaction();
        db.end_block(1).unwrap();
        db.flush().unwrap();
        db.close().unwrap();
    }

    let (mut db, state) = open(&dir);
    assert!(db.exist(address));
    assert_eq!(db.get_balance(address), Balance::from(153u64));
    assert_eq!(db.get_nonce(address), 58);
    assert_eq!(db.get_code(address), code);
    for i in 0u64..1000 {
        assert_eq!(
            db.get_state(address, Key::from_low_u64_be(i)),
            Value::from_low_u64_be(i),
            "slot {i} lost across reopen"
        );
    }

    let archived = state.archive_state(1).unwrap();
    assert_eq!(archived.balance(&address).unwrap(), Balance::from(153u64));
    assert_eq!(archived.nonce(&address).unwrap(), 58);
    assert_eq!(archived.code(&address).unwrap(), code);
    assert_eq!(
        archived
            .storage(&address, &Key::from_low_u64_be(999))
            .unwrap(),
        Value::from_low_u64_be(999)
    );
    db.close().unwrap();
}

#[test]
fn touched_empty_account_is_pruned_and_archived_as_absent() {
    let dir = TempDir::new("scenario").unwrap();
    let (mut db, state) = open(&dir);
    let address = addr(0x02);

    db.begin_block();
    db.begin_transaction();
    db.add_balance(address, Balance::from(1u64));
    db.sub_balance(address, Balance::from(1u64));
    db.end_transaction();
    db.end_block(5).unwrap();
    db.flush().unwrap();

    assert!(!db.exist(address));
    let archived = state.archive_state(5).unwrap();
    assert!(!archived.exists(&address).unwrap());
    db.close().unwrap();
}

#[test]
fn bulk_loads_interleave_with_regular_blocks() {
    let dir = TempDir::new("scenario").unwrap();
    let (mut db, _) = open(&dir);
    let address = addr(0x01);

    for i in 0u64..5 {
        let mut load = db.start_bulk_load(2 * i).unwrap();
        load.create_account(address);
        load.set_nonce(address, i);
        load.finish().unwrap();
        assert!(db.exist(address));
        assert_eq!(db.get_nonce(address), i);

        db.begin_block();
        db.begin_transaction();
        assert!(db.suicide(address));
        db.end_transaction();
        db.end_block(2 * i + 1).unwrap();
        assert!(!db.exist(address));
    }

    assert!(!db.exist(address));
    db.close().unwrap();
}

#[test]
fn recreating_an_account_preserves_values_but_clears_storage() {
    let dir = TempDir::new("scenario").unwrap();
    let (mut db, _) = open(&dir);
    let address = addr(0x05);
    let key = Key::repeat_byte(1);

    db.begin_block();
    db.begin_transaction();
    db.create_account(address);
    db.add_balance(address, Balance::from(10u64));
    db.set_nonce(address, 5);
    db.set_code(address, Bytes::from_static(&[0xAA]));
    db.set_state(address, key, Value::repeat_byte(9));
    db.end_transaction();
    db.end_block(1).unwrap();

    db.begin_block();
    db.begin_transaction();
    db.create_account(address);
    // within the block the stored value is already unreadable
    assert_eq!(db.get_state(address, key), Value::zero());
    db.end_transaction();
    db.end_block(2).unwrap();

    assert_eq!(db.get_balance(address), Balance::from(10u64));
    assert_eq!(db.get_nonce(address), 5);
    assert_eq!(db.get_code(address), Bytes::from_static(&[0xAA]));
    assert_eq!(db.get_state(address, key), Value::zero());
    db.close().unwrap();
}

#[test]
fn snapshot_rollback_restores_previous_code() {
    let dir = TempDir::new("scenario").unwrap();
    let (mut db, _) = open(&dir);
    let address = addr(0x06);

    db.begin_block();
    db.begin_transaction();
    db.set_code(address, Bytes::from_static(&[0xAC, 0xDC]));
    let snapshot = db.snapshot();
    db.set_code(address, Bytes::from_static(&[0x12, 0x34, 0x56]));
    assert_eq!(db.get_code_size(address), 3);
    db.revert_to_snapshot(snapshot);

    assert_eq!(db.get_code(address), Bytes::from_static(&[0xAC, 0xDC]));
    assert_eq!(db.get_code_size(address), 2);
    db.end_transaction();
    db.end_block(1).unwrap();
    db.close().unwrap();
}

#[test]
fn archive_and_live_agree_block_by_block() {
    let dir = TempDir::new("scenario").unwrap();
    let (mut db, state) = open(&dir);
    let address = addr(0x09);
    let mut live_balances = Vec::new();

    for block in 1u64..=10 {
        db.begin_block();
        db.begin_transaction();
        db.add_balance(address, Balance::from(block));
        db.end_transaction();
        db.end_block(block).unwrap();
        live_balances.push((block, db.get_balance(address)));
    }
    db.flush().unwrap();

    for (block, expected) in live_balances {
        let archived = state.archive_state(block).unwrap();
        assert_eq!(
            archived.balance(&address).unwrap(),
            expected,
            "archive disagrees with live history at block {block}"
        );
    }
    assert_eq!(state.archive_block_height().unwrap(), Some(10));
    db.close().unwrap();
}

#[test]
fn archive_state_db_serves_point_in_time_reads() {
    let dir = TempDir::new("scenario").unwrap();
    let (mut db, _) = open(&dir);
    let address = addr(0x0A);

    db.begin_block();
    db.begin_transaction();
    db.create_account(address);
    db.add_balance(address, Balance::from(42u64));
    db.set_code(address, Bytes::from_static(&[7]));
    db.end_transaction();
    db.end_block(1).unwrap();
    db.flush().unwrap();

    let mut at_one = db.get_archive_state_db(1).unwrap();
    assert!(at_one.exist(address));
    assert_eq!(at_one.get_balance(address), Balance::from(42u64));
    assert_eq!(at_one.get_code(address), Bytes::from_static(&[7]));
    assert_eq!(at_one.get_code_hash(address), amber_common::utils::keccak([7u8]));
    assert_eq!(at_one.get_code_hash(addr(0xBB)), amber_common::H256::zero());
    at_one.release();
    db.close().unwrap();
}

#[test]
fn witness_proofs_verify_against_the_archive_hash() {
    let dir = TempDir::new("scenario").unwrap();
    let (mut db, state) = open(&dir);
    let address = addr(0x0C);
    let key = Key::repeat_byte(3);

    db.begin_block();
    db.begin_transaction();
    db.create_account(address);
    db.add_balance(address, Balance::from(5u64));
    db.set_state(address, key, Value::repeat_byte(4));
    db.end_transaction();
    db.end_block(1).unwrap();
    db.flush().unwrap();

    let token = tokio_util::sync::CancellationToken::new();
    let proof = state
        .create_witness_proof(1, &address, &[key], &token)
        .unwrap();
    assert!(proof.exists);
    assert_eq!(proof.balance, Balance::from(5u64));
    assert_eq!(proof.slots, vec![(key, Value::repeat_byte(4))]);
    assert_eq!(proof.code_hash, EMPTY_CODE_HASH);

    let expected = state.archive_state(1).unwrap().hash().unwrap();
    assert!(proof.verify(expected));
    db.close().unwrap();
}
