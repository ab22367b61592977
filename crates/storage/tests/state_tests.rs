//! Integration tests driving a persistent state through the `State`
//! trait, the way the overlay consumes it.

use amber_common::types::{BalanceUpdate, CodeUpdate, NonceUpdate, SlotUpdate, Update};
use amber_common::{Address, Balance, Bytes, Key, Value};
use amber_storage::{open_state, ArchiveConfig, Options, Schema, State};
use std::sync::Arc;
use tempdir::TempDir;
use tokio_util::sync::CancellationToken;

fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

fn key(byte: u8) -> Key {
    Key::repeat_byte(byte)
}

fn populate(state: &Arc<amber_storage::SyncState>) {
    let update = Update {
        created_accounts: vec![addr(1), addr(2)],
        balances: vec![
            BalanceUpdate {
                address: addr(1),
                balance: Balance::from(100u64),
            },
            BalanceUpdate {
                address: addr(2),
                balance: Balance::from(200u64),
            },
        ],
        nonces: vec![NonceUpdate {
            address: addr(1),
            nonce: 9,
        }],
        codes: vec![CodeUpdate {
            address: addr(2),
            code: Bytes::from_static(&[0xDE, 0xAD]),
        }],
        slots: vec![
            SlotUpdate {
                address: addr(1),
                key: key(1),
                value: Value::repeat_byte(0xEE),
            },
            SlotUpdate {
                address: addr(1),
                key: key(2),
                value: Value::repeat_byte(0xFF),
            },
        ],
        ..Default::default()
    };
    state.apply(1, update).unwrap();
}

#[test]
fn hash_is_stable_across_flush_and_reopen() {
    let dir = TempDir::new("state").unwrap();
    let root = {
        let state = open_state(dir.path(), Options::default()).unwrap();
        populate(&state);
        let root = state.hash().unwrap();
        state.flush().unwrap();
        state.close().unwrap();
        root
    };
    let state = open_state(dir.path(), Options::default()).unwrap();
    assert_eq!(state.hash().unwrap(), root);
    assert_eq!(state.balance(&addr(2)).unwrap(), Balance::from(200u64));
    assert_eq!(state.nonce(&addr(1)).unwrap(), 9);
    assert_eq!(
        state.storage(&addr(1), &key(2)).unwrap(),
        Value::repeat_byte(0xFF)
    );
    assert_eq!(state.code(&addr(2)).unwrap(), Bytes::from_static(&[0xDE, 0xAD]));
    state.close().unwrap();
}

#[test]
fn snapshot_round_trips_through_the_trait() {
    let dir = TempDir::new("state").unwrap();
    let state = open_state(dir.path(), Options::default()).unwrap();
    populate(&state);
    let root = state.hash().unwrap();

    let snapshot = state.create_snapshot().unwrap();
    state.verify_snapshot(&snapshot).unwrap();
    assert_eq!(state.proof().unwrap(), snapshot.proof);

    let dir2 = TempDir::new("state").unwrap();
    let restored = open_state(dir2.path(), Options::default()).unwrap();
    restored.restore(&snapshot).unwrap();
    assert_eq!(restored.hash().unwrap(), root);
    assert_eq!(restored.balance(&addr(1)).unwrap(), Balance::from(100u64));
    state.close().unwrap();
    restored.close().unwrap();
}

#[test]
fn export_streams_the_archived_state() {
    let dir = TempDir::new("state").unwrap();
    let state = open_state(dir.path(), Options::default()).unwrap();
    populate(&state);
    state.flush().unwrap();

    let token = CancellationToken::new();
    let mut out = Vec::new();
    state.export(1, &mut out, &token).unwrap();
    assert!(!out.is_empty());

    // the first 8 bytes carry the exported account count
    let mut count = [0u8; 8];
    count.copy_from_slice(&out[..8]);
    assert_eq!(u64::from_be_bytes(count), 2);
    state.close().unwrap();
}

#[test]
fn updates_out_of_canonical_order_are_normalized() {
    let dir = TempDir::new("state").unwrap();
    let state = open_state(dir.path(), Options::default()).unwrap();
    let update = Update {
        created_accounts: vec![addr(9), addr(1)],
        ..Default::default()
    };
    state.apply(1, update).unwrap();
    assert!(state.exists(&addr(1)).unwrap());
    assert!(state.exists(&addr(9)).unwrap());
    state.close().unwrap();
}

#[test]
fn duplicate_update_entries_are_rejected() {
    let dir = TempDir::new("state").unwrap();
    let state = open_state(dir.path(), Options::default()).unwrap();
    let update = Update {
        created_accounts: vec![addr(1), addr(1)],
        ..Default::default()
    };
    assert!(state.apply(1, update).is_err());
    state.close().unwrap();
}

#[test]
fn archive_free_state_still_serves_live_reads() {
    let dir = TempDir::new("state").unwrap();
    let state = open_state(
        dir.path(),
        Options {
            schema: Schema::Composed,
            archive: ArchiveConfig::None,
            ..Default::default()
        },
    )
    .unwrap();
    populate(&state);
    assert_eq!(state.balance(&addr(1)).unwrap(), Balance::from(100u64));
    assert!(state.archive_state(1).is_err());
    state.close().unwrap();
}

#[test]
fn closing_twice_is_idempotent_and_blocks_further_commits() {
    let dir = TempDir::new("state").unwrap();
    let state = open_state(dir.path(), Options::default()).unwrap();
    populate(&state);
    state.close().unwrap();
    state.close().unwrap();
    let update = Update {
        created_accounts: vec![addr(3)],
        ..Default::default()
    };
    assert!(state.apply(2, update).is_err());
}
