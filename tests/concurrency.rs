//! Multi-threaded transaction behavior through the public API.

use std::sync::{Arc, Barrier};
use std::thread;

use pinedb::{Database, DbError, TableId};
use tempfile::TempDir;

const BALANCE_LEN: usize = 56;

fn encode_balance(amount: u64) -> Vec<u8> {
    let mut value = vec![0u8; BALANCE_LEN];
    value[..8].copy_from_slice(&amount.to_le_bytes());
    value
}

fn decode_balance(value: &[u8]) -> u64 {
    u64::from_le_bytes(value[..8].try_into().unwrap())
}

fn balance(db: &Database, table: TableId, key: i64) -> u64 {
    let trx = db.begin().unwrap();
    let value = db.find(table, key, trx).unwrap().unwrap();
    db.commit(trx).unwrap();
    decode_balance(&value)
}

#[test]
fn test_transfers_conserve_total() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::new(dir.path(), 16).unwrap());
    let table = db.open_table(&dir.path().join("bank.db")).unwrap();
    db.insert(table, 1, &encode_balance(1000)).unwrap();
    db.insert(table, 2, &encode_balance(1000)).unwrap();

    let threads = 4;
    let transfers_each = 25;
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let mut done = 0;
                while done < transfers_each {
                    // Deadlock aborts the transaction; start over with a
                    // fresh id.
                    match transfer(&db, table, 1, 2, 1) {
                        Ok(()) => done += 1,
                        Err(DbError::Deadlock(_)) => {}
                        Err(err) => panic!("transfer failed: {err}"),
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let moved = (threads * transfers_each) as u64;
    assert_eq!(balance(&db, table, 1), 1000 - moved);
    assert_eq!(balance(&db, table, 2), 1000 + moved);
}

fn transfer(db: &Database, table: TableId, from: i64, to: i64, amount: u64) -> Result<(), DbError> {
    let trx = db.begin()?;
    // Touch records in key order; contention can still deadlock on shared
    // lock upgrades, which the caller retries.
    let run = (|| {
        let source = db
            .find(table, from, trx)?
            .map(|v| decode_balance(&v))
            .ok_or(DbError::KeyNotFound(from))?;
        let dest = db
            .find(table, to, trx)?
            .map(|v| decode_balance(&v))
            .ok_or(DbError::KeyNotFound(to))?;
        db.update(table, from, &encode_balance(source - amount), trx)?;
        db.update(table, to, &encode_balance(dest + amount), trx)?;
        Ok(())
    })();
    match run {
        Ok(()) => db.commit(trx),
        // The engine already aborted us to break the cycle.
        Err(DbError::Deadlock(victim)) => Err(DbError::Deadlock(victim)),
        Err(err) => {
            db.abort(trx)?;
            Err(err)
        }
    }
}

#[test]
fn test_opposite_order_writers_deadlock_once() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::new(dir.path(), 16).unwrap());
    let table = db.open_table(&dir.path().join("t.db")).unwrap();
    db.insert(table, 1, &encode_balance(10)).unwrap();
    db.insert(table, 2, &encode_balance(20)).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let spawn = |first: i64, second: i64, tag: u64| {
        let db = Arc::clone(&db);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || -> Result<(), DbError> {
            let trx = db.begin()?;
            db.update(table, first, &encode_balance(tag), trx)?;
            barrier.wait();
            db.update(table, second, &encode_balance(tag), trx)?;
            db.commit(trx)?;
            Ok(())
        })
    };
    let forward = spawn(1, 2, 100);
    let backward = spawn(2, 1, 200);
    let results = [forward.join().unwrap(), backward.join().unwrap()];

    let deadlocks = results
        .iter()
        .filter(|r| matches!(r, Err(DbError::Deadlock(_))))
        .count();
    assert_eq!(deadlocks, 1, "exactly one writer is the victim");

    // The survivor's writes are intact; the victim left no trace.
    let winner_tag = if results[0].is_ok() { 100 } else { 200 };
    assert_eq!(balance(&db, table, 1), winner_tag);
    assert_eq!(balance(&db, table, 2), winner_tag);
}

#[test]
fn test_readers_share_a_record() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::new(dir.path(), 8).unwrap());
    let table = db.open_table(&dir.path().join("t.db")).unwrap();
    db.insert(table, 1, &encode_balance(42)).unwrap();

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let trx = db.begin().unwrap();
                let got = db.find(table, 1, trx).unwrap().unwrap();
                assert_eq!(decode_balance(&got), 42);
                // All four hold their shared locks at the same time.
                barrier.wait();
                db.commit(trx).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_reader_waits_out_a_writer() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::new(dir.path(), 8).unwrap());
    let table = db.open_table(&dir.path().join("t.db")).unwrap();
    db.insert(table, 1, &encode_balance(5)).unwrap();

    let writer = db.begin().unwrap();
    db.update(table, 1, &encode_balance(6), writer).unwrap();

    let reader_db = Arc::clone(&db);
    let reader = thread::spawn(move || {
        let trx = reader_db.begin().unwrap();
        let got = reader_db.find(table, 1, trx).unwrap().unwrap();
        reader_db.commit(trx).unwrap();
        decode_balance(&got)
    });

    // The reader blocks behind the stamped writer until commit.
    thread::sleep(std::time::Duration::from_millis(50));
    db.commit(writer).unwrap();
    assert_eq!(reader.join().unwrap(), 6);
}
