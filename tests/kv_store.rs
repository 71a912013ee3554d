//! End-to-end tests exercising `DB` through its public API: no
//! `pub(crate)` internals, just `open`/`view`/`update` and `Bucket`.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::thread;

use barrowdb::{Error, Options, DB};
use tempfile::NamedTempFile;

fn open_temp() -> (NamedTempFile, DB) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = DB::open(temp_file.path()).unwrap();
    (temp_file, db)
}

#[test]
fn put_get_round_trip() {
    let (_tmp, db) = open_temp();

    db.update(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"foo", b"bar")?;
        bucket.put(b"baz", b"qux")
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        assert_eq!(bucket.get(b"foo").as_deref(), Some(&b"bar"[..]));
        assert_eq!(bucket.get(b"baz").as_deref(), Some(&b"qux"[..]));
        assert_eq!(bucket.get(b"missing"), None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_removes_key() {
    let (_tmp, db) = open_temp();

    db.update(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"foo", b"bar")
    })
    .unwrap();

    db.update(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        bucket.delete(b"foo")
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        assert_eq!(bucket.get(b"foo"), None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn update_rolls_back_on_error() {
    let (_tmp, db) = open_temp();

    db.update(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"foo", b"bar")
    })
    .unwrap();

    let result: Result<(), Error> = db.update(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        bucket.put(b"foo", b"overwritten")?;
        Err(Error::CheckFailed("abort this transaction".into()))
    });
    assert!(result.is_err());

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        assert_eq!(bucket.get(b"foo").as_deref(), Some(&b"bar"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn nested_buckets() {
    let (_tmp, db) = open_temp();

    db.update(|tx| {
        let top = tx.create_bucket(b"accounts")?;
        let nested = top.create_bucket(b"alice")?;
        nested.put(b"balance", b"100")
    })
    .unwrap();

    db.view(|tx| {
        let top = tx.bucket(b"accounts")?;
        let nested = top.bucket(b"alice")?;
        assert_eq!(nested.get(b"balance").as_deref(), Some(&b"100"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_walks_keys_in_order() {
    let (_tmp, db) = open_temp();

    db.update(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        for (k, v) in [("c", "3"), ("a", "1"), ("b", "2")] {
            bucket.put(k.as_bytes(), v.as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        let mut cursor = bucket.cursor();
        let mut seen = Vec::new();
        let mut item = cursor.first();
        while let Some((k, v, _)) = item {
            seen.push((k, v));
            item = cursor.next();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_seek_lands_on_first_key_at_or_after() {
    let (_tmp, db) = open_temp();

    db.update(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        for k in ["apple", "cherry", "grape"] {
            bucket.put(k.as_bytes(), b"1")?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        let mut cursor = bucket.cursor();
        let (k, _, _) = cursor.seek(b"banana").unwrap();
        assert_eq!(k, b"cherry");
        Ok(())
    })
    .unwrap();
}

#[test]
fn split_and_reopen_preserves_many_keys() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();

    {
        let db = DB::open(&path).unwrap();
        db.update(|tx| {
            let bucket = tx.create_bucket(b"widgets")?;
            for i in 0..2000u32 {
                let key = format!("key-{i:06}");
                bucket.put(key.as_bytes(), format!("value-{i}").as_bytes())?;
            }
            Ok(())
        })
        .unwrap();
    }

    let db = DB::open(&path).unwrap();
    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        for i in [0u32, 500, 1000, 1999] {
            let key = format!("key-{i:06}");
            assert_eq!(
                bucket.get(key.as_bytes()).as_deref(),
                Some(format!("value-{i}").as_bytes())
            );
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn readers_see_a_stable_snapshot_during_a_write() {
    let (_tmp, db) = open_temp();

    db.update(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"foo", b"v1")
    })
    .unwrap();

    let reader = db.begin().unwrap();

    db.update(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        bucket.put(b"foo", b"v2")
    })
    .unwrap();

    let bucket = reader.bucket(b"widgets").unwrap();
    assert_eq!(bucket.get(b"foo").as_deref(), Some(&b"v1"[..]));
    reader.rollback().unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        assert_eq!(bucket.get(b"foo").as_deref(), Some(&b"v2"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn concurrent_readers_and_a_writer_do_not_deadlock() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Arc::new(DB::open(temp_file.path()).unwrap());

    db.update(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"foo", b"v0")
    })
    .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = db.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..20 {
                db.view(|tx| {
                    let bucket = tx.bucket(b"widgets")?;
                    assert!(bucket.get(b"foo").is_some());
                    Ok(())
                })
                .unwrap();
            }
        }));
    }

    let writer_db = db.clone();
    handles.push(thread::spawn(move || {
        for i in 0..20 {
            writer_db
                .update(|tx| {
                    let bucket = tx.bucket(b"widgets")?;
                    bucket.put(b"foo", format!("v{i}").as_bytes())
                })
                .unwrap();
        }
    }));

    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn freelist_reclaims_pages_after_delete() {
    let (temp_file, db) = open_temp();

    db.update(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        for i in 0..500u32 {
            bucket.put(format!("k{i}").as_bytes(), vec![0u8; 200].as_slice())?;
        }
        Ok(())
    })
    .unwrap();

    let mut pgid_high_after_insert = 0;
    db.view(|tx| {
        pgid_high_after_insert = tx.size();
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        for i in 0..500u32 {
            bucket.delete(format!("k{i}").as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    drop(db);
    let db = DB::open(temp_file.path()).unwrap();

    db.update(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        for i in 500..600u32 {
            bucket.put(format!("k{i}").as_bytes(), vec![0u8; 200].as_slice())?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        assert_eq!(bucket.get(b"k550").as_deref(), Some(&vec![0u8; 200][..]));
        Ok(())
    })
    .unwrap();

    // Re-inserting fewer rows than were deleted must reuse freed pages
    // rather than push the high-water page id past where the first,
    // larger insert left it — the real claim freelist reuse makes,
    // checked across a reopen so it isn't just reusing in-memory
    // transaction state.
    let mut pgid_high_after_reuse = 0;
    db.view(|tx| {
        pgid_high_after_reuse = tx.size();
        Ok(())
    })
    .unwrap();
    assert!(pgid_high_after_reuse <= pgid_high_after_insert);
}

#[test]
fn batch_coalesces_concurrent_callers_into_few_commits() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut opts = Options::default();
    opts.max_batch_size = 100;
    opts.max_batch_delay = std::time::Duration::from_millis(50);
    let db = Arc::new(DB::open_with(temp_file.path(), opts).unwrap());

    db.update(|tx| tx.create_bucket(b"widgets").map(|_| ())).unwrap();

    let tx_n_before = db.stats().tx_n;

    let mut handles = Vec::new();
    for i in 0..100u32 {
        let db = db.clone();
        handles.push(thread::spawn(move || {
            db.batch(move |tx| {
                let bucket = tx.bucket(b"widgets")?;
                bucket.put(format!("k{i}").as_bytes(), b"v")
            })
            .unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        for i in 0..100u32 {
            assert_eq!(bucket.get(format!("k{i}").as_bytes()).as_deref(), Some(&b"v"[..]));
        }
        Ok(())
    })
    .unwrap();

    // 100 concurrent callers coalesced into far fewer than 100 commits.
    let commits = db.stats().tx_n - tx_n_before;
    assert!(commits < 100, "expected coalescing, got {commits} commits for 100 callers");
}

#[test]
fn batch_retries_solo_when_one_caller_errs() {
    let (_tmp, db) = open_temp();
    db.update(|tx| tx.create_bucket(b"widgets").map(|_| ())).unwrap();

    let good = db.batch(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        bucket.put(b"ok", b"1")
    });
    let bad = db.batch(|_tx| Err(Error::BucketNotFound));

    assert!(good.is_ok());
    assert!(bad.is_err());

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        assert_eq!(bucket.get(b"ok").as_deref(), Some(&b"1"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn crash_between_data_sync_and_meta_sync_recovers_pre_commit_state() {
    // The commit protocol fsyncs dirty data pages, then overwrites and
    // fsyncs one of the two fixed meta pages (spec.md's "four syncs").
    // A crash between those two syncs loses the meta update but keeps
    // the already-synced data pages on disk. Simulated here by
    // snapshotting the meta region after one commit, letting a second
    // commit run to completion, then reverting just that region —
    // exactly what a lost meta write would leave behind.
    let (temp_file, db) = open_temp();

    db.update(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"k", b"v1")
    })
    .unwrap();

    let page_size = db.info().page_size;
    let mut meta_region = vec![0u8; page_size * 2];
    {
        let mut file = OpenOptions::new().read(true).open(temp_file.path()).unwrap();
        file.read_exact(&mut meta_region).unwrap();
    }

    db.update(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        bucket.put(b"k", b"v2")
    })
    .unwrap();

    drop(db);
    {
        let mut file = OpenOptions::new().write(true).open(temp_file.path()).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&meta_region).unwrap();
        file.sync_all().unwrap();
    }

    let db = DB::open(temp_file.path()).unwrap();
    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        assert_eq!(bucket.get(b"k").as_deref(), Some(&b"v1"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn read_only_open_rejects_writes() {
    let temp_file = NamedTempFile::new().unwrap();
    {
        let db = DB::open(temp_file.path()).unwrap();
        db.update(|tx| {
            let bucket = tx.create_bucket(b"widgets")?;
            bucket.put(b"foo", b"bar")
        })
        .unwrap();
    }

    let mut opts = Options::default();
    opts.read_only = true;
    let db = DB::open_with(temp_file.path(), opts).unwrap();

    assert!(matches!(db.begin_rw(), Err(Error::DatabaseReadOnly)));

    db.view(|tx| {
        let bucket = tx.bucket(b"widgets")?;
        assert_eq!(bucket.get(b"foo").as_deref(), Some(&b"bar"[..]));
        Ok(())
    })
    .unwrap();
}
