//! End-to-end scenarios exercising the public API against a real
//! temporary store directory.

use std::io::Write;

use possum::{Handle, Limits};

fn open_tmp() -> (tempfile::TempDir, Handle) {
    let dir = tempfile::tempdir().unwrap();
    let handle = Handle::open(dir.path()).unwrap();
    (dir, handle)
}

#[test]
fn write_then_read_back() {
    let (_dir, handle) = open_tmp();
    let n = handle.single_write(b"a", b"hello").unwrap();
    assert_eq!(n, 5);

    let mut buf = [0u8; 10];
    let read = handle.single_read_at(b"a", &mut buf, 0).unwrap();
    assert_eq!(&buf[..read], b"hello");
}

#[test]
fn reader_sees_a_consistent_snapshot_across_a_commit() {
    let (_dir, handle) = open_tmp();

    let mut reader = handle.new_reader();
    reader.begin().unwrap();
    assert!(reader.list_items(b"p/").unwrap().is_empty());

    let mut writer = handle.new_writer();
    let mut v1 = writer.start_new_value().unwrap();
    v1.write_all(b"A").unwrap();
    writer.stage(b"p/1".to_vec(), v1);
    let mut v2 = writer.start_new_value().unwrap();
    v2.write_all(b"BB").unwrap();
    writer.stage(b"p/2".to_vec(), v2);
    writer.commit().unwrap();

    // The reader began before the commit landed, so its held snapshot
    // transaction still reports the pre-commit state.
    assert!(reader.list_items(b"p/").unwrap().is_empty());
    drop(reader);

    let mut reader2 = handle.new_reader();
    reader2.begin().unwrap();
    let items = reader2.list_items(b"p/").unwrap();
    let sizes: Vec<(String, u64)> = items
        .into_iter()
        .map(|i| (String::from_utf8(i.key).unwrap(), i.stat.size))
        .collect();
    assert_eq!(
        sizes,
        vec![("p/1".to_string(), 1), ("p/2".to_string(), 2)]
    );
}

#[test]
fn snapshot_keeps_value_readable_after_concurrent_delete() {
    let (_dir, handle) = open_tmp();
    handle.single_write(b"k", b"DATA").unwrap();

    let mut reader = handle.new_reader();
    let value = reader.add(b"k".to_vec());
    reader.begin().unwrap();

    handle.single_delete(b"k").unwrap();

    let mut buf = [0u8; 4];
    let n = value.read_at(&mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"DATA");

    drop(value);
    reader.end();
    handle.cleanup_snapshots().unwrap();

    assert!(handle.single_stat(b"k").unwrap().is_none());
}

#[test]
fn eviction_removes_oldest_entry_first() {
    let (_dir, handle) = open_tmp();
    handle
        .set_limits(Limits {
            max_value_length_sum: 10,
            disable_hole_punching: false,
        })
        .unwrap();

    handle.single_write(b"a", b"aaaa").unwrap();
    handle.single_write(b"b", b"bbbb").unwrap();
    handle.single_write(b"c", b"cccc").unwrap();

    assert!(handle.single_stat(b"a").unwrap().is_none());
    assert!(handle.single_stat(b"b").unwrap().is_some());
    assert!(handle.single_stat(b"c").unwrap().is_some());

    let live: u64 = [b"a".as_slice(), b"b", b"c"]
        .iter()
        .filter_map(|k| handle.single_stat(k).ok().flatten())
        .map(|s| s.size)
        .sum();
    assert_eq!(live, 8);
}

#[test]
fn rename_clones_bytes_and_removes_the_source_key() {
    let (_dir, handle) = open_tmp();

    let payload = vec![7u8; 1 << 20];
    let mut writer = handle.new_writer();
    let mut vw = writer.start_new_value().unwrap();
    vw.write_all(&payload).unwrap();
    writer.stage(b"x".to_vec(), vw);
    writer.commit().unwrap();

    let mut reader = handle.new_reader();
    let x = reader.add(b"x".to_vec());
    reader.begin().unwrap();

    let mut writer = handle.new_writer();
    writer.rename(&x, b"y".to_vec()).unwrap();
    writer.commit().unwrap();
    drop(x);
    reader.end();

    assert!(handle.single_stat(b"x").unwrap().is_none());
    let y_stat = handle.single_stat(b"y").unwrap().unwrap();
    assert_eq!(y_stat.size, payload.len() as u64);

    let mut buf = vec![0u8; payload.len()];
    let mut offset = 0usize;
    while offset < buf.len() {
        let n = handle
            .single_read_at(b"y", &mut buf[offset..], offset as u64)
            .unwrap();
        if n == 0 {
            break;
        }
        offset += n;
    }
    assert_eq!(buf, payload);
}

#[test]
fn move_prefix_rewrites_keys_and_preserves_values() {
    let (_dir, handle) = open_tmp();
    handle.single_write(b"old/a", b"1").unwrap();
    handle.single_write(b"old/b", b"2").unwrap();
    handle.single_write(b"other", b"3").unwrap();

    handle.move_prefix(b"old/", b"new/").unwrap();

    assert!(handle.single_stat(b"old/a").unwrap().is_none());
    assert!(handle.single_stat(b"old/b").unwrap().is_none());

    let mut buf = [0u8; 1];
    handle.single_read_at(b"new/a", &mut buf, 0).unwrap();
    assert_eq!(&buf, b"1");
    handle.single_read_at(b"new/b", &mut buf, 0).unwrap();
    assert_eq!(&buf, b"2");
    assert!(handle.single_stat(b"other").unwrap().is_some());
}

#[test]
fn reader_begin_fails_hard_on_a_missing_key() {
    let (_dir, handle) = open_tmp();
    let mut reader = handle.new_reader();
    reader.add(b"missing".to_vec());
    let err = reader.begin().unwrap_err();
    assert!(matches!(err, possum::Error::NoSuchKey));
}

#[test]
fn delete_prefix_removes_every_matching_key() {
    let (_dir, handle) = open_tmp();
    handle.single_write(b"p/1", b"a").unwrap();
    handle.single_write(b"p/2", b"b").unwrap();
    handle.single_write(b"q/1", b"c").unwrap();

    let n = handle.delete_prefix(b"p/").unwrap();
    assert_eq!(n, 2);
    assert!(handle.single_stat(b"p/1").unwrap().is_none());
    assert!(handle.single_stat(b"q/1").unwrap().is_some());
}
