//! Behavior every connector shares, run by each backend's tests.
//!
//! Connectors under test must be configured with a maximum blob size of
//! [`MAX_BLOB`] bytes.

use bytes::Bytes;

use super::Connector;
use crate::blob::Blob;
use crate::path::VirtualPath;

pub(crate) const MAX_BLOB: u64 = 4;

pub(crate) fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn ordinals(blobs: &[Blob]) -> Vec<u64> {
    blobs.iter().map(Blob::ordinal).collect()
}

async fn write(connector: &dyn Connector, file: &VirtualPath, data: &[u8]) {
    let written = connector
        .write_data(file, vec![Bytes::copy_from_slice(data)])
        .await
        .unwrap();
    assert_eq!(written, data.len() as u64);
}

async fn read_all(connector: &dyn Connector, file: &VirtualPath) -> Vec<u8> {
    let size = connector.file_size(file).await.unwrap();
    connector.read_data(file, 0, size).await.unwrap().to_vec()
}

/// Every contract check that leaves the connector open.
pub(crate) async fn run_all(connector: &dyn Connector, container: &str, compacting: bool) {
    round_trip(connector, container).await;
    partial_reads(connector, container).await;
    ordinal_monotonicity(connector, container).await;
    scattered_buffers(connector, container).await;
    partial_delete(connector, container, compacting).await;
    foreign_blobs_are_rejected(connector, container).await;
    deleting_every_blob_deletes_the_file(connector, container).await;
    truncation(connector, container).await;
    delete_file(connector, container).await;
    move_within_container(connector, container).await;
    copy_and_copy_range(connector, container).await;
    listing(connector, container).await;
    read_into(connector, container).await;
    writes_are_immediately_visible(connector, container).await;
    concurrent_writes_serialize(connector, container).await;
}

pub(crate) async fn round_trip(connector: &dyn Connector, container: &str) {
    let max = MAX_BLOB as usize;
    for len in [0, 1, max - 1, max, max + 1, 3 * max + 2] {
        let file = connector
            .resolve(&format!("{container}/roundtrip/file-{len}"))
            .unwrap();
        let data = payload(len);
        write(connector, &file, &data).await;

        assert_eq!(read_all(connector, &file).await, data, "len={len}");
        let blobs = connector.blobs(&file).await.unwrap();
        assert_eq!(blobs.len(), len.div_ceil(max), "len={len}");
        assert!(blobs.iter().all(|b| b.size() <= MAX_BLOB));
        assert_eq!(connector.file_exists(&file).await.unwrap(), len > 0);
    }
}

pub(crate) async fn partial_reads(connector: &dyn Connector, container: &str) {
    let file = connector.resolve(&format!("{container}/partial/file")).unwrap();
    let data = payload(5 * MAX_BLOB as usize);
    write(connector, &file, &data).await;

    // Within one blob, then straddling 1, 2 and 3 blob boundaries.
    for (offset, length) in [(1u64, 2u64), (3, 2), (2, 7), (3, 10), (0, 20), (19, 1), (20, 0)] {
        let got = connector.read_data(&file, offset, length).await.unwrap();
        let (start, end) = (offset as usize, (offset + length) as usize);
        assert_eq!(&got[..], &data[start..end], "offset={offset} length={length}");
    }

    let tail = connector.read_data(&file, 17, 100).await.unwrap();
    assert_eq!(&tail[..], &data[17..]);
    assert!(connector.read_data(&file, 25, 5).await.unwrap().is_empty());
}

pub(crate) async fn ordinal_monotonicity(connector: &dyn Connector, container: &str) {
    let file = connector.resolve(&format!("{container}/ordinals/file")).unwrap();
    let mut expected = Vec::new();
    for len in [3usize, 4, 9, 1] {
        let chunk = payload(len + expected.len());
        let chunk = &chunk[expected.len()..];
        write(connector, &file, chunk).await;
        expected.extend_from_slice(chunk);
        assert_eq!(
            connector.file_size(&file).await.unwrap(),
            expected.len() as u64
        );
    }

    let blobs = connector.blobs(&file).await.unwrap();
    let count = blobs.len() as u64;
    assert_eq!(ordinals(&blobs), (0..count).collect::<Vec<_>>());
    assert_eq!(read_all(connector, &file).await, expected);
}

pub(crate) async fn scattered_buffers(connector: &dyn Connector, container: &str) {
    let file = connector.resolve(&format!("{container}/scattered/file")).unwrap();
    let buffers = vec![
        Bytes::from_static(b"ab"),
        Bytes::new(),
        Bytes::from_static(b"cdefg"),
        Bytes::from_static(b"h"),
    ];
    let written = connector.write_data(&file, buffers).await.unwrap();
    assert_eq!(written, 8);
    assert_eq!(read_all(connector, &file).await, b"abcdefgh");
    assert_eq!(connector.blobs(&file).await.unwrap().len(), 2);
}

pub(crate) async fn partial_delete(connector: &dyn Connector, container: &str, compacting: bool) {
    let file = connector.resolve(&format!("{container}/compaction/file")).unwrap();
    let data = payload(5 * MAX_BLOB as usize);
    write(connector, &file, &data).await;
    let blobs = connector.blobs(&file).await.unwrap();
    assert_eq!(blobs.len(), 5);

    assert!(connector.delete_blobs(&file, &blobs[1..3]).await.unwrap());

    let max = MAX_BLOB as usize;
    let mut expected = data[..max].to_vec();
    expected.extend_from_slice(&data[3 * max..]);
    assert_eq!(connector.file_size(&file).await.unwrap(), expected.len() as u64);
    assert_eq!(read_all(connector, &file).await, expected);

    let remaining = connector.blobs(&file).await.unwrap();
    if compacting {
        assert_eq!(ordinals(&remaining), vec![0, 1, 2]);
    } else {
        assert_eq!(ordinals(&remaining), vec![0, 3, 4]);
    }

    // Appends continue after the highest surviving ordinal.
    write(connector, &file, b"zz").await;
    let after = connector.blobs(&file).await.unwrap();
    let last = after.last().unwrap().ordinal();
    assert_eq!(last, remaining.last().unwrap().ordinal() + 1);

    assert!(!connector.delete_blobs(&file, &[]).await.unwrap());
}

pub(crate) async fn foreign_blobs_are_rejected(connector: &dyn Connector, container: &str) {
    let a = connector.resolve(&format!("{container}/foreign/a")).unwrap();
    let b = connector.resolve(&format!("{container}/foreign/b")).unwrap();
    write(connector, &a, &payload(4)).await;
    write(connector, &b, &payload(8)).await;
    let blobs_of_a = connector.blobs(&a).await.unwrap();
    let blobs_of_b = connector.blobs(&b).await.unwrap();

    let err = connector.delete_blobs(&a, &blobs_of_b).await.unwrap_err();
    assert_eq!(err.code(), "InconsistentDelete");

    // One foreign blob spoils the whole batch.
    let mut mixed = blobs_of_a.clone();
    mixed.push(blobs_of_b[0].clone());
    let err = connector.delete_blobs(&a, &mixed).await.unwrap_err();
    assert_eq!(err.code(), "InconsistentDelete");

    assert_eq!(connector.file_size(&a).await.unwrap(), 4);
    assert_eq!(connector.file_size(&b).await.unwrap(), 8);
    assert_eq!(read_all(connector, &b).await, payload(8));
}

pub(crate) async fn deleting_every_blob_deletes_the_file(connector: &dyn Connector, container: &str) {
    let dir = connector.resolve(&format!("{container}/drained")).unwrap();
    let file = dir.child("f").unwrap();
    let kept = dir.child("kept").unwrap();
    write(connector, &file, &payload(10)).await;
    write(connector, &kept, b"k").await;

    let blobs = connector.blobs(&file).await.unwrap();
    assert!(connector.delete_blobs(&file, &blobs).await.unwrap());

    assert!(!connector.file_exists(&file).await.unwrap());
    assert_eq!(connector.file_size(&file).await.unwrap(), 0);
    let children = connector.list_children(&dir).await.unwrap();
    assert_eq!(children.files, vec!["kept".to_string()]);

    write(connector, &file, b"back").await;
    assert_eq!(read_all(connector, &file).await, b"back");
    let children = connector.list_children(&dir).await.unwrap();
    assert_eq!(children.files, vec!["f".to_string(), "kept".to_string()]);
}

pub(crate) async fn truncation(connector: &dyn Connector, container: &str) {
    let file = connector.resolve(&format!("{container}/truncate/file")).unwrap();
    let data = payload(10);
    write(connector, &file, &data).await;

    // On a blob boundary.
    connector.truncate_file(&file, 8).await.unwrap();
    assert_eq!(read_all(connector, &file).await, &data[..8]);
    assert_eq!(connector.blobs(&file).await.unwrap().len(), 2);

    // Inside a blob.
    connector.truncate_file(&file, 6).await.unwrap();
    assert_eq!(read_all(connector, &file).await, &data[..6]);

    // No-op and growth.
    connector.truncate_file(&file, 6).await.unwrap();
    let err = connector.truncate_file(&file, 7).await.unwrap_err();
    assert_eq!(err.code(), "InvalidArgument");

    connector.truncate_file(&file, 0).await.unwrap();
    assert!(!connector.file_exists(&file).await.unwrap());
}

pub(crate) async fn delete_file(connector: &dyn Connector, container: &str) {
    let file = connector.resolve(&format!("{container}/delete/file")).unwrap();
    assert!(!connector.delete_file(&file).await.unwrap());

    write(connector, &file, &payload(9)).await;
    assert!(connector.delete_file(&file).await.unwrap());
    assert!(!connector.file_exists(&file).await.unwrap());
    assert_eq!(connector.file_size(&file).await.unwrap(), 0);

    // A deleted file can be written again from ordinal 0.
    write(connector, &file, b"again").await;
    assert_eq!(read_all(connector, &file).await, b"again");
    assert_eq!(connector.blobs(&file).await.unwrap()[0].ordinal(), 0);
}

pub(crate) async fn move_within_container(connector: &dyn Connector, container: &str) {
    let source = connector.resolve(&format!("{container}/move/source")).unwrap();
    let target = connector.resolve(&format!("{container}/move/nested/target")).unwrap();
    let data = payload(11);
    write(connector, &source, &data).await;

    connector.move_file(&source, &target).await.unwrap();
    assert!(!connector.file_exists(&source).await.unwrap());
    assert_eq!(read_all(connector, &target).await, data);

    // Moving onto an existing file appends.
    write(connector, &source, b"tail").await;
    connector.move_file(&source, &target).await.unwrap();
    let mut expected = data.clone();
    expected.extend_from_slice(b"tail");
    assert_eq!(read_all(connector, &target).await, expected);

    // Missing source and self-moves are no-ops.
    connector.move_file(&source, &target).await.unwrap();
    connector.move_file(&target, &target).await.unwrap();
    assert_eq!(read_all(connector, &target).await, expected);
}

/// Property check for moves between two containers of one connector.
pub(crate) async fn move_across_containers(
    connector: &dyn Connector,
    from_container: &str,
    to_container: &str,
) {
    let source = connector.resolve(&format!("{from_container}/cross/file")).unwrap();
    let target = connector.resolve(&format!("{to_container}/cross/file")).unwrap();
    let data = payload(13);
    write(connector, &source, &data).await;

    connector.move_file(&source, &target).await.unwrap();
    assert!(!connector.file_exists(&source).await.unwrap());
    assert_eq!(read_all(connector, &target).await, data);
}

pub(crate) async fn copy_and_copy_range(connector: &dyn Connector, container: &str) {
    let source = connector.resolve(&format!("{container}/copy/source")).unwrap();
    let whole = connector.resolve(&format!("{container}/copy/whole")).unwrap();
    let part = connector.resolve(&format!("{container}/copy/part")).unwrap();
    let data = payload(10);
    write(connector, &source, &data).await;

    assert_eq!(connector.copy_file(&source, &whole).await.unwrap(), 10);
    assert_eq!(read_all(connector, &whole).await, data);
    assert_eq!(read_all(connector, &source).await, data);

    // Copy appends to an existing target.
    assert_eq!(connector.copy_file(&source, &whole).await.unwrap(), 10);
    assert_eq!(connector.file_size(&whole).await.unwrap(), 20);

    assert_eq!(connector.copy_range(&source, &part, 3, 5).await.unwrap(), 5);
    assert_eq!(read_all(connector, &part).await, &data[3..8]);

    let missing = connector.resolve(&format!("{container}/copy/missing")).unwrap();
    assert_eq!(connector.copy_file(&missing, &part).await.unwrap(), 0);
}

pub(crate) async fn listing(connector: &dyn Connector, container: &str) {
    for name in ["tree/x", "tree/sub/y", "tree/sub/deeper/z", "treetop/w"] {
        let file = connector.resolve(&format!("{container}/{name}")).unwrap();
        write(connector, &file, b"data").await;
    }

    let tree = connector.resolve(&format!("{container}/tree")).unwrap();
    let children = connector.list_children(&tree).await.unwrap();
    assert_eq!(children.directories, vec!["sub".to_string()]);
    assert_eq!(children.files, vec!["x".to_string()]);

    let sub = connector.resolve(&format!("{container}/tree/sub")).unwrap();
    let children = connector.list_children(&sub).await.unwrap();
    assert_eq!(children.directories, vec!["deeper".to_string()]);
    assert_eq!(children.files, vec!["y".to_string()]);

    assert!(!connector.is_empty(&sub).await.unwrap());
    let empty = connector.resolve(&format!("{container}/tree/nothing")).unwrap();
    assert!(connector.is_empty(&empty).await.unwrap());
    assert!(connector.directory_exists(&empty).await.unwrap());
    connector.create_directory(&empty).await.unwrap();
    connector.create_file(&empty.child("new").unwrap()).await.unwrap();
    assert!(connector.is_empty(&empty).await.unwrap());
}

pub(crate) async fn read_into(connector: &dyn Connector, container: &str) {
    let file = connector.resolve(&format!("{container}/readinto/file")).unwrap();
    let data = payload(9);
    write(connector, &file, &data).await;

    let mut target = vec![0u8; 16];
    let copied = connector.read_into(&file, &mut target, 2, 6).await.unwrap();
    assert_eq!(copied, 6);
    assert_eq!(&target[..6], &data[2..8]);

    let copied = connector.read_into(&file, &mut target, 5, 16).await.unwrap();
    assert_eq!(copied, 4);

    let mut small = [0u8; 2];
    let err = connector.read_into(&file, &mut small, 0, 3).await.unwrap_err();
    assert_eq!(err.code(), "InvalidArgument");
}

pub(crate) async fn writes_are_immediately_visible(connector: &dyn Connector, container: &str) {
    let file = connector.resolve(&format!("{container}/fresh/file")).unwrap();
    assert!(!connector.file_exists(&file).await.unwrap());
    assert_eq!(connector.file_size(&file).await.unwrap(), 0);

    write(connector, &file, b"hello").await;
    assert!(connector.file_exists(&file).await.unwrap());
    assert_eq!(connector.file_size(&file).await.unwrap(), 5);
    assert_eq!(read_all(connector, &file).await, b"hello");

    connector.delete_file(&file).await.unwrap();
    assert!(!connector.file_exists(&file).await.unwrap());
}

pub(crate) async fn concurrent_writes_serialize(connector: &dyn Connector, container: &str) {
    let file = connector.resolve(&format!("{container}/concurrent/file")).unwrap();
    let (a, b) = tokio::join!(
        connector.write_data(&file, vec![Bytes::from_static(b"AAAAAA")]),
        connector.write_data(&file, vec![Bytes::from_static(b"BBBBBB")]),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(connector.file_size(&file).await.unwrap(), 12);
    let blobs = connector.blobs(&file).await.unwrap();
    assert_eq!(ordinals(&blobs), vec![0, 1, 2, 3]);
    let content = read_all(connector, &file).await;
    assert!(content == b"AAAAAABBBBBB" || content == b"BBBBBBAAAAAA");
}

/// Closing is idempotent and fails every later operation.
pub(crate) async fn close_rejects_operations(connector: &dyn Connector, container: &str) {
    let file = connector.resolve(&format!("{container}/closed/file")).unwrap();
    write(connector, &file, b"data").await;

    connector.close().await.unwrap();
    connector.close().await.unwrap();

    assert_eq!(connector.file_exists(&file).await.unwrap_err().code(), "Closed");
    assert_eq!(connector.read_data(&file, 0, 4).await.unwrap_err().code(), "Closed");
    let err = connector
        .write_data(&file, vec![Bytes::from_static(b"x")])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "Closed");
}
