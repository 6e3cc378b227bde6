use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tempfile::tempdir;

use super::{Archive, ArchiveLimits, MemoryProbe};
use crate::message::{Message, codec};

struct FixedMemory(AtomicU64);

impl FixedMemory {
    fn plenty() -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(u64::MAX)))
    }
}

impl MemoryProbe for FixedMemory {
    fn available_bytes(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

fn record(publisher: &str, timestamp: u64, body: &str) -> Vec<u8> {
    let message = Message {
        id: format!("id-{timestamp}"),
        timestamp,
        ..Message::new(publisher, "text", "utf-8", body.as_bytes().to_vec())
    };
    codec::encode(&message).unwrap()
}

fn open_archive(dir: &Path, publisher: &str) -> Archive {
    Archive::open(dir, publisher, ArchiveLimits::default(), FixedMemory::plenty()).unwrap()
}

fn index_files(dir: &Path, publisher: &str) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(&format!("{publisher}_")) && n.ends_with(".idx"))
        .collect();
    names.sort();
    names
}

#[test]
fn test_save_and_query_single_record() {
    let dir = tempdir().unwrap();
    let archive = open_archive(dir.path(), "cam1");

    archive.save(&record("cam1", 1_000, "hello"), 1_000).unwrap();
    let messages = archive.query(0, u64::MAX).unwrap();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "id-1000");
    assert_eq!(messages[0].content_data, b"hello".to_vec());
    assert!(dir.path().join("cam1_1000.idx").exists());
    assert!(dir.path().join("cam1_1000.iomsg").exists());
}

#[test]
fn test_index_record_holds_header_and_offset() {
    let dir = tempdir().unwrap();
    let archive = open_archive(dir.path(), "cam1");
    let first = record("cam1", 10, "aaaa");
    let second = record("cam1", 11, "bb");

    archive.save(&first, 10).unwrap();
    archive.save(&second, 11).unwrap();
    archive.close().unwrap();

    let index = fs::read(dir.path().join("cam1_10.idx")).unwrap();
    let data = fs::read(dir.path().join("cam1_10.iomsg")).unwrap();
    assert_eq!(index.len(), 2 * (codec::HEADER_SIZE + 8));
    assert_eq!(&index[..codec::HEADER_SIZE], &first[..codec::HEADER_SIZE]);

    let second_offset = &index[2 * codec::HEADER_SIZE + 8..];
    let first_payload_len = (first.len() - codec::HEADER_SIZE) as u64;
    assert_eq!(second_offset, &first_payload_len.to_be_bytes());
    assert_eq!(
        data.len(),
        first.len() + second.len() - 2 * codec::HEADER_SIZE
    );
}

#[test]
fn test_rotation_by_record_count_keeps_every_record() {
    let dir = tempdir().unwrap();
    let archive = open_archive(dir.path(), "cam1");

    let base = 1_700_000_000_000u64;
    for i in 0..2_000u64 {
        archive.save(&record("cam1", base + i, "x"), base + i).unwrap();
    }

    assert!(index_files(dir.path(), "cam1").len() >= 2);
    let messages = archive.query(base, base + 1_999).unwrap();
    assert_eq!(messages.len(), 2_000);
    for (i, message) in messages.iter().enumerate() {
        assert_eq!(message.timestamp, base + i as u64);
    }
}

#[test]
fn test_rotation_by_file_size_forces_several_generations() {
    let dir = tempdir().unwrap();
    let limits = ArchiveLimits {
        max_file_bytes: 4 * 1024,
        ..ArchiveLimits::default()
    };
    let archive = Archive::open(dir.path(), "cam1", limits, FixedMemory::plenty()).unwrap();

    let body = "y".repeat(1000);
    for i in 0..20u64 {
        archive.save(&record("cam1", 100 + i, &body), 100 + i).unwrap();
    }

    assert!(index_files(dir.path(), "cam1").len() >= 3);
    let ids: Vec<_> = archive
        .query(100, 119)
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    let expected: Vec<_> = (100..120).map(|t| format!("id-{t}")).collect();
    assert_eq!(ids, expected);
}

#[test]
fn test_query_filters_records_outside_range() {
    let dir = tempdir().unwrap();
    let limits = ArchiveLimits {
        max_records_per_file: 10,
        ..ArchiveLimits::default()
    };
    let archive = Archive::open(dir.path(), "cam1", limits, FixedMemory::plenty()).unwrap();
    for t in 0..30u64 {
        archive.save(&record("cam1", 1_000 + t, "z"), 1_000 + t).unwrap();
    }

    // 1_015..=1_024 spans the generation named 1_010 (which starts before
    // `from`) and the generation named 1_020.
    let messages = archive.query(1_015, 1_024).unwrap();
    let timestamps: Vec<_> = messages.iter().map(|m| m.timestamp).collect();
    assert_eq!(timestamps, (1_015..=1_024).collect::<Vec<_>>());

    assert!(archive.query(2_000, 3_000).unwrap().is_empty());
    assert!(archive.query(20, 10).unwrap().is_empty());
}

#[test]
fn test_same_millisecond_does_not_rotate_onto_existing_name() {
    let dir = tempdir().unwrap();
    let limits = ArchiveLimits {
        max_records_per_file: 2,
        ..ArchiveLimits::default()
    };
    let archive = Archive::open(dir.path(), "cam1", limits, FixedMemory::plenty()).unwrap();
    for _ in 0..5 {
        archive.save(&record("cam1", 500, "same"), 500).unwrap();
    }
    assert_eq!(index_files(dir.path(), "cam1"), vec!["cam1_500.idx"]);
    assert_eq!(archive.query(500, 500).unwrap().len(), 5);
}

#[test]
fn test_publishers_sharing_a_prefix_are_kept_apart() {
    let dir = tempdir().unwrap();
    let cam = open_archive(dir.path(), "cam");
    let cam_1 = open_archive(dir.path(), "cam_1");

    cam.save(&record("cam", 7, "a"), 7).unwrap();
    cam_1.save(&record("cam_1", 8, "b"), 8).unwrap();

    assert_eq!(cam.query(0, 100).unwrap().len(), 1);
    assert_eq!(cam_1.query(0, 100).unwrap().len(), 1);
}

#[test]
fn test_reopen_resumes_generation_with_room() {
    let dir = tempdir().unwrap();
    {
        let archive = open_archive(dir.path(), "cam1");
        archive.save(&record("cam1", 100, "before"), 100).unwrap();
        archive.close().unwrap();
    }

    let archive = open_archive(dir.path(), "cam1");
    archive.save(&record("cam1", 200, "after"), 200).unwrap();

    assert_eq!(index_files(dir.path(), "cam1"), vec!["cam1_100.idx"]);
    assert_eq!(archive.query(0, 300).unwrap().len(), 2);
}

#[test]
fn test_reopen_starts_new_generation_when_full() {
    let dir = tempdir().unwrap();
    let limits = ArchiveLimits {
        max_records_per_file: 3,
        ..ArchiveLimits::default()
    };
    {
        let archive = Archive::open(dir.path(), "cam1", limits, FixedMemory::plenty()).unwrap();
        for t in 0..3u64 {
            archive.save(&record("cam1", 100 + t, "x"), 100 + t).unwrap();
        }
        archive.close().unwrap();
    }

    let archive = Archive::open(dir.path(), "cam1", limits, FixedMemory::plenty()).unwrap();
    archive.save(&record("cam1", 200, "y"), 200).unwrap();

    assert_eq!(
        index_files(dir.path(), "cam1"),
        vec!["cam1_100.idx", "cam1_200.idx"]
    );
    assert_eq!(archive.query(0, 300).unwrap().len(), 4);
}

#[test]
fn test_torn_index_record_is_ignored_and_truncated() {
    let dir = tempdir().unwrap();
    {
        let archive = open_archive(dir.path(), "cam1");
        archive.save(&record("cam1", 100, "ok"), 100).unwrap();
        archive.close().unwrap();
    }
    let index_path = dir.path().join("cam1_100.idx");
    let mut bytes = fs::read(&index_path).unwrap();
    bytes.extend_from_slice(&[4, 0, 0]);
    fs::write(&index_path, &bytes).unwrap();

    let archive = open_archive(dir.path(), "cam1");
    assert_eq!(archive.query(0, 1_000).unwrap().len(), 1);

    archive.save(&record("cam1", 150, "next"), 150).unwrap();
    let messages = archive.query(0, 1_000).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content_data, b"next".to_vec());
}

// A save that dies mid-write leaves stray bytes at the end of both files
// of the open generation.
#[test]
fn test_leftovers_of_failed_write_do_not_shift_later_records() {
    let dir = tempdir().unwrap();
    let archive = open_archive(dir.path(), "cam1");
    archive.save(&record("cam1", 100, "first"), 100).unwrap();

    let append = |name: &str, bytes: &[u8]| {
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(name))
            .unwrap();
        file.write_all(bytes).unwrap();
    };
    append("cam1_100.iomsg", &[0u8; 10]);
    append("cam1_100.idx", &[4, 0, 0, 0, 0]);

    archive.save(&record("cam1", 101, "third"), 101).unwrap();

    let messages = archive.query(0, u64::MAX).unwrap();
    let bodies: Vec<_> = messages.iter().map(|m| m.content_data.clone()).collect();
    assert_eq!(bodies, vec![b"first".to_vec(), b"third".to_vec()]);
    assert_eq!(messages[1].id, "id-101");
    assert_eq!(index_files(dir.path(), "cam1"), vec!["cam1_100.idx"]);
}

// Writes to /dev/full fail with ENOSPC.
#[cfg(target_os = "linux")]
#[test]
fn test_failed_save_reopens_generation_on_next_write() {
    let dir = tempdir().unwrap();
    let archive = open_archive(dir.path(), "cam1");
    archive.save(&record("cam1", 100, "first"), 100).unwrap();
    archive.close().unwrap();

    let data_path = dir.path().join("cam1_101.iomsg");
    std::os::unix::fs::symlink("/dev/full", &data_path).unwrap();
    assert!(archive.save(&record("cam1", 101, "lost"), 101).is_err());

    fs::remove_file(&data_path).unwrap();
    archive.save(&record("cam1", 102, "third"), 102).unwrap();

    let bodies: Vec<_> = archive
        .query(0, u64::MAX)
        .unwrap()
        .into_iter()
        .map(|m| m.content_data)
        .collect();
    assert_eq!(bodies, vec![b"first".to_vec(), b"third".to_vec()]);
    assert_eq!(
        index_files(dir.path(), "cam1"),
        vec!["cam1_100.idx", "cam1_101.idx"]
    );
}

#[test]
fn test_publisher_ids_that_escape_the_directory_are_rejected() {
    let dir = tempdir().unwrap();
    for publisher in ["", ".", "..", "../x", "a/b", "a\\b"] {
        let err = Archive::open(
            dir.path(),
            publisher,
            ArchiveLimits::default(),
            FixedMemory::plenty(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput, "{publisher:?}");
    }
    assert!(!dir.path().parent().unwrap().join("x_1.idx").exists());
}

#[test]
fn test_query_stops_early_under_memory_pressure() {
    let dir = tempdir().unwrap();
    let memory = Arc::new(FixedMemory(AtomicU64::new(u64::MAX)));
    let archive =
        Archive::open(dir.path(), "cam1", ArchiveLimits::default(), memory.clone()).unwrap();
    for t in 0..10u64 {
        archive.save(&record("cam1", t + 1, "m"), t + 1).unwrap();
    }
    assert_eq!(archive.query(0, 100).unwrap().len(), 10);

    memory.0.store(1024, Ordering::Relaxed);
    assert!(archive.query(0, 100).unwrap().is_empty());
}

#[test]
fn test_close_without_open_generation_is_safe() {
    let dir = tempdir().unwrap();
    let archive = open_archive(dir.path(), "idle");
    archive.close().unwrap();
    archive.close().unwrap();
    assert!(archive.query(0, u64::MAX).unwrap().is_empty());
}
