//! Integration tests for ohstore-fd
//!
//! Scenarios run against real files in a private temp directory.

use ohstore_config::testing::TestEnvironment;
use ohstore_fd::{
    cmp_identity, AccessFlags, CoreFile, DirectFile, FdError, Features, FileDriver,
};
use std::cmp::Ordering;

fn rw_create() -> AccessFlags {
    AccessFlags::READ_WRITE | AccessFlags::CREATE | AccessFlags::TRUNCATE
}

/// Two 64-byte patterns written back to back read back in order
fn pattern_roundtrip(driver: &mut dyn FileDriver) {
    assert_eq!(driver.eoa(), 0);
    driver.set_eoa(128).unwrap();
    driver.write(0, &[0xAA; 64]).unwrap();
    driver.write(64, &[0xBB; 64]).unwrap();

    let mut out = [0u8; 128];
    driver.read(0, &mut out).unwrap();
    assert!(out[..64].iter().all(|&b| b == 0xAA));
    assert!(out[64..].iter().all(|&b| b == 0xBB));
    assert!(driver.eof() >= 128);
}

/// Test the two-pattern scenario on a buffered handle
#[test]
fn test_pattern_roundtrip_buffered() {
    let env = TestEnvironment::new().unwrap();
    let mut file =
        DirectFile::open(&env.data_file("e2e.bin"), rw_create(), &env.buffered_config()).unwrap();
    pattern_roundtrip(&mut file);
}

/// Test the two-pattern scenario through the staging path
#[test]
fn test_pattern_roundtrip_aligned() {
    let env = TestEnvironment::new().unwrap();
    let cfg = env.aligned_config(4096, 4096 * 16);
    let mut file = DirectFile::open(&env.data_file("e2e-aligned.bin"), rw_create(), &cfg).unwrap();
    pattern_roundtrip(&mut file);
    assert!(file.stats().staged_transfers > 0);
}

/// Test the two-pattern scenario on the in-memory driver
#[test]
fn test_pattern_roundtrip_core() {
    let mut core = CoreFile::new();
    pattern_roundtrip(&mut core);
}

/// Test that every transfer ending past EOA fails with an overflow, aligned or not
#[test]
fn test_past_eoa_always_overflows() {
    let env = TestEnvironment::new().unwrap();
    let cfg = env.aligned_config(512, 4096);
    let mut file = DirectFile::open(&env.data_file("eoa.bin"), rw_create(), &cfg).unwrap();
    file.set_eoa(2048).unwrap();

    for (addr, size) in [(0u64, 2049usize), (2048, 1), (1536, 1024), (3, 2046), (4096, 512)] {
        let mut buf = vec![0u8; size];
        assert!(
            matches!(file.read(addr, &mut buf), Err(FdError::Overflow { .. })),
            "read addr={} size={}",
            addr,
            size
        );
        assert!(
            matches!(file.write(addr, &buf), Err(FdError::Overflow { .. })),
            "write addr={} size={}",
            addr,
            size
        );
    }
}

/// Test read-modify-write of a 10-byte write at address 3 on an aligned handle
#[test]
fn test_misaligned_write_preserves_block() {
    let env = TestEnvironment::new().unwrap();
    let path = env.data_file("rmw.bin");
    let seed: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 256) as u8).collect();
    std::fs::write(&path, &seed).unwrap();

    let cfg = env.aligned_config(4096, 4096 * 16);
    let mut file = DirectFile::open(&path, AccessFlags::READ_WRITE, &cfg).unwrap();
    assert!(file.must_align());
    file.set_eoa(4096).unwrap();

    file.write(3, &[0xC3; 10]).unwrap();

    let mut block = vec![0u8; 4096];
    file.read(0, &mut block).unwrap();
    assert_eq!(&block[..3], &seed[..3]);
    assert!(block[3..13].iter().all(|&b| b == 0xC3));
    assert_eq!(&block[13..], &seed[13..]);
}

/// Test that data survives close and reopen, with padding trimmed
#[test]
fn test_reopen_after_truncate() {
    let env = TestEnvironment::new().unwrap();
    let path = env.data_file("reopen.bin");
    let cfg = env.aligned_config(512, 2048);

    let mut file = DirectFile::open(&path, rw_create(), &cfg).unwrap();
    file.set_eoa(700).unwrap();
    file.write(100, &[0x42; 600]).unwrap();
    file.truncate().unwrap();
    file.close().unwrap();

    assert_eq!(std::fs::metadata(&path).unwrap().len(), 700);

    let mut file = DirectFile::open(&path, AccessFlags::READ_ONLY, &cfg).unwrap();
    assert_eq!(file.eof(), 700);
    file.set_eoa(700).unwrap();
    let mut out = vec![0u8; 600];
    file.read(100, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0x42));
}

/// Test that two handles on one file compare equal
#[test]
fn test_identity_detects_same_file() {
    let env = TestEnvironment::new().unwrap();
    let path = env.data_file("same.bin");
    let other = env.data_file("other.bin");
    let cfg = env.buffered_config();

    let a = DirectFile::open(&path, rw_create(), &cfg).unwrap();
    let b = DirectFile::open(&path, AccessFlags::READ_ONLY, &cfg).unwrap();
    let c = DirectFile::open(&other, rw_create(), &cfg).unwrap();

    assert_eq!(cmp_identity(&a, &b), Ordering::Equal);
    assert_ne!(cmp_identity(&a, &c), Ordering::Equal);
}

/// Test the capability flags and descriptor export
#[test]
fn test_features_and_raw_handle() {
    let env = TestEnvironment::new().unwrap();
    let file =
        DirectFile::open(&env.data_file("feat.bin"), rw_create(), &env.buffered_config()).unwrap();
    let features = file.features();
    assert!(features.contains(Features::AGGREGATE_METADATA | Features::DATA_SIEVE));
    assert!(features.contains(Features::ACCUMULATE_METADATA | Features::AGGREGATE_SMALLDATA));
    #[cfg(unix)]
    assert!(file.raw_fd() >= 0);
}

/// Test a real O_DIRECT handle where the file system supports it
#[test]
fn test_real_direct_io_when_available() {
    let env = TestEnvironment::new().unwrap();
    let cfg = ohstore_config::DriverConfig::default();
    let mut file = match DirectFile::open(&env.data_file("odirect.bin"), rw_create(), &cfg) {
        Ok(file) => file,
        // tmpfs and some overlay file systems refuse O_DIRECT outright
        Err(FdError::Io(_)) | Err(FdError::DirectIoUnsupported(_)) => return,
        Err(e) => panic!("unexpected open failure: {e}"),
    };

    file.set_eoa(10).unwrap();
    file.write(3, b"direct!").unwrap();
    let mut out = [0u8; 7];
    file.read(3, &mut out).unwrap();
    assert_eq!(&out, b"direct!");
    file.truncate().unwrap();
    assert_eq!(std::fs::metadata(file.path()).unwrap().len(), 10);
}
