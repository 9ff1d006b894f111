//! End-to-end tests: messages through the cache and a real driver.

use ohstore_config::testing::TestEnvironment;
use ohstore_config::{Config, HeaderConfig, ShareConfig};
use ohstore_fd::{AccessFlags, CoreFile, DirectFile, FileDriver};
use ohstore_header::message::UNLIMITED;
use ohstore_header::{
    Attribute, Comment, Container, Dataspace, FillValue, HeaderError, Message, MessageFlags,
    MessageType, ModificationTime, RefCount, Selector, UpdateFlags, Visit,
};

fn unshared_config() -> Config {
    Config {
        share: ShareConfig {
            enabled: false,
            ..ShareConfig::default()
        },
        ..Config::default()
    }
}

fn file_config(env: &TestEnvironment, version: u8, track: bool) -> Config {
    Config {
        driver: env.aligned_config(512, 4096),
        header: HeaderConfig {
            version,
            track_creation_order: track,
            store_times: version == 2,
            ..HeaderConfig::default()
        },
        ..unshared_config()
    }
}

fn samples() -> Vec<Message> {
    vec![
        Message::Dataspace(Dataspace::simple(&[128, 64]).with_max_dims(&[UNLIMITED, 64])),
        Message::FillValue(FillValue::defined(&0.5f64.to_le_bytes())),
        Message::Attribute(Attribute::new(
            "units",
            &[0x03, 0x10],
            Dataspace::scalar(),
            b"meters",
        )),
        Message::Comment(Comment::new("calibration run 7")),
        Message::ModificationTime(ModificationTime { seconds: 1_650_000_000 }),
        Message::RefCount(RefCount { count: 2 }),
    ]
}

fn comment(text: &str) -> Message {
    Message::Comment(Comment::new(text))
}

fn comment_texts<D: FileDriver>(c: &mut Container<D>, addr: u64) -> Vec<String> {
    let mut out = Vec::new();
    c.iterate(addr, MessageType::Comment, |msg, _| {
        if let Message::Comment(cm) = msg {
            out.push(cm.text.clone());
        }
        Ok(Visit::Continue)
    })
    .unwrap();
    out
}

#[test]
fn test_every_type_survives_a_file_round_trip() -> anyhow::Result<()> {
    for (version, track) in [(1u8, false), (2, false), (2, true)] {
        let env = TestEnvironment::new()?;
        let path = env.data_file(&format!("roundtrip-v{}-{}.oh", version, track));
        let config = file_config(&env, version, track);

        let addr = {
            let mut c = Container::create(&path, &config)?;
            let addr = c.create_header()?;
            for msg in samples() {
                c.append(addr, &msg, MessageFlags::empty(), UpdateFlags::empty())?;
            }
            c.close()?;
            addr
        };

        let mut c = Container::open(&path, AccessFlags::READ_ONLY, &config)?;
        assert!(c.driver().must_align());
        for msg in samples() {
            assert_eq!(c.read(addr, msg.message_type())?, msg, "v{} track={}", version, track);
        }
    }
    Ok(())
}

#[test]
fn test_read_only_aligned_container_closes() -> anyhow::Result<()> {
    let env = TestEnvironment::new()?;
    let path = env.data_file("readonly.oh");
    let config = file_config(&env, 2, false);

    let addr = {
        let mut c = Container::create(&path, &config)?;
        let addr = c.create_header()?;
        c.append(addr, &comment("kept"), MessageFlags::empty(), UpdateFlags::empty())?;
        c.close()?;
        addr
    };
    let size = std::fs::metadata(&path)?.len();

    let mut c = Container::open(&path, AccessFlags::READ_ONLY, &config)?;
    assert!(c.driver().must_align());
    assert_eq!(c.read(addr, MessageType::Comment)?, comment("kept"));
    let driver = c.close()?;
    assert!(!driver.is_writable());
    drop(driver);
    assert_eq!(std::fs::metadata(&path)?.len(), size);
    Ok(())
}

#[test]
fn test_close_trims_file_to_allocated_size() -> anyhow::Result<()> {
    let env = TestEnvironment::new()?;
    let path = env.data_file("sizes.oh");
    let config = file_config(&env, 2, false);

    let mut c = Container::create(&path, &config)?;
    let addr = c.create_header()?;
    c.append(addr, &comment("x"), MessageFlags::empty(), UpdateFlags::empty())?;
    c.flush()?;
    let eoa = c.driver().eoa();
    let driver: DirectFile = c.close()?;
    assert_eq!(driver.eoa(), eoa);
    drop(driver);
    assert_eq!(std::fs::metadata(&path)?.len(), eoa);
    Ok(())
}

#[test]
fn test_remove_all_twice_reports_not_found() -> anyhow::Result<()> {
    let mut c = Container::in_memory(&Config::default())?;
    let addr = c.create_header()?;
    c.append(addr, &comment("a"), MessageFlags::empty(), UpdateFlags::empty())?;
    c.append(addr, &comment("b"), MessageFlags::empty(), UpdateFlags::empty())?;

    assert_eq!(
        c.remove(addr, MessageType::Comment, Selector::All, true, UpdateFlags::empty())?,
        2
    );
    assert!(matches!(
        c.remove(addr, MessageType::Comment, Selector::All, true, UpdateFlags::empty()),
        Err(HeaderError::NotFound("comment"))
    ));
    assert!(!c.exists(addr, MessageType::Comment)?);
    Ok(())
}

#[test]
fn test_ordinals_follow_table_order() -> anyhow::Result<()> {
    let mut c = Container::in_memory(&Config::default())?;
    let addr = c.create_header()?;
    for text in ["first", "second", "third"] {
        c.append(addr, &comment(text), MessageFlags::empty(), UpdateFlags::empty())?;
    }

    let mut seqs = Vec::new();
    c.iterate(addr, MessageType::Comment, |_, seq| {
        seqs.push(seq);
        Ok(Visit::Continue)
    })?;
    assert_eq!(seqs, vec![0, 1, 2]);

    c.remove(addr, MessageType::Comment, Selector::Nth(1), true, UpdateFlags::empty())?;
    assert_eq!(comment_texts(&mut c, addr), vec!["first", "third"]);
    assert_eq!(c.count(addr, MessageType::Comment)?, 2);
    Ok(())
}

#[test]
fn test_shared_message_outlives_one_owner() -> anyhow::Result<()> {
    let mut c = Container::in_memory(&Config::default())?;
    let h1 = c.create_header()?;
    let h2 = c.create_header()?;
    let ds = Message::Dataspace(Dataspace::simple(&[1024, 1024]));

    c.append(h1, &ds, MessageFlags::empty(), UpdateFlags::empty())?;
    c.append(h2, &ds, MessageFlags::empty(), UpdateFlags::empty())?;
    let sharing = c.read(h1, MessageType::Dataspace)?.sharing();
    assert!(sharing.is_shared());
    assert_eq!(c.shared_heap().refcount(&sharing), 2);
    assert_eq!(c.shared_heap().len(), 1);

    c.remove(h1, MessageType::Dataspace, Selector::All, true, UpdateFlags::empty())?;
    assert_eq!(c.shared_heap().refcount(&sharing), 1);

    // h2 still resolves through the heap after a flush and eviction
    c.flush()?;
    c.evict(h2)?;
    match c.read(h2, MessageType::Dataspace)? {
        Message::Dataspace(read) => assert_eq!(read.dims, vec![1024, 1024]),
        other => panic!("unexpected message {:?}", other),
    }

    c.remove(h2, MessageType::Dataspace, Selector::First, true, UpdateFlags::empty())?;
    assert!(c.shared_heap().is_empty());
    Ok(())
}

#[test]
fn test_remove_without_link_adjustment_keeps_refcount() -> anyhow::Result<()> {
    let mut c = Container::in_memory(&Config::default())?;
    let addr = c.create_header()?;
    let fill = Message::FillValue(FillValue::defined(&[1, 2, 3]));
    c.append(addr, &fill, MessageFlags::empty(), UpdateFlags::empty())?;
    let sharing = c.read(addr, MessageType::FillValue)?.sharing();

    c.remove(addr, MessageType::FillValue, Selector::All, false, UpdateFlags::empty())?;
    assert_eq!(c.shared_heap().refcount(&sharing), 1);
    Ok(())
}

#[test]
fn test_header_growth_is_forwarded_on_disk() -> anyhow::Result<()> {
    let env = TestEnvironment::new()?;
    let path = env.data_file("grow.oh");
    let config = file_config(&env, 2, false);

    let texts: Vec<String> = (0..64).map(|i| format!("note {:03} with padding", i)).collect();
    let (a, b) = {
        let mut c = Container::create(&path, &config)?;
        let a = c.create_header()?;
        let b = c.create_header()?;
        c.append(b, &comment("neighbour"), MessageFlags::empty(), UpdateFlags::empty())?;
        c.flush()?;
        for text in &texts {
            c.append(a, &comment(text), MessageFlags::empty(), UpdateFlags::TIME)?;
        }
        c.close()?;
        (a, b)
    };

    let mut c = Container::open(&path, AccessFlags::READ_WRITE, &config)?;
    assert_eq!(comment_texts(&mut c, a), texts);
    assert_eq!(comment_texts(&mut c, b), vec!["neighbour"]);
    Ok(())
}

#[test]
fn test_constant_messages_need_force() -> anyhow::Result<()> {
    let mut c = Container::in_memory(&Config::default())?;
    let addr = c.create_header()?;
    c.append(addr, &comment("locked"), MessageFlags::CONSTANT, UpdateFlags::empty())?;

    assert!(matches!(
        c.write(addr, &comment("changed"), MessageFlags::empty(), UpdateFlags::empty()),
        Err(HeaderError::WriteProtected(_))
    ));
    c.write(addr, &comment("changed"), MessageFlags::CONSTANT, UpdateFlags::FORCE)?;
    assert_eq!(c.read(addr, MessageType::Comment)?, comment("changed"));
    Ok(())
}

#[test]
fn test_copy_between_containers() -> anyhow::Result<()> {
    let mut src = Container::in_memory(&Config::default())?;
    let mut dst = Container::with_driver(CoreFile::new(), AccessFlags::READ_WRITE, &Config::default())?;
    let s = src.create_header()?;
    let d = dst.create_header()?;
    for name in ["alpha", "beta"] {
        let attr = Attribute::new(name, &[1], Dataspace::scalar(), &[7]);
        src.append(s, &Message::Attribute(attr), MessageFlags::empty(), UpdateFlags::empty())?;
    }

    assert_eq!(src.copy_messages(s, MessageType::Attribute, &mut dst, d)?, 2);
    assert_eq!(dst.count(d, MessageType::Attribute)?, 2);
    assert_eq!(dst.shared_heap().len(), 2);
    Ok(())
}

#[test]
fn test_touch_with_stored_times() -> anyhow::Result<()> {
    let mut c = Container::in_memory(&Config {
        header: HeaderConfig {
            store_times: true,
            ..HeaderConfig::default()
        },
        ..Config::default()
    })?;
    let addr = c.create_header()?;
    c.touch(addr, true)?;
    assert!(!c.exists(addr, MessageType::ModificationTime)?);

    let mut v1 = Container::in_memory(&Config {
        header: HeaderConfig {
            version: 1,
            ..HeaderConfig::default()
        },
        ..Config::default()
    })?;
    let addr = v1.create_header()?;
    v1.touch(addr, false)?;
    assert!(!v1.exists(addr, MessageType::ModificationTime)?);
    v1.touch(addr, true)?;
    assert!(v1.exists(addr, MessageType::ModificationTime)?);
    Ok(())
}

#[test]
fn test_read_into_reuses_destination() -> anyhow::Result<()> {
    let mut c = Container::in_memory(&unshared_config())?;
    let addr = c.create_header()?;
    c.append(
        addr,
        &Message::RefCount(RefCount { count: 9 }),
        MessageFlags::empty(),
        UpdateFlags::empty(),
    )?;
    let mut dest = Message::RefCount(RefCount { count: 1 });
    c.read_into(addr, MessageType::RefCount, &mut dest)?;
    assert_eq!(dest, Message::RefCount(RefCount { count: 9 }));
    Ok(())
}
