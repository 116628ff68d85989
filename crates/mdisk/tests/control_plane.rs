mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{init_tracing, pattern, read, recv, write, Gate, SlowOpener};
use mdisk::{
    errno, BackingConfig, Collaborators, Completion, DeviceConfig, DeviceOptions, DeviceState,
    DriverConfig, LocalGeomHost, MdDriver, MdError, PreloadImage, Request, StoreKind,
};
use mdisk_storage::MemPager;

fn driver() -> MdDriver {
    init_tracing();
    MdDriver::attach(DriverConfig::default(), Collaborators::default()).unwrap()
}

fn driver_with_host() -> (MdDriver, Arc<LocalGeomHost>) {
    init_tracing();
    let host = Arc::new(LocalGeomHost::default());
    let collaborators = Collaborators::default().with_host(host.clone());
    (
        MdDriver::attach(DriverConfig::default(), collaborators).unwrap(),
        host,
    )
}

#[test]
fn create_then_list_shows_one_active_unit() {
    let (driver, host) = driver_with_host();
    let unit = driver
        .create(DeviceConfig::malloc(1 << 20).with_sector_size(4096).with_label("scratch"))
        .unwrap();

    let units = driver.list();
    assert_eq!(units.len(), 1);
    let summary = &units[0];
    assert_eq!(summary.unit, unit);
    assert_eq!(summary.state, DeviceState::Active);
    assert_eq!(summary.kind, StoreKind::Malloc);
    assert_eq!(summary.geometry.sector_size, 4096);
    assert_eq!(summary.geometry.sector_count, 256);
    assert_eq!(summary.label.as_deref(), Some("scratch"));

    let provider = host.provider(unit).expect("provider registered");
    assert_eq!(provider.name, format!("md{unit}"));
    assert_eq!(provider.media_size, 1 << 20);
    assert!(provider.candelete);
}

#[test]
fn units_are_numbered_from_the_smallest_free() {
    let driver = driver();
    let a = driver.create(DeviceConfig::malloc(4096)).unwrap();
    let b = driver.create(DeviceConfig::malloc(4096)).unwrap();
    let c = driver.create(DeviceConfig::swap(4096).with_unit(7)).unwrap();
    assert_eq!((a, b, c), (0, 1, 7));

    driver.detach(a, false).unwrap();
    assert_eq!(driver.create(DeviceConfig::null(4096)).unwrap(), 0);

    assert!(matches!(
        driver.create(DeviceConfig::malloc(4096).with_unit(7)),
        Err(MdError::UnitInUse(7))
    ));
}

#[test]
fn sparse_growth() {
    let driver = driver();
    let unit = driver
        .create(DeviceConfig::malloc(1_048_576).with_sector_size(4096))
        .unwrap();

    let data = pattern(4096, 9);
    assert!(matches!(write(&driver, unit, 0, data.clone()).result, Ok(4096)));

    let hole = read(&driver, unit, 8192, 4096);
    assert!(hole.is_ok());
    assert!(hole.data.iter().all(|b| *b == 0));

    let back = read(&driver, unit, 0, 4096);
    assert_eq!(back.data, data);

    let device = driver.device(unit).unwrap();
    assert_eq!(device.allocated_bytes(), Some(4096));
}

#[test]
fn invalid_configs_leave_no_trace() {
    let (driver, host) = driver_with_host();
    let bad = [
        DeviceConfig::malloc(1000),
        DeviceConfig::malloc(4096).with_sector_size(768),
        DeviceConfig::new(BackingConfig::Malloc),
        DeviceConfig::preload("missing"),
        DeviceConfig::vnode("/nonexistent/mdisk/backing.img"),
        DeviceConfig::swap(4096).with_options(DeviceOptions {
            reserve: true,
            ..DeviceOptions::default()
        }),
    ];
    for cfg in bad {
        let err = driver.create(cfg.clone()).unwrap_err();
        assert!(
            matches!(err, MdError::InvalidConfig(_)),
            "{cfg:?} gave {err:?}"
        );
        assert_eq!(err.errno(), errno::EINVAL);
    }
    assert!(driver.list().is_empty());
    assert!(host.providers().is_empty());
}

#[test]
fn failed_provider_registration_rolls_back() {
    let (driver, host) = driver_with_host();
    host.refuse_registrations(true);
    assert!(matches!(
        driver.create(DeviceConfig::malloc(4096)),
        Err(MdError::OutOfResources)
    ));
    assert!(driver.list().is_empty());

    host.refuse_registrations(false);
    assert_eq!(driver.create(DeviceConfig::malloc(4096)).unwrap(), 0);
}

#[test]
fn unit_limit_is_enforced() {
    init_tracing();
    let config = DriverConfig {
        max_units: 2,
        ..DriverConfig::default()
    };
    let driver = MdDriver::attach(config, Collaborators::default()).unwrap();
    driver.create(DeviceConfig::null(4096)).unwrap();
    driver.create(DeviceConfig::null(4096)).unwrap();
    assert!(matches!(
        driver.create(DeviceConfig::null(4096)),
        Err(MdError::OutOfResources)
    ));
    assert!(matches!(
        driver.create(DeviceConfig::null(4096).with_unit(2)),
        Err(MdError::InvalidConfig(_))
    ));
}

#[test]
fn preload_resize_is_unsupported() {
    init_tracing();
    let image = PreloadImage::new("mfsroot", pattern(16 * 512, 1));
    let driver = MdDriver::attach(
        DriverConfig::default(),
        Collaborators::default().with_preloaded(image),
    )
    .unwrap();

    let before = driver.query(0).unwrap();
    assert_eq!(before.kind, StoreKind::Preload);
    assert!(before.read_only);

    let err = driver.resize(0, 64).unwrap_err();
    assert!(matches!(err, MdError::Unsupported(_)));
    assert_eq!(err.errno(), errno::EOPNOTSUPP);
    assert_eq!(driver.query(0).unwrap().geometry, before.geometry);

    let back = read(&driver, 0, 512, 512);
    assert_eq!(back.data, pattern(16 * 512, 1)[512..1024].to_vec());
    assert!(matches!(
        write(&driver, 0, 0, vec![0u8; 512]).result,
        Err(MdError::ReadOnly)
    ));
}

#[test]
fn preload_images_can_back_further_units() {
    init_tracing();
    let config = DriverConfig {
        autoattach_preloaded: false,
        ..DriverConfig::default()
    };
    let image = PreloadImage::new("boot", vec![0xEEu8; 8192]);
    let driver = MdDriver::attach(config, Collaborators::default().with_preloaded(image)).unwrap();
    assert!(driver.list().is_empty());

    let unit = driver
        .create(DeviceConfig::preload("boot").with_size(4096))
        .unwrap();
    assert_eq!(driver.query(unit).unwrap().geometry.media_size, 4096);
    assert_eq!(read(&driver, unit, 3584, 512).data, vec![0xEE; 512]);
}

#[test]
fn resize_grows_and_shrinks() {
    let (driver, host) = driver_with_host();
    let unit = driver.create(DeviceConfig::malloc(8192)).unwrap();
    write(&driver, unit, 4096, vec![0x11; 4096]);

    driver.resize(unit, 64).unwrap();
    assert_eq!(driver.query(unit).unwrap().geometry.media_size, 64 * 512);
    assert_eq!(host.provider(unit).unwrap().media_size, 64 * 512);
    assert_eq!(read(&driver, unit, 4096, 512).data, vec![0x11; 512]);
    assert!(read(&driver, unit, 30 * 512, 512).data.iter().all(|b| *b == 0));

    driver.resize(unit, 8).unwrap();
    assert_eq!(driver.query(unit).unwrap().geometry.sector_count, 8);
    assert!(matches!(
        read(&driver, unit, 4096, 512).result,
        Err(MdError::BackingIo(_))
    ));

    assert!(matches!(
        driver.resize(unit, 0),
        Err(MdError::InvalidConfig(_))
    ));
    assert!(matches!(driver.resize(99, 8), Err(MdError::NotFound(99))));
}

#[test]
fn resize_keeps_requests_queued_meanwhile() {
    init_tracing();
    let opener = Arc::new(SlowOpener::new(
        64 * 512,
        vec![Duration::from_millis(5)],
    ));
    let driver = MdDriver::attach(
        DriverConfig::default(),
        Collaborators::default().with_vnodes(opener),
    )
    .unwrap();
    let unit = driver.create(DeviceConfig::vnode("/slow/disk.img")).unwrap();
    let device = driver.device(unit).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    for i in 0..8u64 {
        device
            .submit(Request::write(i * 512, vec![i as u8; 512], Completion::sender(tx.clone())))
            .unwrap();
    }
    driver.resize(unit, 128).unwrap();
    for i in 0..8u64 {
        let outcome = recv(&rx);
        assert_eq!(outcome.offset, i * 512);
        assert!(outcome.is_ok());
    }
    assert_eq!(device.media_size(), 128 * 512);
}

#[test]
fn resize_and_detach_are_busy_while_a_resize_runs() {
    init_tracing();
    let gate = Arc::new(Gate::default());
    let opener = SlowOpener::new(64 * 512, Vec::new()).with_resize_gate(Arc::clone(&gate));
    let driver = Arc::new(
        MdDriver::attach(
            DriverConfig::default(),
            Collaborators::default().with_vnodes(Arc::new(opener)),
        )
        .unwrap(),
    );
    let unit = driver.create(DeviceConfig::vnode("/slow/gated.img")).unwrap();

    let resizing = {
        let driver = Arc::clone(&driver);
        thread::spawn(move || driver.resize(unit, 128))
    };
    gate.wait_entered();

    assert!(matches!(
        driver.resize(unit, 256),
        Err(MdError::Busy { unit: u, .. }) if u == unit
    ));
    let err = driver.detach(unit, true).unwrap_err();
    assert!(matches!(err, MdError::Busy { .. }));
    assert_eq!(err.errno(), errno::EBUSY);
    assert_eq!(driver.query(unit).unwrap().state, DeviceState::Active);

    gate.release();
    resizing.join().unwrap().unwrap();
    assert_eq!(driver.query(unit).unwrap().geometry.sector_count, 128);
    driver.detach(unit, false).unwrap();
}

#[test]
fn unforced_detach_never_strands_a_concurrent_open() {
    let driver = Arc::new(driver());
    for _ in 0..200 {
        let unit = driver.create(DeviceConfig::malloc(4096)).unwrap();
        let provider = driver.provider(unit).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let consumer = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                provider.access(1, 0, 0)
            })
        };
        barrier.wait();
        let detached = driver.detach(unit, false);
        let opened = consumer.join().unwrap();
        match (detached, opened) {
            (Ok(()), Err(err)) => assert_eq!(err.errno(), errno::ENXIO),
            (Err(MdError::Busy { .. }), Ok(counts)) => {
                assert_eq!(counts.r, 1);
                driver.detach(unit, true).unwrap();
            }
            (detached, opened) => panic!("detach {detached:?} alongside open {opened:?}"),
        }
    }
    assert!(driver.list().is_empty());
}

#[test]
fn detach_twice_is_not_found() {
    let (driver, host) = driver_with_host();
    let unit = driver.create(DeviceConfig::swap(1 << 16)).unwrap();
    driver.detach(unit, false).unwrap();

    assert!(matches!(
        driver.detach(unit, false),
        Err(MdError::NotFound(u)) if u == unit
    ));
    assert!(matches!(driver.detach(unit, true), Err(MdError::NotFound(_))));
    assert_eq!(host.withered(), vec![(unit, errno::ENXIO)]);
}

#[test]
fn detach_of_an_open_unit_needs_force() {
    let driver = driver();
    let unit = driver.create(DeviceConfig::malloc(4096)).unwrap();
    let provider = driver.provider(unit).unwrap();
    provider.access(1, 1, 0).unwrap();

    let err = driver.detach(unit, false).unwrap_err();
    assert!(matches!(err, MdError::Busy { .. }));
    assert_eq!(err.errno(), errno::EBUSY);
    assert_eq!(driver.list().len(), 1);

    driver.detach(unit, true).unwrap();
    assert!(driver.list().is_empty());
    // Consumers closing after the forced detach are ignored.
    assert!(provider.access(-1, -1, 0).is_ok());
    assert_eq!(provider.access(1, 0, 0).unwrap_err().errno(), errno::ENXIO);
}

#[test]
fn force_detach_drains_every_queued_request() {
    init_tracing();
    let opener = Arc::new(SlowOpener::new(
        64 * 512,
        vec![Duration::from_millis(10), Duration::from_millis(2)],
    ));
    let driver = MdDriver::attach(
        DriverConfig::default(),
        Collaborators::default().with_vnodes(opener),
    )
    .unwrap();
    let unit = driver.create(DeviceConfig::vnode("/slow/drain.img")).unwrap();
    let device = driver.device(unit).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    for i in 0..10u64 {
        device
            .submit(Request::write(i * 512, vec![0xA5; 512], Completion::sender(tx.clone())))
            .unwrap();
    }
    drop(tx);
    driver.detach(unit, true).unwrap();

    let outcomes: Vec<_> = rx.iter().collect();
    assert_eq!(outcomes.len(), 10);
    for outcome in &outcomes {
        assert!(
            matches!(outcome.result, Ok(512) | Err(MdError::BackingIo(_))),
            "{outcome:?}"
        );
    }
    assert!(driver.list().iter().all(|s| s.unit != unit));
    assert_eq!(device.state(), DeviceState::Destroyed);

    let (completion, rx) = Completion::channel();
    assert!(matches!(
        device.submit(Request::flush(completion)),
        Err(MdError::DeviceNotActive(_))
    ));
    assert!(matches!(
        recv(&rx).result,
        Err(MdError::DeviceNotActive(_))
    ));
}

#[test]
fn round_trip_on_every_backing_type() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vnode.img");
    std::fs::write(&path, vec![0u8; 1 << 16]).unwrap();

    let config = DriverConfig {
        autoattach_preloaded: false,
        ..DriverConfig::default()
    };
    let collaborators = Collaborators::default()
        .with_pager(Arc::new(MemPager::new(4096)))
        .with_preloaded(PreloadImage::new("image", pattern(1 << 16, 3)));
    let driver = MdDriver::attach(config, collaborators).unwrap();

    let writable = [
        DeviceConfig::malloc(1 << 16),
        DeviceConfig::malloc(1 << 16).with_options(DeviceOptions {
            compress: true,
            ..DeviceOptions::default()
        }),
        DeviceConfig::malloc(1 << 16).with_options(DeviceOptions {
            reserve: true,
            ..DeviceOptions::default()
        }),
        DeviceConfig::swap(1 << 16),
        DeviceConfig::vnode(&path),
    ];
    for cfg in writable {
        let unit = driver.create(cfg.clone()).unwrap();
        let data = pattern(3 * 512, unit as u8);
        assert!(write(&driver, unit, 1536, data.clone()).is_ok(), "{cfg:?}");
        assert_eq!(read(&driver, unit, 1536, data.len()).data, data, "{cfg:?}");
    }

    let unit = driver.create(DeviceConfig::preload("image")).unwrap();
    assert_eq!(
        read(&driver, unit, 1536, 512).data,
        pattern(1 << 16, 3)[1536..2048].to_vec()
    );

    let vnode = driver
        .list()
        .into_iter()
        .find(|s| s.kind == StoreKind::Vnode)
        .unwrap();
    assert_eq!(vnode.path.as_deref(), Some(path.as_path()));
    assert_eq!(vnode.geometry.media_size, 1 << 16);

    drop(driver);
    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(on_disk[1536..1536 + 3 * 512], pattern(3 * 512, 4)[..]);
}

#[test]
fn malloc_budget_exhaustion_fails_only_the_request() {
    init_tracing();
    let config = DriverConfig {
        malloc_page_limit: Some(2),
        ..DriverConfig::default()
    };
    let driver = MdDriver::attach(config, Collaborators::default()).unwrap();
    let unit = driver.create(DeviceConfig::malloc(1 << 16)).unwrap();

    assert!(write(&driver, unit, 0, vec![1; 4096]).is_ok());
    assert!(write(&driver, unit, 4096, vec![2; 4096]).is_ok());
    let err = write(&driver, unit, 8192, vec![3; 4096]).result.unwrap_err();
    assert!(matches!(err, MdError::OutOfResources));
    assert_eq!(err.errno(), errno::ENOMEM);

    assert_eq!(read(&driver, unit, 4096, 4096).data, vec![2; 4096]);
    let stats = driver.query(unit).unwrap().stats;
    assert_eq!(stats.writes, 3);
    assert_eq!(stats.errors, 1);
    assert_eq!(driver.query(unit).unwrap().state, DeviceState::Active);
}

#[test]
fn json_control_surface() {
    let driver = driver();
    let reply: serde_json::Value = serde_json::from_str(&driver.control_json(
        r#"{"op": "attach", "backing": {"type": "malloc"}, "size_bytes": 65536, "sector_size": 4096}"#,
    ))
    .unwrap();
    assert_eq!(reply["ok"]["attached"]["unit"], 0);

    let reply: serde_json::Value =
        serde_json::from_str(&driver.control_json(r#"{"op": "list"}"#)).unwrap();
    let units = reply["ok"]["units"].as_array().unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0]["state"], "ACTIVE");
    assert_eq!(units[0]["kind"], "malloc");
    assert_eq!(units[0]["sector_count"], 16);

    let reply: serde_json::Value = serde_json::from_str(
        &driver.control_json(r#"{"op": "resize", "unit": 0, "sectors": 32}"#),
    )
    .unwrap();
    assert_eq!(reply["ok"]["resized"]["sectors"], 32);

    let reply: serde_json::Value =
        serde_json::from_str(&driver.control_json(r#"{"op": "query", "unit": 0}"#)).unwrap();
    assert_eq!(reply["ok"]["unit"]["media_size"], 32 * 4096);

    let reply: serde_json::Value = serde_json::from_str(
        &driver.control_json(r#"{"op": "detach", "unit": 0, "force": false}"#),
    )
    .unwrap();
    assert_eq!(reply["ok"]["detached"]["unit"], 0);

    let reply: serde_json::Value =
        serde_json::from_str(&driver.control_json(r#"{"op": "detach", "unit": 0}"#)).unwrap();
    assert_eq!(reply["error"]["errno"], errno::ENOENT);

    let reply: serde_json::Value =
        serde_json::from_str(&driver.control_json(r#"{"op": "explode"}"#)).unwrap();
    assert_eq!(reply["error"]["errno"], errno::EINVAL);
}

#[test]
fn shutdown_detaches_everything() {
    let (driver, host) = driver_with_host();
    for _ in 0..3 {
        driver.create(DeviceConfig::malloc(4096)).unwrap();
    }
    let provider = driver.provider(1).unwrap();
    provider.access(1, 0, 0).unwrap();

    driver.shutdown();
    assert!(driver.list().is_empty());
    assert!(host.providers().is_empty());
    assert_eq!(host.withered().len(), 3);
}
