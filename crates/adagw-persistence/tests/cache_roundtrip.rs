//! ---
//! gw_section: "03-persistence-logging"
//! gw_subsection: "tests"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Round-trip of the priority cache through its backing file."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::sync::Arc;

use adagw_common::ManualClock;
use adagw_msg::{CacheRecordEncoder, DeviceReading, GatewayIdentity, Message, ModuleValue, Priority};
use adagw_persistence::{CacheOptions, PriorityCache};
use tempfile::tempdir;

fn identity() -> GatewayIdentity {
    GatewayIdentity {
        adapter_id: "0xA1".into(),
        fw_version: "3.0".into(),
        protocol_version: "1.1".into(),
    }
}

fn open(path: &std::path::Path) -> PriorityCache {
    PriorityCache::new(CacheOptions::new(path), &identity()).with_encoder(Arc::new(CacheRecordEncoder))
}

fn tuples(messages: &[Message]) -> Vec<(Priority, i64, u64, Vec<ModuleValue>)> {
    messages
        .iter()
        .map(|m| (m.priority, m.timestamp, m.device.euid, m.device.values.clone()))
        .collect()
}

#[test]
fn persisted_cache_reloads_identically() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state").join("permanent.cache");
    let first = open(&path);

    let priorities = [
        Priority::History,
        Priority::Sensor,
        Priority::Param,
        Priority::Actuator,
        Priority::Registration,
    ];
    for (i, priority) in priorities.iter().cycle().take(12).enumerate() {
        let i = i as u64;
        let device = DeviceReading {
            euid: 0xFF00 + i,
            device_type_id: (i % 4) as u16,
            version: 2,
            name: None,
            values: vec![ModuleValue::new(1, i as f32 * 0.5), ModuleValue::unavailable(2)],
        };
        let msg = Message::data(&identity(), 1_700_000_000 + (i as i64 % 3), device).with_priority(*priority);
        assert!(first.enqueue(msg));
    }
    let before = first.snapshot().unwrap();
    assert_eq!(first.persist().unwrap(), 12);

    let second = open(&path);
    let clock = ManualClock::new(1_700_000_100);
    assert_eq!(second.reload(&clock).unwrap(), 12);
    let after = second.snapshot().unwrap();

    assert_eq!(tuples(&before), tuples(&after));
    assert!(after.iter().all(|m| m.adapter_id == "0xA1"));
}

#[test]
fn corrupted_lines_do_not_block_reload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("permanent.cache");
    std::fs::write(
        &path,
        "time;1700000000;euid;0x10;device_id;1;priority;3;pairs;1\n\
         module_id;0x01;value;5\n\
         time;oops;euid;0x11;pairs;0\n\
         time;1700000002;euid;18;device_id;1;firmware;x;pairs;1\n\
         module_id;0x02;value;7.5\n",
    )
    .unwrap();

    let cache = open(&path);
    assert_eq!(cache.reload(&ManualClock::new(1_700_000_100)).unwrap(), 2);
    let first = cache.drain_one().unwrap();
    assert_eq!(first.device.euid, 0x10);
    assert_eq!(first.priority, Priority::Actuator);
    let second = cache.drain_one().unwrap();
    assert_eq!(second.device.euid, 18);
    assert_eq!(second.device.values, vec![ModuleValue::new(2, 7.5)]);
    assert!(cache.drain_one().is_none());
}

#[test]
fn stray_module_lines_are_not_restored() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("permanent.cache");
    std::fs::write(
        &path,
        "time;1700000000;euid;16;device_id;1\n\
         module_id;0x01;value;5\n",
    )
    .unwrap();

    let cache = open(&path);
    assert_eq!(cache.reload(&ManualClock::new(1_700_000_100)).unwrap(), 1);
    let only = cache.drain_one().unwrap();
    assert_eq!((only.device.euid, only.timestamp), (16, 1_700_000_000));
    assert!(only.valid);
    assert!(cache.is_empty());
}

#[test]
fn missing_file_is_not_an_error() {
    let dir = tempdir().unwrap();
    let cache = open(&dir.path().join("absent.cache"));
    assert_eq!(cache.reload(&ManualClock::new(0)).unwrap(), 0);
    assert!(cache.is_empty());
}
