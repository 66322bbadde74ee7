//! End-to-end runs of the monitor against a scripted game process.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ngplus_core::memory::{MockMemory, MockMemoryBuilder, MockProcessProvider};
use ngplus_core::{
    FileLevelStore, FixedRowCodec, LevelStore, MemoryLevelStore, MonitorConfig, MonitorHandle,
    MonitorLoop, MonitorState, ReadMemory, RecordCodec, RecordKind, ScalingEngine, ScalingTable,
    ShutdownSignal,
};
use tempfile::tempdir;

const EXE: &str = "eldenring.exe";
const TITLE: &str = "ELDEN RING™";

const BASE: u64 = 0x1_4000_0000;
const SLOT: u64 = BASE + 0x800;
const GAME_DATA: u64 = 0x2000_0000;
const NG_FLAG: u64 = GAME_DATA + 0x120;

const PARAMS: u64 = 0x7FF4_0000_0000;
const EFFECTS: u64 = PARAMS + 0x100;
const EFFECTS_COPY: u64 = PARAMS + 0x2000;
const REWARDS: u64 = PARAMS + 0x1000;

const ROW: i32 = 7400;
const ROW_MAX_HP: f64 = 3.434;
const BOSS: i32 = 10000800;
const BOSS_REWARD: f64 = 20000.0;
const BIG_BOSS: i32 = 19000800;

fn engine() -> ScalingEngine {
    ScalingEngine::new(ScalingTable::builtin().unwrap())
}

fn encoded(kind: RecordKind, level: u32) -> Vec<u8> {
    FixedRowCodec.encode(&engine().record(kind, level).unwrap()).unwrap()
}

/// Game code, the GameDataMan global, and a param heap holding the records
/// as they look at `level`.
fn game(level: u32, with_rewards: bool) -> MockMemory {
    let mut code = vec![0xCCu8; 0x1000];
    let disp = (SLOT - (BASE + 0x40 + 7)) as i32;
    code[0x40..0x43].copy_from_slice(&[0x48, 0x8B, 0x05]);
    code[0x43..0x47].copy_from_slice(&disp.to_le_bytes());
    code[0x47..0x52].copy_from_slice(&[0x48, 0x85, 0xC0, 0x74, 0x05, 0x48, 0x8B, 0x40, 0x58, 0xC3, 0xC3]);

    let mut builder = MockMemoryBuilder::new()
        .base_address(BASE)
        .region(BASE, code)
        .write_u64(SLOT, GAME_DATA)
        .region(GAME_DATA, vec![0u8; 0x200])
        .region(PARAMS, vec![0u8; 0x4000])
        .write(EFFECTS, &encoded(RecordKind::SpEffectParam, level))
        .write(EFFECTS_COPY, &encoded(RecordKind::SpEffectParam, level));
    if with_rewards {
        builder = builder.write(REWARDS, &encoded(RecordKind::GameAreaParam, level));
    }
    builder.build()
}

fn config(scan_attempts: u32, scan_delay: Duration) -> MonitorConfig {
    MonitorConfig::builder()
        .poll_interval(Duration::from_millis(1))
        .tick_interval(Duration::from_millis(1))
        .min_lifetime(Duration::ZERO)
        .scan_retry(scan_attempts, scan_delay)
        .build()
}

fn monitor(
    provider: &MockProcessProvider,
    store: Box<dyn LevelStore>,
) -> (MonitorLoop<MockProcessProvider>, MonitorHandle) {
    monitor_with(provider, store, config(1, Duration::ZERO))
}

fn monitor_with(
    provider: &MockProcessProvider,
    store: Box<dyn LevelStore>,
    config: MonitorConfig,
) -> (MonitorLoop<MockProcessProvider>, MonitorHandle) {
    MonitorLoop::new(
        provider.clone(),
        config,
        engine(),
        store,
        Arc::new(ShutdownSignal::new()),
    )
    .unwrap()
}

fn tick_until<F>(monitor: &mut MonitorLoop<MockProcessProvider>, mut done: F)
where
    F: FnMut(&MonitorLoop<MockProcessProvider>) -> bool,
{
    for _ in 0..2000 {
        monitor.tick();
        if done(monitor) {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("monitor did not reach the expected state");
}

fn wait_for_level(monitor: &mut MonitorLoop<MockProcessProvider>, handle: &MonitorHandle, level: u32) {
    tick_until(monitor, |_| handle.current() == level && handle.status().settled);
}

fn record_label(handle: &MonitorHandle, kind: RecordKind) -> String {
    handle
        .status()
        .records
        .into_iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, label)| label)
        .unwrap()
}

fn live_value(memory: &MockMemory, kind: RecordKind, address: u64, row: i32, field: &str) -> f64 {
    let schema = kind.schema();
    let len = FixedRowCodec.encoded_len(&schema, engine().record(kind, 1).unwrap().rows.len());
    let record = FixedRowCodec.decode(&memory.snapshot(address, len), &schema).unwrap();
    record.row(row).unwrap().value(field).unwrap()
}

fn assert_close(actual: f64, expected: f64) {
    assert!((actual - expected).abs() < 1e-4, "{} != {}", actual, expected);
}

#[test]
fn test_level_five_scales_every_copy() {
    let provider = MockProcessProvider::new();
    let memory = provider.spawn(1, EXE, Some(TITLE), game(1, true));
    let dir = tempdir().unwrap();
    let level_file = dir.path().join("LAST_NG_LEVEL.cfg");
    let (mut monitor, handle) = monitor(&provider, Box::new(FileLevelStore::new(&level_file)));

    handle.request_absolute(5);
    wait_for_level(&mut monitor, &handle, 5);

    for address in [EFFECTS, EFFECTS_COPY] {
        let value = live_value(&memory, RecordKind::SpEffectParam, address, ROW, "maxHpRate");
        assert_close(value, ROW_MAX_HP * 1.3);
    }
    let reward = live_value(&memory, RecordKind::GameAreaParam, REWARDS, BOSS, "bonusSoul_single");
    assert_eq!(reward, (BOSS_REWARD * 1.225).floor());
    assert_eq!(memory.read_i32(NG_FLAG).unwrap(), 1);
    assert_eq!(std::fs::read_to_string(&level_file).unwrap(), "5");
}

#[test]
fn test_level_twenty_extends_past_the_tiers() {
    let provider = MockProcessProvider::new();
    let memory = provider.spawn(1, EXE, Some(TITLE), game(1, true));
    let (mut monitor, handle) = monitor(&provider, Box::new(MemoryLevelStore::with_level(1)));

    handle.request_absolute(20);
    wait_for_level(&mut monitor, &handle, 20);

    let value = live_value(&memory, RecordKind::SpEffectParam, EFFECTS, ROW, "maxHpRate");
    assert_close(value, ROW_MAX_HP * (1.4 + 13.0 * 0.05));
    let reward = live_value(&memory, RecordKind::GameAreaParam, REWARDS, BOSS, "bonusSoul_multi");
    assert_eq!(reward, (BOSS_REWARD * (1.0 * (1.275 + 13.0 * 0.025))).floor());
}

#[test]
fn test_level_zero_restores_base_and_clears_host_flag() {
    let provider = MockProcessProvider::new();
    let memory = provider.spawn(1, EXE, Some(TITLE), game(1, true));
    let (mut monitor, handle) = monitor(&provider, Box::new(MemoryLevelStore::with_level(1)));

    handle.request_absolute(8);
    wait_for_level(&mut monitor, &handle, 8);
    assert_eq!(memory.read_i32(NG_FLAG).unwrap(), 1);

    assert_eq!(handle.request_relative(-100), 0);
    wait_for_level(&mut monitor, &handle, 0);

    let value = live_value(&memory, RecordKind::SpEffectParam, EFFECTS, ROW, "maxHpRate");
    assert_close(value, ROW_MAX_HP);
    let reward = live_value(&memory, RecordKind::GameAreaParam, REWARDS, BOSS, "bonusSoul_single");
    assert_eq!(reward, BOSS_REWARD);
    assert_eq!(memory.read_i32(NG_FLAG).unwrap(), 0);
}

#[test]
fn test_pending_request_is_applied_after_restart() {
    let provider = MockProcessProvider::new();
    provider.spawn(1, EXE, Some(TITLE), game(1, true));
    let (mut monitor, handle) = monitor(&provider, Box::new(MemoryLevelStore::with_level(1)));
    wait_for_level(&mut monitor, &handle, 1);

    provider.exit(1);
    tick_until(&mut monitor, |m| m.state() == MonitorState::WaitingForAttach);

    handle.request_absolute(5);
    for _ in 0..10 {
        monitor.tick();
    }
    assert_eq!(handle.current(), 1);
    assert_eq!(handle.requested(), 5);

    let restarted = provider.spawn(2, EXE, Some(TITLE), game(1, true));
    wait_for_level(&mut monitor, &handle, 5);

    let value = live_value(&restarted, RecordKind::SpEffectParam, EFFECTS, ROW, "maxHpRate");
    assert_close(value, ROW_MAX_HP * 1.3);
    assert_eq!(handle.status().pid, Some(2));
}

#[test]
fn test_records_already_at_saved_level_are_found() {
    let provider = MockProcessProvider::new();
    let memory = provider.spawn(1, EXE, Some(TITLE), game(6, true));
    let (mut monitor, handle) = monitor(&provider, Box::new(MemoryLevelStore::with_level(6)));

    handle.request_relative(1);
    wait_for_level(&mut monitor, &handle, 7);

    let value = live_value(&memory, RecordKind::SpEffectParam, EFFECTS, ROW, "maxHpRate");
    assert_close(value, ROW_MAX_HP * 1.4);
}

#[test]
fn test_missing_record_does_not_block_the_others() {
    let provider = MockProcessProvider::new();
    let memory = provider.spawn(1, EXE, Some(TITLE), game(1, false));
    let (mut monitor, handle) = monitor(&provider, Box::new(MemoryLevelStore::with_level(1)));

    handle.request_absolute(3);
    wait_for_level(&mut monitor, &handle, 3);

    let value = live_value(&memory, RecordKind::SpEffectParam, EFFECTS, ROW, "maxHpRate");
    assert_close(value, ROW_MAX_HP * 1.15);
    assert_eq!(memory.snapshot(REWARDS, 4), vec![0u8; 4]);

    assert_eq!(record_label(&handle, RecordKind::GameAreaParam), "not located");
}

#[test]
fn test_huge_level_keeps_rewards_located() {
    let provider = MockProcessProvider::new();
    let memory = provider.spawn(1, EXE, Some(TITLE), game(1, true));
    let (mut monitor, handle) = monitor(&provider, Box::new(MemoryLevelStore::with_level(1)));

    handle.request_absolute(400_000);
    wait_for_level(&mut monitor, &handle, 400_000);
    assert!(record_label(&handle, RecordKind::GameAreaParam).starts_with("located"));
    let reward = live_value(&memory, RecordKind::GameAreaParam, REWARDS, BIG_BOSS, "bonusSoul_single");
    assert_eq!(reward, u32::MAX as f64);

    handle.request_absolute(5);
    wait_for_level(&mut monitor, &handle, 5);
    let reward = live_value(&memory, RecordKind::GameAreaParam, REWARDS, BOSS, "bonusSoul_single");
    assert_eq!(reward, (BOSS_REWARD * 1.225).floor());
}

#[test]
fn test_restart_during_scan_retries_locates_new_process() {
    let provider = MockProcessProvider::new();
    let old = provider.spawn(1, EXE, Some(TITLE), game(1, false));
    let (mut monitor, handle) = monitor_with(
        &provider,
        Box::new(MemoryLevelStore::with_level(1)),
        config(200, Duration::from_millis(50)),
    );

    tick_until(&mut monitor, |_| {
        record_label(&handle, RecordKind::GameAreaParam).contains("scanning")
    });

    provider.exit(1);
    let restarted = provider.spawn(2, EXE, Some(TITLE), game(1, true));
    tick_until(&mut monitor, |_| {
        handle.status().pid == Some(2)
            && record_label(&handle, RecordKind::GameAreaParam).starts_with("located")
    });

    handle.request_absolute(5);
    wait_for_level(&mut monitor, &handle, 5);
    let reward = live_value(&restarted, RecordKind::GameAreaParam, REWARDS, BOSS, "bonusSoul_single");
    assert_eq!(reward, (BOSS_REWARD * 1.225).floor());

    // the cancelled scan let go of the old process
    for _ in 0..100 {
        if Arc::strong_count(&old) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(Arc::strong_count(&old), 1);
}

#[test]
fn test_debug_requests_are_served_by_the_monitor() {
    let provider = MockProcessProvider::new();
    provider.spawn(1, EXE, Some(TITLE), game(1, true));
    let (mut monitor, handle) = monitor(&provider, Box::new(MemoryLevelStore::with_level(1)));
    wait_for_level(&mut monitor, &handle, 1);

    let asker = {
        let handle = handle.clone();
        thread::spawn(move || {
            let row = handle.read_row(RecordKind::SpEffectParam, ROW).unwrap();
            handle.write_internal_level(3).unwrap();
            let internal = handle.read_internal_level().unwrap();
            (row, internal)
        })
    };
    while !asker.is_finished() {
        monitor.tick();
        thread::sleep(Duration::from_millis(1));
    }
    let (row, internal) = asker.join().unwrap();

    assert_close(row.unwrap().value("maxHpRate").unwrap(), ROW_MAX_HP);
    assert_eq!(internal, 3);
}

#[test]
fn test_run_stops_on_shutdown() {
    let provider = MockProcessProvider::new();
    let (monitor, handle) = monitor(&provider, Box::new(MemoryLevelStore::default()));
    let runner = thread::spawn(move || monitor.run());

    thread::sleep(Duration::from_millis(20));
    handle.shutdown();
    runner.join().unwrap();
    assert_eq!(handle.status().state, MonitorState::WaitingForAttach);
}
