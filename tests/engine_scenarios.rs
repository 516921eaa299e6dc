//! End-to-end rule engine scenarios over the in-memory and SQLite stores.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use common::{BUFFER_MANIFEST, IMEI, JAMMER_MANIFEST, Sample, jammer_samples, payload};
use fleet_rule_engine::audit::MemoryAuditSink;
use fleet_rule_engine::audit::snapshot::{ALERT_STATES_SECTION, PACKET_SECTION};
use fleet_rule_engine::core::config::Config;
use fleet_rule_engine::engine::Engine;
use fleet_rule_engine::store::{
    AlertGuardStore, GeofenceShape, MemoryStore, RuleDefinition, ShapeKind, SqliteStore,
};

fn jammer_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.upsert_rule(
        RuleDefinition::new("buffer", "native:buffer_update")
            .with_priority(300)
            .with_manifest(BUFFER_MANIFEST),
    );
    store.upsert_rule(
        RuleDefinition::new("jammer", "native:jammer_detection")
            .with_priority(200)
            .with_manifest(JAMMER_MANIFEST),
    );
    store
}

fn engine(store: &Arc<MemoryStore>, progress: bool) -> (Engine, Arc<MemoryAuditSink>) {
    let mut config = Config::default();
    config.audit.progress_enabled = progress;
    let sink = Arc::new(MemoryAuditSink::new());
    let engine = Engine::with_stores(config, store.clone(), sink.clone()).unwrap();
    (engine, sink)
}

fn last_post_stop_reason(sink: &MemoryAuditSink, rule: &str) -> Option<String> {
    sink.progress()
        .into_iter()
        .rev()
        .find(|e| e.rule_name == rule && e.is_post)
        .map(|e| e.stop_reason)
}

// ──────────────────── jammer ────────────────────

#[test]
fn jammer_alert_fires_once_per_episode() {
    let store = jammer_store();
    let (engine, sink) = engine(&store, true);

    let report = engine.process(&payload(IMEI, &jammer_samples())).unwrap();
    assert_eq!(report.packets, 11);
    assert_eq!(report.rule_errors, 0);
    assert_eq!(report.alerts_won, 1);

    let alerts = sink.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].imei, IMEI);
    assert_eq!(alerts[0].rule_name, "jammer");
    assert_eq!(alerts[0].stage_reached, "alert_sent");
    assert_eq!(alerts[0].level, "critical");
    assert!(alerts[0].alert_fired);
    assert!(store.is_alert_sent(IMEI, "jammer").unwrap());

    let repeat = engine
        .process(&payload(IMEI, &[Sample::invalid(4, 10.0, 4)]))
        .unwrap();
    assert_eq!(repeat.alerts_won, 0);
    assert_eq!(sink.alerts().len(), 1);
    assert_eq!(
        last_post_stop_reason(&sink, "jammer").as_deref(),
        Some("alert_already_sent")
    );
}

#[test]
fn jammer_stays_sent_after_valid_fix() {
    let store = jammer_store();
    let (engine, sink) = engine(&store, false);

    let mut samples: Vec<Sample> = (31..=40).rev().map(|m| Sample::valid(m, 10.0, 5)).collect();
    samples.push(Sample::invalid(25, 10.0, 4));
    samples.push(Sample::valid(20, 10.0, 5));
    samples.push(Sample::invalid(10, 10.0, 4));

    let report = engine.process(&payload(IMEI, &samples)).unwrap();
    assert_eq!(report.alerts_won, 1);
    assert_eq!(sink.alerts().len(), 1);
    assert!(sink.progress().is_empty());
    assert!(store.is_alert_sent(IMEI, "jammer").unwrap());
}

#[test]
fn jammer_suppressed_inside_safe_zone() {
    let store = jammer_store();
    store.add_geofence(
        "Taller",
        GeofenceShape {
            id: 0,
            name: "central yard".to_string(),
            kind: ShapeKind::Circle {
                center_lat: 19.432_608,
                center_lon: -99.133_209,
                radius_m: 500.0,
            },
        },
    );
    let (engine, sink) = engine(&store, true);

    let report = engine.process(&payload(IMEI, &jammer_samples())).unwrap();
    assert_eq!(report.alerts_won, 0);
    assert!(sink.alerts().is_empty());
    assert_eq!(
        last_post_stop_reason(&sink, "jammer").as_deref(),
        Some("inside_safe_zone")
    );
    assert!(!store.is_alert_sent(IMEI, "jammer").unwrap());
}

#[test]
fn strong_signal_does_not_match() {
    let store = jammer_store();
    let (engine, sink) = engine(&store, true);

    let mut samples: Vec<Sample> = (11..=20).rev().map(|m| Sample::valid(m, 10.0, 25)).collect();
    samples.push(Sample::invalid(5, 10.0, 25));
    engine.process(&payload(IMEI, &samples)).unwrap();

    assert!(sink.alerts().is_empty());
    assert_eq!(
        last_post_stop_reason(&sink, "jammer").as_deref(),
        Some("signal_pattern_not_matched")
    );
}

// ──────────────────── buffers and metrics ────────────────────

#[test]
fn buffer_keeps_last_ten_and_averages_speed() {
    let store = jammer_store();
    let (engine, _sink) = engine(&store, false);

    let samples: Vec<Sample> = (1..=12)
        .rev()
        .map(|m| Sample::valid(m, if m % 2 == 0 { 5.0 } else { 15.0 }, 10))
        .collect();
    engine.process(&payload(IMEI, &samples)).unwrap();

    let buffer = engine.registry().buffers().get_buffer(IMEI).unwrap();
    assert_eq!(buffer.len(), 10);
    assert!(buffer.is_full());
    assert_eq!(engine.registry().metrics().average_speed_90min(IMEI), 36);
    assert_eq!(engine.registry().metrics().average_gsm_last5(IMEI), 10);
}

#[test]
fn stale_packets_do_not_enter_the_buffer() {
    let store = jammer_store();
    let (engine, sink) = engine(&store, true);

    engine.process(&payload(IMEI, &[Sample::valid(5, 10.0, 10)])).unwrap();
    engine.process(&payload(IMEI, &[Sample::valid(10, 10.0, 10)])).unwrap();

    let buffer = engine.registry().buffers().get_buffer(IMEI).unwrap();
    assert_eq!(buffer.len(), 1);
    assert_eq!(
        last_post_stop_reason(&sink, "buffer").as_deref(),
        Some("stale_sample")
    );
}

#[test]
fn devices_are_isolated() {
    let store = jammer_store();
    let (engine, sink) = engine(&store, false);

    engine.process(&payload(IMEI, &jammer_samples())).unwrap();
    engine
        .process(&payload("860000000000002", &[Sample::invalid(1, 10.0, 4)]))
        .unwrap();

    assert_eq!(sink.alerts().len(), 1);
    assert_eq!(engine.registry().buffers().device_count(), 2);
    assert!(!store.is_alert_sent("860000000000002", "jammer").unwrap());
}

// ──────────────────── audit ────────────────────

#[test]
fn progress_toggle_and_clear() {
    let store = jammer_store();
    let (engine, sink) = engine(&store, false);

    engine.process(&payload(IMEI, &[Sample::valid(3, 10.0, 10)])).unwrap();
    assert!(sink.progress().is_empty());

    engine.recorder().enable();
    engine.process(&payload(IMEI, &[Sample::valid(2, 10.0, 10)])).unwrap();
    let rows = sink.progress();
    // pre and post rows for both rules
    assert_eq!(rows.len(), 4);
    assert_eq!(rows.iter().filter(|r| r.is_post).count(), 2);
    assert!(rows.iter().any(|r| !r.is_post && r.stop_reason == "pending"));

    engine.recorder().disable();
    engine.process(&payload(IMEI, &[Sample::valid(1, 10.0, 10)])).unwrap();
    assert_eq!(sink.progress().len(), 4);

    assert_eq!(engine.recorder().clear().unwrap(), 4);
    assert!(sink.progress().is_empty());
    assert!(!engine.recorder().is_progress_enabled());
}

#[test]
fn snapshot_sections_follow_manifest() {
    let store = jammer_store();
    let (engine, sink) = engine(&store, true);

    engine.process(&payload(IMEI, &jammer_samples())).unwrap();

    let buffer_post = sink
        .progress()
        .into_iter()
        .find(|e| e.rule_name == "buffer" && e.is_post)
        .unwrap();
    assert!(buffer_post.snapshot.contains_key(PACKET_SECTION));
    assert!(buffer_post.snapshot.contains_key(ALERT_STATES_SECTION));
    assert!(buffer_post.snapshot.len() > 2);

    let alert = &sink.alerts()[0];
    assert!(alert.snapshot.contains_key(PACKET_SECTION));
    assert!(alert.snapshot.contains_key(ALERT_STATES_SECTION));
    assert_eq!(alert.step_number, 2);
    assert_eq!(alert.salience, 200);
}

#[test]
fn rules_without_manifest_are_not_audited() {
    let store = Arc::new(MemoryStore::new());
    store.upsert_rule(RuleDefinition::new("buffer", "native:buffer_update"));
    let (engine, sink) = engine(&store, true);

    let report = engine.process(&payload(IMEI, &[Sample::valid(1, 10.0, 10)])).unwrap();
    assert_eq!(report.rules_run, 1);
    assert!(sink.progress().is_empty());
}

// ──────────────────── concurrency ────────────────────

#[test]
fn pool_processes_many_devices() {
    let store = jammer_store();
    let (engine, sink) = engine(&store, false);
    let pool = engine.start_pool().unwrap();

    let devices: Vec<String> = (0..6).map(|i| format!("86000000000010{i}")).collect();
    for imei in &devices {
        assert!(pool.submit(payload(imei, &jammer_samples())));
    }
    let stats = pool.shutdown();

    assert_eq!(stats.processed, 6);
    assert_eq!(stats.failed, 0);
    assert_eq!(sink.alerts().len(), 6);
    for imei in &devices {
        assert!(store.is_alert_sent(imei, "jammer").unwrap());
    }
}

#[test]
fn sqlite_alert_guard_has_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("guard.sqlite3")).unwrap());
    let winners = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let winners = Arc::clone(&winners);
            thread::spawn(move || {
                if store.try_mark_alert_sent(IMEI, "jammer").unwrap() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert!(store.is_alert_sent(IMEI, "jammer").unwrap());
    assert!(!store.try_mark_alert_sent(IMEI, "jammer").unwrap());
    assert!(!store.is_alert_sent(IMEI, "offline").unwrap());
}
