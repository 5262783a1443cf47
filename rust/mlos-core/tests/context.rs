//! MlosContext end-to-end over in-process regions.

mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use mlos_core::MlosContext;
use mlos_core::config::{ComponentConfig, ConfigRecord};
use mlos_core::dictionary::ConfigDisposition;
use mlos_core::hash::{fnv1a64, fnv1a64_seeded};
use mlos_core::messages::CORE_DISPATCH_TABLE_SIZE;

use support::{DispatchCounts, Point};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SmartCacheConfig {
    key: u32,
    cache_size: u64,
}

impl ConfigRecord for SmartCacheConfig {
    const TYPE_INDEX: u32 = 16;

    fn key_hash(&self) -> u64 {
        fnv1a64_seeded(fnv1a64(b"SmartCacheConfig"), &self.key.to_le_bytes())
    }

    fn compare_key(&self, shared_payload: &[u8]) -> bool {
        u32::from_le_bytes(shared_payload[0..4].try_into().unwrap()) == self.key
    }

    fn serialized_size(&self) -> usize {
        16
    }

    fn serialize(&self, payload: &mut [u8]) {
        payload[0..4].copy_from_slice(&self.key.to_le_bytes());
        payload[4..8].fill(0);
        payload[8..16].copy_from_slice(&self.cache_size.to_le_bytes());
    }

    fn update_from(&mut self, shared_payload: &[u8]) {
        self.key = u32::from_le_bytes(shared_payload[0..4].try_into().unwrap());
        self.cache_size = u64::from_le_bytes(shared_payload[8..16].try_into().unwrap());
    }
}

#[test]
fn internal_context_starts_and_terminates_cleanly() {
    let context = MlosContext::internal().unwrap();

    assert!(context.is_control_channel_active());
    assert!(context.is_feedback_channel_active());

    context.terminate_control_channel();
    context.terminate_feedback_channel();

    assert!(!context.is_control_channel_active());
    assert!(!context.is_feedback_channel_active());
}

#[test]
fn component_config_registration_binds_and_updates() {
    let context = MlosContext::internal().unwrap();

    let mut config = ComponentConfig::new(SmartCacheConfig {
        key: 1,
        cache_size: 100,
    });
    let disposition = context.register_component_config(&mut config).unwrap();
    assert!(matches!(disposition, ConfigDisposition::Created));
    assert!(config.is_bound());

    // A second registration of the same key adopts the stored record.
    let mut again = ComponentConfig::new(SmartCacheConfig {
        key: 1,
        cache_size: 999,
    });
    let disposition = context.register_component_config(&mut again).unwrap();
    assert!(matches!(disposition, ConfigDisposition::Existing));
    assert_eq!(again.local().cache_size, 100);
}

#[test]
fn settings_assembly_registration_is_idempotent_and_announced() {
    let context = MlosContext::internal().unwrap();

    let index = context
        .register_settings_assembly("SmartCache.SettingsRegistry", CORE_DISPATCH_TABLE_SIZE)
        .unwrap();
    assert_eq!(index, 1);

    // Registering again adopts the existing directory record.
    let index_again = context
        .register_settings_assembly("SmartCache.SettingsRegistry", CORE_DISPATCH_TABLE_SIZE)
        .unwrap();
    assert_eq!(index_again, 1);

    // The control channel carries the announcement; drain it.
    let counts = Arc::new(DispatchCounts::default());
    let table = support::dispatch_table(counts.clone());

    context.terminate_control_channel();
    while context.control_channel().wait_and_dispatch_frame(&table) {}

    // One RegisterSettingsAssemblyRequest plus the terminate marker.
    assert_eq!(counts.terminates.load(Ordering::Relaxed), 1);
}

#[test]
fn telemetry_flows_to_a_control_channel_reader() {
    let context = Arc::new(MlosContext::internal().unwrap());
    let counts = Arc::new(DispatchCounts::default());

    // The agent's reader loop, here played by a thread in this process.
    let reader = {
        let context = context.clone();
        let counts = counts.clone();
        std::thread::spawn(move || {
            let table = support::dispatch_table(counts);
            context.control_channel().process_messages(&table);
        })
    };

    const TOTAL: usize = 100;
    for i in 0..TOTAL {
        let point = Point {
            x: i as f32,
            y: 2.0 * i as f32,
        };
        assert!(context.send_telemetry_message(&point).is_sent());
    }

    while counts.points() < TOTAL {
        std::thread::yield_now();
    }

    context.terminate_control_channel();
    reader.join().unwrap();
    assert_eq!(counts.points(), TOTAL);
}

#[test]
fn feedback_termination_waits_for_reader_exit() {
    let context = Arc::new(MlosContext::internal().unwrap());
    let counts = Arc::new(DispatchCounts::default());

    let reader = {
        let context = context.clone();
        let counts = counts.clone();
        std::thread::spawn(move || {
            let table = support::dispatch_table(counts);
            context.feedback_channel().process_messages(&table);
        })
    };

    // Feedback direction: agent → target.
    assert!(
        context
            .send_feedback_message(&Point { x: 5.0, y: 6.0 })
            .is_sent()
    );
    while counts.points() < 1 {
        std::thread::yield_now();
    }

    // Blocks until the reader observed the flag and left the loop.
    context.terminate_feedback_channel();
    assert_eq!(
        context
            .feedback_channel()
            .sync()
            .active_reader_count
            .load(Ordering::Acquire),
        0
    );
    reader.join().unwrap();
}
