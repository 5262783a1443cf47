//! Shared fixtures: a channel harness with an inspectable buffer, and
//! hand-laid-out test messages standing in for codegen output.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mlos_core::channel::{ChannelSync, SharedChannel};
use mlos_core::dispatch::DispatchEntry;
use mlos_core::hash::fnv1a64;
use mlos_core::messages::{
    RegisterSettingsAssemblyRequest, RegisterSharedConfigMemoryRegionRequest, ShmMessage,
    TerminateReaderThreadRequest,
};
use mlos_core::wake::WakePolicy;
use mlos_primitives::{HeapRegion, Region};

/// A channel over a leaked heap buffer the test can still inspect.
pub struct ChannelHarness<P: WakePolicy> {
    pub channel: SharedChannel<P>,
    pub buffer: Region,
    pub sync: &'static ChannelSync,
}

pub fn channel_harness<P: WakePolicy>(size: usize, policy: P) -> ChannelHarness<P> {
    let sync: &'static ChannelSync = Box::leak(Box::new(ChannelSync::new()));
    let heap: &'static HeapRegion = Box::leak(Box::new(HeapRegion::new_zeroed(size)));
    let buffer = heap.region();
    let channel = unsafe { SharedChannel::new(sync, buffer, policy) };
    ChannelHarness {
        channel,
        buffer,
        sync,
    }
}

// ── test messages (type indices continue past the core's 1..=3) ───────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl ShmMessage for Point {
    const TYPE_INDEX: u32 = 4;
    const TYPE_HASH: u64 = fnv1a64(b"Mlos.UnitTest.Point");

    fn serialized_size(&self) -> usize {
        8
    }

    fn serialize(&self, payload: &mut [u8]) {
        payload[0..4].copy_from_slice(&self.x.to_le_bytes());
        payload[4..8].copy_from_slice(&self.y.to_le_bytes());
    }
}

impl Point {
    pub fn deserialize(payload: &[u8]) -> Self {
        Self {
            x: f32::from_le_bytes(payload[0..4].try_into().unwrap()),
            y: f32::from_le_bytes(payload[4..8].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl ShmMessage for Point3d {
    const TYPE_INDEX: u32 = 5;
    const TYPE_HASH: u64 = fnv1a64(b"Mlos.UnitTest.Point3D");

    fn serialized_size(&self) -> usize {
        24
    }

    fn serialize(&self, payload: &mut [u8]) {
        payload[0..8].copy_from_slice(&self.x.to_le_bytes());
        payload[8..16].copy_from_slice(&self.y.to_le_bytes());
        payload[16..24].copy_from_slice(&self.z.to_le_bytes());
    }
}

/// A message with one variable-length string field, laid out the way
/// codegen emits string views: a relative offset, a byte length, then
/// the bytes themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringViewElement {
    pub text: String,
}

impl StringViewElement {
    /// Fixed part: u64 offset + u32 length + u32 pad.
    pub const FIXED_SIZE: usize = 16;

    /// Verify the embedded offset/length and extract the string, the
    /// way generated `VerifyVariableData` does.
    pub fn verify_and_read(payload: &[u8]) -> Option<String> {
        if payload.len() < Self::FIXED_SIZE {
            return None;
        }
        let offset = u64::from_le_bytes(payload[0..8].try_into().unwrap()) as usize;
        let length = u32::from_le_bytes(payload[8..12].try_into().unwrap()) as usize;

        // The string must start exactly past the fixed part and fit the
        // payload.
        if offset != Self::FIXED_SIZE || offset + length > payload.len() {
            return None;
        }
        Some(String::from_utf8_lossy(&payload[offset..offset + length]).into_owned())
    }
}

impl ShmMessage for StringViewElement {
    const TYPE_INDEX: u32 = 6;
    const TYPE_HASH: u64 = fnv1a64(b"Mlos.UnitTest.StringViewElement");

    fn serialized_size(&self) -> usize {
        Self::FIXED_SIZE + self.text.len()
    }

    fn serialize(&self, payload: &mut [u8]) {
        payload[0..8].copy_from_slice(&(Self::FIXED_SIZE as u64).to_le_bytes());
        payload[8..12].copy_from_slice(&(self.text.len() as u32).to_le_bytes());
        payload[12..16].fill(0);
        payload[16..16 + self.text.len()].copy_from_slice(self.text.as_bytes());
    }
}

// ── dispatch tables ────────────────────────────────────────────────────────

/// Counters shared between a test and its dispatch handlers.
#[derive(Default)]
pub struct DispatchCounts {
    pub points: AtomicUsize,
    pub point3ds: AtomicUsize,
    pub strings: AtomicUsize,
    pub terminates: AtomicUsize,
}

impl DispatchCounts {
    pub fn points(&self) -> usize {
        self.points.load(Ordering::Relaxed)
    }

    pub fn point3ds(&self) -> usize {
        self.point3ds.load(Ordering::Relaxed)
    }
}

/// Full table covering the core messages (indices 1..=3) and the test
/// messages above (4..=6).
pub fn dispatch_table(counts: Arc<DispatchCounts>) -> Vec<DispatchEntry> {
    let terminates = counts.clone();
    let points = counts.clone();
    let point3ds = counts.clone();
    let strings = counts;

    vec![
        DispatchEntry::for_message::<RegisterSettingsAssemblyRequest, _>(|payload| {
            RegisterSettingsAssemblyRequest::deserialize(payload).is_some()
        }),
        DispatchEntry::for_message::<RegisterSharedConfigMemoryRegionRequest, _>(|payload| {
            RegisterSharedConfigMemoryRegionRequest::deserialize(payload).is_some()
        }),
        DispatchEntry::for_message::<TerminateReaderThreadRequest, _>(move |_| {
            terminates.terminates.fetch_add(1, Ordering::Relaxed);
            true
        }),
        DispatchEntry::for_message::<Point, _>(move |_| {
            points.points.fetch_add(1, Ordering::Relaxed);
            true
        }),
        DispatchEntry::for_message::<Point3d, _>(move |_| {
            point3ds.point3ds.fetch_add(1, Ordering::Relaxed);
            true
        }),
        DispatchEntry::for_message::<StringViewElement, _>(move |payload| {
            let valid = StringViewElement::verify_and_read(payload).is_some();
            if valid {
                strings.strings.fetch_add(1, Ordering::Relaxed);
            }
            valid
        }),
    ]
}

/// Route fabric logs into the test harness output. Idempotent.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Unique name for OS objects so concurrent tests never collide.
pub fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "mlos-it.{}.{}.{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
