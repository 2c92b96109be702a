//! Property-based tests for blockwatch-core using proptest.
//!
//! These cover the queue ordering and masking rules, phase flag exclusion
//! and the kernel frame decoder.

use blockwatch_core::{
    parse_frame, Action, Attributes, Event, EventError, EventQueue, OperationFlags, Phase,
};
use proptest::prelude::*;

fn any_phase() -> impl Strategy<Value = Phase> {
    prop_oneof![
        Just(Phase::Starting),
        Just(Phase::Stopping),
        Just(Phase::Creating),
        Just(Phase::Destroying),
        Just(Phase::Resizing),
        Just(Phase::Changing),
    ]
}

fn any_action() -> impl Strategy<Value = Action> {
    prop_oneof![Just(Action::Add), Just(Action::Change), Just(Action::Remove)]
}

/// Small device name pool so masks actually hit.
fn any_device() -> impl Strategy<Value = String> {
    (0u8..4).prop_map(|n| format!("sd{}", (b'a' + n) as char))
}

fn event(action: Action, device: &str) -> Event {
    let mut attrs = Attributes::new();
    attrs.insert("DEVNAME".to_string(), format!("/dev/{}", device));
    attrs.insert("SUBSYSTEM".to_string(), "block".to_string());
    Event::new(action, attrs)
}

proptest! {
    /// Dequeue order is enqueue order.
    #[test]
    fn test_queue_is_fifo(
        items in proptest::collection::vec((any_action(), any_device()), 1..64),
    ) {
        let queue = EventQueue::new();
        let mut ids = Vec::new();
        for (action, device) in &items {
            let e = event(action.clone(), device);
            ids.push(e.id());
            prop_assert!(queue.enqueue(e));
        }
        prop_assert_eq!(queue.len(), items.len());

        let mut seen = Vec::new();
        while let Ok(e) = queue.dequeue() {
            seen.push(e.id());
        }
        prop_assert_eq!(seen, ids);
        prop_assert!(matches!(queue.dequeue(), Err(EventError::QueueEmpty)));
    }

    /// A device/action mask drops exactly the matching events and keeps the
    /// order of the rest.
    #[test]
    fn test_mask_drops_only_matching(
        items in proptest::collection::vec((any_action(), any_device()), 0..64),
        masked_device in any_device(),
        masked_action in proptest::option::of(any_action()),
    ) {
        let queue = EventQueue::new();
        queue.mask_add(Some(masked_device.as_str()), masked_action.clone());

        let mut expected = Vec::new();
        for (action, device) in &items {
            let e = event(action.clone(), device);
            let hit = *device == masked_device
                && masked_action.as_ref().map_or(true, |a| a == action);
            let id = e.id();
            prop_assert_eq!(queue.enqueue(e), !hit);
            if !hit {
                expected.push(id);
            }
        }

        let kept: Vec<u64> = queue.pending().iter().map(|e| e.id()).collect();
        prop_assert_eq!(kept, expected);
    }

    /// Removing a mask restores delivery; events queued before the mask
    /// stay queued.
    #[test]
    fn test_mask_is_enqueue_time_only(
        before in proptest::collection::vec(any_action(), 1..16),
        during in proptest::collection::vec(any_action(), 1..16),
    ) {
        let queue = EventQueue::new();
        for a in &before {
            queue.enqueue(event(a.clone(), "sda"));
        }
        let mask = queue.mask_add(Some("sda"), None);
        for a in &during {
            prop_assert!(!queue.enqueue(event(a.clone(), "sda")));
        }
        prop_assert_eq!(queue.len(), before.len());

        queue.mask_remove(mask);
        prop_assert!(queue.enqueue(event(Action::Change, "sda")));
        prop_assert_eq!(queue.len(), before.len() + 1);
    }

    /// No sequence of set/clear calls leaves more than one phase active, and
    /// a refused set never changes the active phase.
    #[test]
    fn test_flags_mutually_exclusive(
        ops in proptest::collection::vec((any_phase(), any::<bool>()), 0..64),
    ) {
        let mut flags = OperationFlags::new();
        for (phase, value) in ops {
            let before = flags.active();
            let result = flags.set(7, phase, value);
            match (before, value) {
                (Some(active), true) => {
                    let refused = matches!(
                        result,
                        Err(EventError::SynchronizationConflict { sync_id: 7, requested, active: a })
                            if requested == phase && a == active
                    );
                    prop_assert!(refused);
                    prop_assert_eq!(flags.active(), Some(active));
                }
                (None, true) => {
                    prop_assert!(result.is_ok());
                    prop_assert_eq!(flags.active(), Some(phase));
                }
                (_, false) => {
                    prop_assert!(result.is_ok());
                    prop_assert!(!flags.get(phase));
                }
            }
            let active_count = [
                Phase::Starting,
                Phase::Stopping,
                Phase::Creating,
                Phase::Destroying,
                Phase::Resizing,
                Phase::Changing,
            ]
            .iter()
            .filter(|p| flags.get(**p))
            .count();
            prop_assert!(active_count <= 1);
        }
    }

    /// Kernel frames decode every KEY=VALUE field and qualify DEVNAME.
    #[test]
    fn test_kernel_frame_decodes(
        action in prop_oneof![Just("add"), Just("change"), Just("remove")],
        dev in "[a-z]{2,4}[0-9]{0,2}",
        extra in proptest::collection::btree_map("[A-Z_]{3,10}", "[a-zA-Z0-9_.-]{0,12}", 0..8),
    ) {
        let devpath = format!("/devices/virtual/block/{}", dev);
        let mut frame = format!("{}@{}\0", action, devpath).into_bytes();
        let mut fields = vec![
            format!("ACTION={}", action),
            format!("DEVPATH={}", devpath),
            format!("DEVNAME={}", dev),
        ];
        for (k, v) in &extra {
            if !matches!(k.as_str(), "ACTION" | "DEVPATH" | "DEVNAME") {
                fields.push(format!("{}={}", k, v));
            }
        }
        for f in &fields {
            frame.extend_from_slice(f.as_bytes());
            frame.push(0);
        }

        let attrs = parse_frame(&frame).unwrap();
        prop_assert_eq!(attrs.get("ACTION").map(String::as_str), Some(action));
        prop_assert_eq!(attrs.get("DEVNAME").cloned(), Some(format!("/dev/{}", dev)));
        for (k, v) in &extra {
            if !matches!(k.as_str(), "ACTION" | "DEVPATH" | "DEVNAME") {
                prop_assert_eq!(attrs.get(k), Some(v));
            }
        }
    }

    /// Arbitrary bytes never panic the decoder.
    #[test]
    fn test_frame_decoder_total(buf in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = parse_frame(&buf);
    }
}
