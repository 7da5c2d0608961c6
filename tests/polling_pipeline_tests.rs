//! End-to-end pipeline tests through the polling backend.
//!
//! The polling backend has no platform dependencies, so these tests drive
//! the full command/ack/event path deterministically: hub -> polling thread
//! -> snapshot diff -> hub -> embedder callbacks.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use vigil::{
    ChannelDelivery, ChannelId, ConfigureOptions, Event, EntryKind, FileAction, Hub, WatchOptions,
};

type AckRecord = Arc<Mutex<Vec<Result<Option<ChannelId>, String>>>>;

fn pump_until(hub: &mut Hub, timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        hub.handle_events_timeout(Duration::from_millis(20));
    }
}

fn fast_hub() -> Hub {
    let mut hub = Hub::new();
    hub.configure(
        ConfigureOptions {
            polling_interval: Some(25),
            polling_throttle: Some(25),
            ..ConfigureOptions::default()
        },
        Box::new(|result| assert!(result.is_ok())),
    )
    .unwrap();
    hub
}

fn ack_recorder() -> (AckRecord, vigil::AckCallback) {
    let record: AckRecord = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&record);
    (record, Box::new(move |result| sink.lock().unwrap().push(result)))
}

fn event_recorder() -> (Arc<Mutex<Vec<Event>>>, vigil::EventCallback) {
    let record: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&record);
    let callback = Box::new(move |delivery: ChannelDelivery| {
        if let ChannelDelivery::Events(events) = delivery {
            sink.lock().unwrap().extend(events);
        }
    });
    (record, callback)
}

/// Watch `root` through the polling backend and wait for the ack.
fn watch_polling(
    hub: &mut Hub,
    root: &Path,
    recursive: bool,
) -> (ChannelId, Arc<Mutex<Vec<Event>>>) {
    let (acks, ack_callback) = ack_recorder();
    let (events, event_callback) = event_recorder();
    hub.watch(
        root,
        WatchOptions {
            poll: true,
            recursive,
        },
        ack_callback,
        event_callback,
    )
    .unwrap();

    assert!(pump_until(hub, Duration::from_secs(5), || !acks
        .lock()
        .unwrap()
        .is_empty()));
    let ack = acks.lock().unwrap()[0].clone();
    let channel = ack.expect("watch should succeed").expect("watch acks carry a channel id");
    (channel, events)
}

fn events_for<'a>(events: &'a [Event], path: &Path) -> Vec<&'a Event> {
    events.iter().filter(|event| event.path == path).collect()
}

#[test]
fn test_create_is_observed() {
    let dir = TempDir::new().unwrap();
    let mut hub = fast_hub();
    let (_, events) = watch_polling(&mut hub, dir.path(), false);

    let file = dir.path().join("a.txt");
    fs::write(&file, b"hello").unwrap();

    assert!(pump_until(&mut hub, Duration::from_secs(5), || {
        !events_for(&events.lock().unwrap(), &file).is_empty()
    }));

    let events = events.lock().unwrap();
    let observed = events_for(&events, &file);
    assert_eq!(observed[0].action, FileAction::Created);
    assert_eq!(observed[0].kind, EntryKind::File);
    assert_eq!(observed[0].old_path, Path::new("").to_path_buf());
}

#[test]
fn test_create_then_modify_in_order() {
    let dir = TempDir::new().unwrap();
    let mut hub = fast_hub();
    let (_, events) = watch_polling(&mut hub, dir.path(), false);

    let file = dir.path().join("grow.txt");
    fs::write(&file, b"v1").unwrap();
    assert!(pump_until(&mut hub, Duration::from_secs(5), || {
        !events_for(&events.lock().unwrap(), &file).is_empty()
    }));

    fs::write(&file, b"version two, longer").unwrap();
    assert!(pump_until(&mut hub, Duration::from_secs(5), || {
        events_for(&events.lock().unwrap(), &file)
            .iter()
            .any(|event| event.action == FileAction::Modified)
    }));

    let events = events.lock().unwrap();
    let observed = events_for(&events, &file);
    assert_eq!(observed[0].action, FileAction::Created);
    assert!(observed[1..].iter().any(|e| e.action == FileAction::Modified));
}

#[test]
fn test_delete_is_observed() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("doomed.txt");
    fs::write(&file, b"x").unwrap();

    let mut hub = fast_hub();
    let (_, events) = watch_polling(&mut hub, dir.path(), false);

    fs::remove_file(&file).unwrap();
    assert!(pump_until(&mut hub, Duration::from_secs(5), || {
        !events_for(&events.lock().unwrap(), &file).is_empty()
    }));

    let events = events.lock().unwrap();
    assert_eq!(events_for(&events, &file)[0].action, FileAction::Deleted);
}

#[cfg(unix)]
#[test]
fn test_rename_is_paired_by_inode() {
    let dir = TempDir::new().unwrap();
    let old = dir.path().join("x");
    fs::write(&old, b"payload").unwrap();

    let mut hub = fast_hub();
    let (_, events) = watch_polling(&mut hub, dir.path(), false);

    let new = dir.path().join("y");
    fs::rename(&old, &new).unwrap();

    assert!(pump_until(&mut hub, Duration::from_secs(5), || {
        !events_for(&events.lock().unwrap(), &new).is_empty()
    }));

    let events = events.lock().unwrap();
    let observed = events_for(&events, &new);
    assert_eq!(observed[0].action, FileAction::Renamed);
    assert_eq!(observed[0].old_path, old);
    // Pairing succeeded, so no separate create/delete sneaks in.
    assert!(events_for(&events, &old).is_empty());
}

#[test]
fn test_recursive_polling_sees_nested_entries() {
    let dir = TempDir::new().unwrap();
    let mut hub = fast_hub();
    let (_, events) = watch_polling(&mut hub, dir.path(), true);

    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::write(dir.path().join("sub/f.txt"), b"deep").unwrap();

    assert!(pump_until(&mut hub, Duration::from_secs(5), || {
        !events_for(&events.lock().unwrap(), &dir.path().join("sub/f.txt")).is_empty()
    }));

    let events = events.lock().unwrap();
    let dir_events = events_for(&events, &dir.path().join("sub"));
    assert_eq!(dir_events[0].action, FileAction::Created);
    assert_eq!(dir_events[0].kind, EntryKind::Directory);
    let file_events = events_for(&events, &dir.path().join("sub/f.txt"));
    assert_eq!(file_events[0].kind, EntryKind::File);
}

#[test]
fn test_watch_single_file_root() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("single.log");
    fs::write(&file, b"one").unwrap();

    let mut hub = fast_hub();
    let (_, events) = watch_polling(&mut hub, &file, false);

    fs::write(&file, b"one two three").unwrap();
    assert!(pump_until(&mut hub, Duration::from_secs(5), || {
        !events_for(&events.lock().unwrap(), &file).is_empty()
    }));

    let events = events.lock().unwrap();
    assert_eq!(events_for(&events, &file)[0].action, FileAction::Modified);
}

#[test]
fn test_watch_nonexistent_root_fails_without_registering() {
    let dir = TempDir::new().unwrap();
    let mut hub = fast_hub();

    let (acks, ack_callback) = ack_recorder();
    let (_, event_callback) = event_recorder();
    hub.watch(
        dir.path().join("missing"),
        WatchOptions {
            poll: true,
            recursive: false,
        },
        ack_callback,
        event_callback,
    )
    .unwrap();

    assert!(pump_until(&mut hub, Duration::from_secs(5), || !acks
        .lock()
        .unwrap()
        .is_empty()));

    let acks = acks.lock().unwrap();
    assert!(acks[0].is_err());

    // The failed registration left nothing behind.
    let status = hub.status();
    assert_eq!(status.channel_callback_count, 0);
    assert_eq!(status.pending_callback_count, 0);
}

#[test]
fn test_two_watches_on_one_root_are_independent() {
    let dir = TempDir::new().unwrap();
    let mut hub = fast_hub();
    let (first_id, first_events) = watch_polling(&mut hub, dir.path(), false);
    let (second_id, second_events) = watch_polling(&mut hub, dir.path(), false);
    assert_ne!(first_id, second_id);

    let file = dir.path().join("shared.txt");
    fs::write(&file, b"x").unwrap();

    assert!(pump_until(&mut hub, Duration::from_secs(5), || {
        !events_for(&first_events.lock().unwrap(), &file).is_empty()
            && !events_for(&second_events.lock().unwrap(), &file).is_empty()
    }));

    // Unwatching one stream leaves the other running.
    let (acks, ack_callback) = ack_recorder();
    hub.unwatch(first_id, ack_callback).unwrap();
    assert!(pump_until(&mut hub, Duration::from_secs(5), || !acks
        .lock()
        .unwrap()
        .is_empty()));

    let before = events_for(&first_events.lock().unwrap(), &file).len();
    let other = dir.path().join("later.txt");
    fs::write(&other, b"y").unwrap();

    assert!(pump_until(&mut hub, Duration::from_secs(5), || {
        !events_for(&second_events.lock().unwrap(), &other).is_empty()
    }));
    assert_eq!(events_for(&first_events.lock().unwrap(), &file).len(), before);
    assert!(events_for(&first_events.lock().unwrap(), &other).is_empty());
}

#[test]
fn test_unwatch_acks_once_and_silences_the_channel() {
    let dir = TempDir::new().unwrap();
    let mut hub = fast_hub();
    let (channel, events) = watch_polling(&mut hub, dir.path(), false);

    let (acks, ack_callback) = ack_recorder();
    hub.unwatch(channel, ack_callback).unwrap();
    assert!(pump_until(&mut hub, Duration::from_secs(5), || !acks
        .lock()
        .unwrap()
        .is_empty()));

    // Both backends reported; the aggregate callback fired exactly once.
    assert_eq!(acks.lock().unwrap().len(), 1);
    assert!(acks.lock().unwrap()[0].is_ok());

    fs::write(dir.path().join("after.txt"), b"x").unwrap();
    pump_until(&mut hub, Duration::from_millis(300), || false);
    assert!(events.lock().unwrap().is_empty());
}

#[test]
fn test_unwatch_unknown_channel_acks_cleanly() {
    let mut hub = fast_hub();
    let (acks, ack_callback) = ack_recorder();
    hub.unwatch(777, ack_callback).unwrap();

    assert!(pump_until(&mut hub, Duration::from_secs(5), || !acks
        .lock()
        .unwrap()
        .is_empty()));
    let acks = acks.lock().unwrap();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0], Ok(None));
}

#[test]
fn test_watch_unwatch_round_trips_status() {
    let dir = TempDir::new().unwrap();
    let mut hub = fast_hub();

    let before = hub.status();
    assert_eq!(before.pending_callback_count, 0);
    assert_eq!(before.channel_callback_count, 0);

    let (channel, _events) = watch_polling(&mut hub, dir.path(), false);
    assert_eq!(hub.status().channel_callback_count, 1);

    let (acks, ack_callback) = ack_recorder();
    hub.unwatch(channel, ack_callback).unwrap();
    assert!(pump_until(&mut hub, Duration::from_secs(5), || !acks
        .lock()
        .unwrap()
        .is_empty()));

    let after = hub.status();
    assert_eq!(after.pending_callback_count, 0);
    assert_eq!(after.channel_callback_count, 0);

    // With its last channel gone the polling thread winds itself down.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if hub.status().polling.state == "stopped" {
            break;
        }
        assert!(Instant::now() < deadline, "polling thread did not stop");
        hub.handle_events_timeout(Duration::from_millis(20));
    }
}

#[test]
fn test_polling_interval_reconfiguration_is_acked() {
    let mut hub = Hub::new();
    let (acks, ack_callback) = ack_recorder();
    hub.configure(
        ConfigureOptions {
            polling_interval: Some(50),
            polling_throttle: Some(50),
            ..ConfigureOptions::default()
        },
        ack_callback,
    )
    .unwrap();

    assert!(pump_until(&mut hub, Duration::from_secs(5), || !acks
        .lock()
        .unwrap()
        .is_empty()));
    assert_eq!(acks.lock().unwrap().as_slice(), &[Ok(None)]);
}
