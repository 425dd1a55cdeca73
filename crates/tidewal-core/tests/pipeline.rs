//! End-to-end pipeline tests against the simulated block device.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tidewal_core::sim::{IoEvent, IoEventKind, SimulatedBlockDevice};
use tidewal_core::{
    BlockDevice, CompletionOutcome, Journal, JournalConfig, Operation, Stage, WriteClient,
    WriteId,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Client that records every `write_complete` call.
#[derive(Default)]
struct RecordingClient {
    completed: Mutex<Vec<WriteId>>,
}

impl WriteClient for RecordingClient {
    fn write_complete(&self, write_id: WriteId) {
        self.completed.lock().push(write_id);
    }
}

impl RecordingClient {
    fn completed(&self) -> Vec<WriteId> {
        self.completed.lock().clone()
    }

    fn counts(&self) -> HashMap<WriteId, usize> {
        let mut counts = HashMap::new();
        for id in self.completed() {
            *counts.entry(id).or_insert(0) += 1;
        }
        counts
    }
}

fn start(
    config: JournalConfig,
    device: &Arc<SimulatedBlockDevice>,
) -> (Journal, Arc<RecordingClient>) {
    let client = Arc::new(RecordingClient::default());
    let journal = Journal::start(
        config,
        Arc::clone(device) as Arc<dyn BlockDevice>,
        Arc::clone(&client) as Arc<dyn WriteClient>,
    )
    .unwrap();
    (journal, client)
}

fn position(events: &[IoEvent], kind: IoEventKind, write_id: WriteId, op: Operation) -> usize {
    events
        .iter()
        .position(|e| e.kind == kind && e.write_id == write_id && e.op == op)
        .unwrap_or_else(|| panic!("no {kind:?} {op} for write {write_id}"))
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn test_sixteen_inline_writes_complete_once_each() {
    let device = Arc::new(SimulatedBlockDevice::inline());
    let (journal, client) = start(JournalConfig::default(), &device);

    for id in 0..16 {
        journal.request_write(id).unwrap();
    }
    journal.wait_for_all();

    let mut completed = client.completed();
    assert_eq!(completed.len(), 16);
    completed.sort_unstable();
    assert_eq!(completed, (0..16).collect::<Vec<_>>());
    assert_eq!(journal.in_flight(), 0);
    assert_eq!(device.events().len(), 16 * 7 * 2);
}

#[test]
fn test_stage_ordering_holds_for_every_write() {
    let device = Arc::new(
        SimulatedBlockDevice::builder()
            .latency(Duration::from_millis(1))
            .build()
            .unwrap(),
    );
    let config = JournalConfig::builder().buffer_size(4).build();
    let (journal, client) = start(config, &device);

    for id in 0..24 {
        journal.request_write(id).unwrap();
    }
    assert!(journal.wait_for_all_timeout(DRAIN_TIMEOUT));
    assert_eq!(client.counts().len(), 24);

    let events = device.events();
    for id in 0..24 {
        let txe_issued = position(&events, IoEventKind::Issued, id, Operation::JournalTxe);
        for &op in Stage::Metadata.operations() {
            assert!(
                position(&events, IoEventKind::Completed, id, op) < txe_issued,
                "write {id}: txe issued before {op} completed"
            );
        }

        let txe_done = position(&events, IoEventKind::Completed, id, Operation::JournalTxe);
        for &op in Stage::Checkpoint.operations() {
            assert!(
                txe_done < position(&events, IoEventKind::Issued, id, op),
                "write {id}: {op} issued before txe completed"
            );
        }
    }
}

#[test]
fn test_write_complete_only_after_all_seven_completions() {
    let device = Arc::new(
        SimulatedBlockDevice::builder()
            .latency(Duration::from_micros(200))
            .build()
            .unwrap(),
    );
    let observed = Arc::new(Mutex::new(Vec::new()));

    let client: Arc<dyn WriteClient> = {
        let device = Arc::clone(&device);
        let observed = Arc::clone(&observed);
        Arc::new(move |id: WriteId| {
            let completions = device
                .events()
                .iter()
                .filter(|e| e.kind == IoEventKind::Completed && e.write_id == id)
                .count();
            observed.lock().push((id, completions));
        })
    };
    let journal = Journal::start(
        JournalConfig::default(),
        Arc::clone(&device) as Arc<dyn BlockDevice>,
        client,
    )
    .unwrap();

    for id in 0..12 {
        journal.request_write(id).unwrap();
    }
    assert!(journal.wait_for_all_timeout(DRAIN_TIMEOUT));

    let observed = observed.lock();
    assert_eq!(observed.len(), 12);
    assert!(observed.iter().all(|(_, completions)| *completions == 7));
}

#[test]
fn test_slot_reuse_does_not_mix_state() {
    let device = Arc::new(
        SimulatedBlockDevice::builder()
            .latency(Duration::from_millis(1))
            .build()
            .unwrap(),
    );
    let (journal, client) = start(JournalConfig::default(), &device);

    journal.request_write(3).unwrap();
    assert!(wait_until(DRAIN_TIMEOUT, || client.completed() == vec![3]));

    // Second traversal of the same slot, submitted after the first finished.
    journal.request_write(3).unwrap();
    assert!(journal.wait_for_all_timeout(DRAIN_TIMEOUT));

    assert_eq!(client.completed(), vec![3, 3]);
    for op in Operation::ALL {
        assert_eq!(device.issued(3, op), 2, "{op} issued the wrong number of times");
    }

    let slot = journal.slot(3).unwrap();
    assert!(!slot.in_use);
    assert_eq!(slot.generation, 2);
    assert_eq!(journal.stats().table.stale_completions, 0);
}

#[test]
fn test_resubmit_blocks_until_previous_occupant_drains() {
    let device = Arc::new(SimulatedBlockDevice::inline());
    device.hold(Operation::WriteInode, 7);
    let (journal, client) = start(JournalConfig::default(), &device);
    let journal = Arc::new(journal);

    journal.request_write(7).unwrap();
    assert!(wait_until(DRAIN_TIMEOUT, || device.held_count() == 1));

    let resubmit = {
        let journal = Arc::clone(&journal);
        thread::spawn(move || journal.request_write(7))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!resubmit.is_finished());
    assert!(client.completed().is_empty());

    device.release_held();
    resubmit.join().unwrap().unwrap();
    assert!(journal.wait_for_all_timeout(DRAIN_TIMEOUT));
    assert_eq!(client.completed(), vec![7, 7]);
}

#[test]
fn test_more_writes_than_queue_capacity_do_not_deadlock() {
    let device = Arc::new(
        SimulatedBlockDevice::builder()
            .latency(Duration::from_micros(500))
            .build()
            .unwrap(),
    );
    let config = JournalConfig::builder()
        .buffer_size(2)
        .max_requests(8)
        .build();
    let (journal, client) = start(config, &device);

    // 64 writes over 8 slots: each slot is reused eight times.
    for _ in 0..8 {
        for id in 0..8 {
            journal.request_write(id).unwrap();
        }
    }
    assert!(journal.wait_for_all_timeout(DRAIN_TIMEOUT));

    let counts = client.counts();
    assert_eq!(counts.len(), 8);
    assert!(counts.values().all(|&n| n == 8));

    let stats = journal.stats();
    assert!(stats.stages.iter().all(|s| s.processed == 64));
    assert_eq!(stats.stages[Stage::Metadata.index()].queue.pushed, 64);
}

#[test]
fn test_held_txe_stalls_only_the_commit_stage() {
    const WRITES: usize = 10;

    let device = Arc::new(SimulatedBlockDevice::inline());
    device.hold(Operation::JournalTxe, 0);
    let config = JournalConfig::builder().buffer_size(2).build();
    let (journal, client) = start(config, &device);
    let journal = Arc::new(journal);

    let submitter = {
        let journal = Arc::clone(&journal);
        thread::spawn(move || {
            for id in 0..WRITES {
                journal.request_write(id).unwrap();
            }
        })
    };

    // Commit is stuck on write 0. Metadata keeps going: writes 1 and 2 fill
    // the commit queue and write 3 passes its join before blocking on the push.
    let metadata_processed = || journal.stats().stages[Stage::Metadata.index()].processed;
    assert!(wait_until(DRAIN_TIMEOUT, || metadata_processed() == 4));
    thread::sleep(Duration::from_millis(50));

    let stats = journal.stats();
    assert_eq!(stats.stages[Stage::Metadata.index()].processed, 4);
    assert_eq!(stats.stages[Stage::Commit.index()].processed, 0);
    assert_eq!(stats.stages[Stage::Checkpoint.index()].processed, 0);
    assert!(client.completed().is_empty());
    assert_eq!(device.issued(1, Operation::JournalTxe), 0);
    for id in 1..=3 {
        for &op in Stage::Metadata.operations() {
            assert_eq!(device.issued(id, op), 1);
        }
    }

    assert_eq!(device.release_held(), 1);
    submitter.join().unwrap();
    assert!(journal.wait_for_all_timeout(DRAIN_TIMEOUT));

    // The commit queue is FIFO and the device is inline, so completion order
    // matches submission order once write 0 is released.
    assert_eq!(client.completed(), (0..WRITES).collect::<Vec<_>>());
    assert!(journal.stats().stages[Stage::Metadata.index()].queue.push_blocked > 0);
}

#[test]
fn test_slow_first_txe_delays_only_its_write() {
    let device = Arc::new(
        SimulatedBlockDevice::builder()
            .delay_first(Operation::JournalTxe, Duration::from_millis(300))
            .build()
            .unwrap(),
    );
    let (journal, client) = start(JournalConfig::default(), &device);

    for id in 0..16 {
        journal.request_write(id).unwrap();
    }

    // While txe 0 is in flight, later writes finish their metadata stage.
    assert!(wait_until(DRAIN_TIMEOUT, || {
        journal.stats().stages[Stage::Metadata.index()].processed >= 4
    }));
    assert!(client.completed().is_empty());

    assert!(journal.wait_for_all_timeout(DRAIN_TIMEOUT));
    let completed = client.completed();
    assert_eq!(completed.len(), 16);
    assert_eq!(completed[0], 0);
}

#[test]
fn test_stale_callbacks_are_ignored() {
    let device = Arc::new(SimulatedBlockDevice::inline());
    let (journal, client) = start(JournalConfig::default(), &device);

    journal.request_write(1).unwrap();
    journal.wait_for_all();

    let dispatcher = journal.dispatcher();
    assert_eq!(dispatcher.journal_txe_complete(1), CompletionOutcome::Stale);
    assert_eq!(dispatcher.write_data_complete(40), CompletionOutcome::Stale);
    assert_eq!(dispatcher.write_inode_complete(999), CompletionOutcome::Stale);

    journal.request_write(1).unwrap();
    journal.wait_for_all();

    assert_eq!(client.completed(), vec![1, 1]);
    assert_eq!(journal.stats().table.stale_completions, 3);
}

#[test]
fn test_many_submitters_share_the_pipeline() {
    let device = Arc::new(
        SimulatedBlockDevice::builder()
            .latency(Duration::from_micros(300))
            .build()
            .unwrap(),
    );
    let config = JournalConfig::builder()
        .buffer_size(3)
        .max_requests(32)
        .build();
    let (journal, client) = start(config, &device);
    let journal = Arc::new(journal);

    let submitters: Vec<_> = (0..4)
        .map(|t| {
            let journal = Arc::clone(&journal);
            thread::spawn(move || {
                for id in (t * 8)..(t * 8 + 8) {
                    journal.request_write(id).unwrap();
                }
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().unwrap();
    }
    assert!(journal.wait_for_all_timeout(DRAIN_TIMEOUT));

    let mut completed = client.completed();
    completed.sort_unstable();
    assert_eq!(completed, (0..32).collect::<Vec<_>>());
}
