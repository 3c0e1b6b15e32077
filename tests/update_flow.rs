//! Evaluation round trips: dispatch, run on the worker, apply the update.
//!
//! Every hop goes through `MemoryBroker` so deliveries are received, handled
//! and settled exactly as the consumer pools do it.
#![cfg(unix)]

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use bench_relay::broker::{Broker, Delivery, MemoryBroker};
use bench_relay::config::{HostEntry, RelayConfig};
use bench_relay::dispatch::EvaluationDispatcher;
use bench_relay::remote::{RecordingRunner, RemoteSync};
use bench_relay::service::{DeliveryHandler, Disposition};
use bench_relay::state::{EvaluatorRecord, MemoryStore, Submission, SubmissionStatus, SubmissionStore};
use bench_relay::submission::{LockKind, LogFile, SubmissionDirectory, SubmissionInfo};
use bench_relay::update::{CountingLeaderboard, UpdateProcessor, UpdateResult};
use bench_relay::worker::EvaluationWorker;
use relay_protocol::{ExecutorKind, Message, Outcome, Queue, UpdateEvent};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const RECEIVE: Duration = Duration::from_millis(50);

struct Fixture {
    root: TempDir,
    store: Arc<MemoryStore>,
    broker: Arc<MemoryBroker>,
    leaderboard: Arc<CountingLeaderboard>,
    dispatcher: EvaluationDispatcher,
    worker: EvaluationWorker,
    processor: UpdateProcessor,
}

fn fixture() -> Fixture {
    let root = TempDir::new().unwrap();
    let scripts = root.path().join("scripts");
    fs::create_dir_all(&scripts).unwrap();
    fs::write(
        scripts.join("score.sh"),
        "#!/bin/bash\necho \"scoring $*\"\necho '{\"bleu\": 0.42}' > content/scores/result.json\n",
    )
    .unwrap();
    fs::write(scripts.join("broken.sh"), "#!/bin/bash\necho 'missing predictions' >&2\nexit 3\n").unwrap();

    let mut config = RelayConfig::new(root.path().join("subs"));
    config.local_host = "local".to_string();
    config.hosts.push(HostEntry {
        name: "local".to_string(),
        address: None,
        user: None,
        submission_root: root.path().join("subs"),
        script_root: scripts,
    });
    let config = Arc::new(config);

    let store = Arc::new(MemoryStore::new());
    for (id, script) in [("bleu", "score.sh"), ("broken", "broken.sh")] {
        store.add_evaluator(EvaluatorRecord {
            id: id.to_string(),
            host: "local".to_string(),
            executor: ExecutorKind::Bash,
            script: script.to_string(),
            args: vec!["--metric".to_string(), "bleu".to_string()],
        });
    }

    let broker = Arc::new(MemoryBroker::new());
    let sync = Arc::new(RemoteSync::new(config.clone(), Arc::new(RecordingRunner::new())));
    let leaderboard = Arc::new(CountingLeaderboard::new());
    let dispatcher = EvaluationDispatcher::new(config.clone(), store.clone(), broker.clone(), sync.clone());
    let worker = EvaluationWorker::new("local", broker.clone(), CancellationToken::new(), Duration::from_secs(1));
    let processor = UpdateProcessor::new(config, store.clone(), sync, leaderboard.clone());

    Fixture {
        root,
        store,
        broker,
        leaderboard,
        dispatcher,
        worker,
        processor,
    }
}

impl Fixture {
    fn uploaded(&self, id: &str, evaluator: &str) -> SubmissionDirectory {
        let submission = Submission::new(id, "u1", "bench-1", "m1").with_evaluator(evaluator);
        self.store.put_submission(&submission).unwrap();
        self.store.update_status(id, SubmissionStatus::Uploaded).unwrap();

        let dir = SubmissionDirectory::create(
            &self.root.path().join("subs"),
            &SubmissionInfo::new(id, "u1", "bench-1", "m1"),
        )
        .unwrap();
        fs::create_dir_all(dir.content_dir()).unwrap();
        dir.lock(LockKind::Upload).release().unwrap();
        dir
    }

    fn status(&self, id: &str) -> SubmissionStatus {
        self.store.get_submission(id).unwrap().status
    }

    fn next(&self, queue: &Queue) -> Delivery {
        self.broker
            .receive(queue, RECEIVE)
            .unwrap()
            .unwrap_or_else(|| panic!("nothing on {}", queue))
    }

    /// Receive one delivery, hand it to `handler` and settle it.
    fn consume(&self, queue: &Queue, handler: &dyn DeliveryHandler) -> Disposition {
        let delivery = self.next(queue);
        let disposition = handler.handle(&delivery);
        match disposition {
            Disposition::Ack => self.broker.ack(&delivery).unwrap(),
            Disposition::Nack => self.broker.nack(&delivery).unwrap(),
        }
        disposition
    }
}

#[test]
fn test_completed_evaluation_round_trip() {
    let f = fixture();
    let dir = f.uploaded("s1", "bleu");
    f.dispatcher.dispatch("s1", &[]).unwrap();

    assert_eq!(f.consume(&Queue::eval("local"), &f.worker), Disposition::Ack);
    assert_eq!(f.broker.depth(&Queue::Update), 1);
    assert_eq!(f.status("s1"), SubmissionStatus::Evaluating);

    assert_eq!(f.consume(&Queue::Update, &f.processor), Disposition::Ack);

    assert_eq!(f.status("s1"), SubmissionStatus::Completed);
    assert!(!dir.has_lock(LockKind::Eval));
    assert_eq!(f.leaderboard.count("bench-1"), 1);
    assert_eq!(f.broker.inflight(), 0);

    let scores = fs::read_to_string(dir.scores_dir().join("result.json")).unwrap();
    assert!(scores.contains("0.42"));
    let log = fs::read_to_string(dir.log_path(LogFile::Evaluation)).unwrap();
    assert!(log.contains("scoring --metric bleu"));
    assert!(log.contains("evaluator exited (0)"));
}

#[test]
fn test_failed_evaluation_round_trip() {
    let f = fixture();
    let dir = f.uploaded("s1", "broken");
    f.dispatcher.dispatch("s1", &[]).unwrap();

    f.consume(&Queue::eval("local"), &f.worker);
    let published = f.broker.published(&Queue::Update);
    match &published[0].body {
        Message::Update(event) => assert_eq!(event.outcome().unwrap(), Outcome::Failed),
        other => panic!("unexpected message {:?}", other),
    }

    f.consume(&Queue::Update, &f.processor);
    assert_eq!(f.status("s1"), SubmissionStatus::Failed);
    assert!(!dir.has_lock(LockKind::Eval));
    assert_eq!(f.leaderboard.count("bench-1"), 0);
    let log = fs::read_to_string(dir.log_path(LogFile::Evaluation)).unwrap();
    assert!(log.contains("missing predictions"));
    assert!(log.contains("evaluator exited (3)"));
}

#[test]
fn test_redelivered_complete_is_noop() {
    let f = fixture();
    f.uploaded("s1", "bleu");
    f.dispatcher.dispatch("s1", &[]).unwrap();
    f.consume(&Queue::eval("local"), &f.worker);

    let delivery = f.next(&Queue::Update);
    assert_eq!(f.processor.handle(&delivery), Disposition::Ack);
    // Crash before the ack: the broker hands the same event out again.
    f.broker.nack(&delivery).unwrap();

    let again = f.next(&Queue::Update);
    assert_eq!(again.envelope.message_id, delivery.envelope.message_id);
    let Message::Update(event) = &again.envelope.body else {
        panic!("expected an update");
    };
    assert_eq!(
        f.processor.process(event).unwrap(),
        UpdateResult::Duplicate(SubmissionStatus::Completed)
    );
    f.broker.ack(&again).unwrap();

    assert_eq!(f.status("s1"), SubmissionStatus::Completed);
    assert_eq!(f.leaderboard.count("bench-1"), 1);
}

#[test]
fn test_update_before_evaluating_is_retried() {
    let f = fixture();
    f.uploaded("s1", "bleu");
    f.broker
        .send(&Queue::Update, Message::Update(UpdateEvent::new("s1", "local", Outcome::Complete)))
        .unwrap();

    assert_eq!(f.consume(&Queue::Update, &f.processor), Disposition::Nack);
    assert_eq!(f.status("s1"), SubmissionStatus::Uploaded);
    assert_eq!(f.broker.depth(&Queue::Update), 1);

    f.dispatcher.dispatch("s1", &[]).unwrap();
    assert_eq!(f.consume(&Queue::Update, &f.processor), Disposition::Ack);
    assert_eq!(f.status("s1"), SubmissionStatus::Completed);
}

#[test]
fn test_unknown_update_kind_dropped() {
    let f = fixture();
    let dir = f.uploaded("s1", "bleu");
    f.dispatcher.dispatch("s1", &[]).unwrap();

    let mut event = UpdateEvent::new("s1", "local", Outcome::Complete);
    event.kind = "paused".to_string();
    f.broker.send(&Queue::Update, Message::Update(event)).unwrap();

    assert_eq!(f.consume(&Queue::Update, &f.processor), Disposition::Ack);
    assert_eq!(f.status("s1"), SubmissionStatus::Evaluating);
    assert!(dir.has_lock(LockKind::Eval));
}

#[test]
fn test_extra_args_reach_evaluator() {
    let f = fixture();
    let dir = f.uploaded("s1", "bleu");
    f.dispatcher
        .dispatch("s1", &["--split".to_string(), "dev".to_string()])
        .unwrap();

    f.consume(&Queue::eval("local"), &f.worker);

    let log = fs::read_to_string(dir.log_path(LogFile::Evaluation)).unwrap();
    assert!(log.contains("scoring --metric bleu --split dev"));
}
