//! End-to-end task lifecycles against a scripted remote service.

use datafetch_core::{FetchError, RemoteError, RequestDescription, RequestStatus, ServiceAddress};
use datafetch_task::journal::section;
use datafetch_task::{
    as_completed, wait, Credentials, DataServer, RemoteCall, RemoteClient, RequestTask, ReturnWhen,
    ServerConfig,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// What the fake service does for one target.
struct Script {
    lines: Vec<&'static str>,
    gate: Option<Mutex<Receiver<()>>>,
    delay: Duration,
    outcome: Result<Value, RemoteError>,
}

impl Script {
    fn new(lines: Vec<&'static str>, outcome: Result<Value, RemoteError>) -> Self {
        Self {
            lines,
            gate: None,
            delay: Duration::ZERO,
            outcome,
        }
    }

    fn gated(mut self) -> (Self, Sender<()>) {
        let (release, gate) = mpsc::channel();
        self.gate = Some(Mutex::new(gate));
        (self, release)
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Remote service that replays a script keyed by target file name.
#[derive(Default)]
struct ScriptedService {
    scripts: HashMap<String, Script>,
}

impl ScriptedService {
    fn with(mut self, target: &str, script: Script) -> Self {
        self.scripts.insert(target.to_string(), script);
        self
    }
}

impl RemoteClient for ScriptedService {
    fn execute(
        &self,
        call: RemoteCall<'_>,
        progress: &mut dyn FnMut(&str),
    ) -> Result<Value, RemoteError> {
        let name = call
            .target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let script = self
            .scripts
            .get(&name)
            .ok_or_else(|| RemoteError::new(format!("no script for {}", name)))?;

        if let Some(gate) = &script.gate {
            let _ = gate.lock().unwrap().recv();
        }
        for line in &script.lines {
            progress(line);
        }
        thread::sleep(script.delay);
        script.outcome.clone()
    }
}

fn credentials() -> Credentials {
    Credentials::new("https://api.example.com/v1", "key", "me@example.com")
}

fn server(service: ScriptedService, workers: usize) -> DataServer {
    let config = ServerConfig {
        max_workers: workers,
        ..ServerConfig::default()
    };
    DataServer::new(config, credentials(), Arc::new(service)).unwrap()
}

fn request(dir: &TempDir, dataset: &str, target: &str) -> RequestDescription {
    RequestDescription::new()
        .with("dataset", dataset)
        .with("target", dir.path().join(target).to_string_lossy().into_owned())
}

fn log_of(target: &Path) -> String {
    let mut path = target.as_os_str().to_owned();
    path.push(".log");
    std::fs::read_to_string(PathBuf::from(path)).unwrap()
}

fn statuses(task: &RequestTask) -> Vec<RequestStatus> {
    task.elapsed_log().into_iter().map(|(status, _)| status).collect()
}

#[test]
fn test_successful_request_lifecycle() {
    let dir = TempDir::new().unwrap();
    let service = ScriptedService::default().with(
        "out.bin",
        Script::new(
            vec!["Request is queued", "Request id: 12345", "Request is active"],
            Ok(json!({"href": "http://host/out.bin", "size": 42, "type": "bin"})),
        ),
    );
    let server = server(service, 1);

    let task = server.retrieve(request(&dir, "X", "out.bin")).unwrap();
    assert_eq!(task.address(), &ServiceAddress::Dataset("X".to_string()));

    task.result(Some(Duration::from_secs(10))).unwrap();
    assert_eq!(task.status(), RequestStatus::Complete);
    assert_eq!(task.id().as_deref(), Some("12345"));
    assert_eq!(task.href().as_deref(), Some("http://host/out.bin"));
    assert_eq!(task.size(), Some(42));
    assert_eq!(task.kind().as_deref(), Some("bin"));
    assert_eq!(
        statuses(&task),
        vec![RequestStatus::Queued, RequestStatus::Active, RequestStatus::Complete]
    );

    let end = task.end_time().unwrap();
    assert!(end >= task.start_time());
    let total = task.elapsed();
    assert!(task.elapsed_log().iter().all(|(_, at)| *at <= total));

    let log = log_of(task.target());
    let positions: Vec<usize> = [section::REQUEST, section::SERVER, section::OUTPUT, section::ELAPSED]
        .iter()
        .map(|header| log.find(header).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert!(log.contains("Service: datasets/X"));
    assert!(log.contains("Request id: 12345"));
    assert!(log.contains("size: 42"));
    assert!(log.contains("min to complete"));
    assert!(!log.contains(section::ERROR));

    // Same lines as the in-memory log.
    assert_eq!(log.lines().collect::<Vec<_>>(), task.messages());
}

#[test]
fn test_failed_request_lifecycle() {
    let dir = TempDir::new().unwrap();
    let service = ScriptedService::default().with(
        "bad.bin",
        Script::new(
            vec!["Request is queued"],
            Err(RemoteError::new("ecmwf.API error 1").with_details(["Invalid date"])),
        ),
    );
    let server = server(service, 1);

    let task = server.retrieve(request(&dir, "X", "bad.bin")).unwrap();
    let err = task.exception(None).unwrap().unwrap();
    assert!(matches!(err, FetchError::Remote(ref remote) if remote.details == ["Invalid date"]));
    assert!(matches!(task.result(None), Err(FetchError::Remote(_))));

    assert_eq!(task.status(), RequestStatus::Error);
    assert!(task.end_time().is_some());
    assert!(task.href().is_none());
    assert_eq!(statuses(&task), vec![RequestStatus::Queued, RequestStatus::Error]);

    let log = log_of(task.target());
    assert!(log.contains(section::ERROR));
    assert!(log.contains("Invalid date"));
    assert!(!log.contains(section::OUTPUT));
    assert!(task.messages().iter().any(|m| m == section::ERROR));
}

#[test]
fn test_observers_run_in_registration_order() {
    let dir = TempDir::new().unwrap();
    let (blocker, release) = Script::new(vec![], Ok(json!({}))).gated();
    let service = ScriptedService::default().with("block.bin", blocker).with(
        "watched.bin",
        Script::new(vec!["Request submitted", "Request is active"], Ok(json!({}))),
    );
    let server = server(service, 1);
    let _blocking = server.retrieve(request(&dir, "X", "block.bin")).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&seen);
    let task = server
        .retrieve_with(request(&dir, "X", "watched.bin"), move |task| {
            first.lock().unwrap().push((0, task.status()));
        })
        .unwrap();
    for index in 1..3 {
        let seen = Arc::clone(&seen);
        task.add_status_callback(move |task| {
            seen.lock().unwrap().push((index, task.status()));
        });
    }

    release.send(()).unwrap();
    task.wait(None);

    let expected: Vec<(i32, RequestStatus)> = [
        RequestStatus::Submitted,
        RequestStatus::Active,
        RequestStatus::Complete,
    ]
    .iter()
    .flat_map(|status| (0..3).map(move |index| (index, *status)))
    .collect();
    assert_eq!(*seen.lock().unwrap(), expected);

    // Registering after completion is allowed and never called.
    let late = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&late);
    task.add_status_callback(move |_| *counter.lock().unwrap() += 1);
    assert_eq!(*late.lock().unwrap(), 0);
}

#[test]
fn test_terminal_status_is_decided_by_finalize() {
    let dir = TempDir::new().unwrap();
    let service = ScriptedService::default().with(
        "noisy.bin",
        Script::new(
            vec![
                "Request is queued",
                "Request is queued",
                "Request is complete",
                "Request is submitted",
                "Request is mystery",
                "Transfer progress 50%",
            ],
            Ok(json!({})),
        ),
    );
    let server = server(service, 1);
    let task = server.retrieve(request(&dir, "X", "noisy.bin")).unwrap();
    task.wait(None);

    assert_eq!(
        statuses(&task),
        vec![RequestStatus::Queued, RequestStatus::Complete]
    );
    // Unrecognised lines are still logged.
    assert!(task.messages().iter().any(|m| m == "Request is mystery"));
    assert!(task.messages().iter().any(|m| m == "Transfer progress 50%"));
}

#[test]
fn test_cancel_before_start() {
    let dir = TempDir::new().unwrap();
    let (blocker, release) = Script::new(vec![], Ok(json!({}))).gated();
    let service = ScriptedService::default()
        .with("block.bin", blocker)
        .with("later.bin", Script::new(vec!["Request is queued"], Ok(json!({}))));
    let server = server(service, 1);
    let blocking = server.retrieve(request(&dir, "X", "block.bin")).unwrap();

    let notified = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&notified);
    let task = server
        .retrieve_with(request(&dir, "X", "later.bin"), move |task| {
            sink.lock().unwrap().push(task.status());
        })
        .unwrap();

    assert!(task.cancel());
    assert!(task.cancelled());
    assert!(task.done());
    assert_eq!(task.status(), RequestStatus::Cancelled);
    assert!(task.end_time().is_some());
    assert!(matches!(task.exception(None), Err(FetchError::Cancelled)));
    assert!(matches!(task.result(None), Err(FetchError::Cancelled)));
    assert_eq!(*notified.lock().unwrap(), vec![RequestStatus::Cancelled]);

    release.send(()).unwrap();
    blocking.wait(None);
    server.shutdown(true);

    // The work never started, so no log file was created.
    assert!(!task.log_path().unwrap().exists());
    assert!(task.messages().iter().any(|m| m == section::ELAPSED));
    assert_eq!(statuses(&task), vec![RequestStatus::Cancelled]);
}

#[test]
fn test_cancel_running_task_has_no_effect() {
    let dir = TempDir::new().unwrap();
    let (blocker, release) = Script::new(vec!["Request is active"], Ok(json!({}))).gated();
    let service = ScriptedService::default().with("busy.bin", blocker);
    let server = server(service, 1);
    let task = server.retrieve(request(&dir, "X", "busy.bin")).unwrap();

    let started = Instant::now();
    while !task.running() {
        assert!(started.elapsed() < Duration::from_secs(10));
        thread::sleep(Duration::from_millis(1));
    }
    assert!(!task.cancel());
    release.send(()).unwrap();
    task.wait(None);
    assert_eq!(task.status(), RequestStatus::Complete);
    assert!(!task.cancelled());
}

#[test]
fn test_result_times_out_while_pending() {
    let dir = TempDir::new().unwrap();
    let (blocker, release) = Script::new(vec![], Ok(json!({}))).gated();
    let service = ScriptedService::default().with("slow.bin", blocker);
    let server = server(service, 1);
    let task = server.retrieve(request(&dir, "X", "slow.bin")).unwrap();

    assert!(matches!(
        task.result(Some(Duration::from_millis(20))),
        Err(FetchError::Timeout(_))
    ));
    assert!(!task.wait(Some(Duration::from_millis(1))));
    assert!(task.end_time().is_none());

    release.send(()).unwrap();
    assert!(task.wait(Some(Duration::from_secs(10))));
}

#[test]
fn test_panicking_observer_fails_the_task() {
    let dir = TempDir::new().unwrap();
    let service = ScriptedService::default()
        .with("panic.bin", Script::new(vec!["Request is queued"], Ok(json!({}))))
        .with("after.bin", Script::new(vec![], Ok(json!({"size": 1}))));
    let server = server(service, 1);
    let task = server
        .retrieve_with(request(&dir, "X", "panic.bin"), |task| {
            if task.status() == RequestStatus::Queued {
                panic!("observer failed");
            }
        })
        .unwrap();

    assert!(matches!(
        task.exception(None),
        Ok(Some(FetchError::WorkerPanic(ref msg))) if msg == "observer failed"
    ));
    assert_eq!(task.status(), RequestStatus::Error);

    // The worker survived.
    let after = server.retrieve(request(&dir, "X", "after.bin")).unwrap();
    assert_eq!(after.result(Some(Duration::from_secs(10))).unwrap(), json!({"size": 1}));
}

#[test]
fn test_wait_on_finished_tasks_returns_immediately() {
    let dir = TempDir::new().unwrap();
    let service = ScriptedService::default()
        .with("a.bin", Script::new(vec![], Ok(json!({}))))
        .with("b.bin", Script::new(vec![], Err(RemoteError::new("nope"))));
    let server = server(service, 2);
    let tasks = vec![
        server.retrieve(request(&dir, "X", "a.bin")).unwrap(),
        server.retrieve(request(&dir, "X", "b.bin")).unwrap(),
    ];
    for task in &tasks {
        task.wait(None);
    }

    let started = Instant::now();
    let result = wait(&tasks, None, ReturnWhen::AllCompleted);
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(result.done.len(), 2);
    assert!(result.not_done.is_empty());
    assert!(tasks.iter().all(|task| result.done.contains(task)));
}

#[test]
fn test_wait_partitions_on_timeout_and_first_exception() {
    let dir = TempDir::new().unwrap();
    let (blocker, release) = Script::new(vec![], Ok(json!({}))).gated();
    let service = ScriptedService::default()
        .with("stuck.bin", blocker)
        .with("broken.bin", Script::new(vec![], Err(RemoteError::new("nope"))));
    let server = server(service, 2);
    let stuck = server.retrieve(request(&dir, "X", "stuck.bin")).unwrap();
    let broken = server.retrieve(request(&dir, "X", "broken.bin")).unwrap();
    let tasks = [stuck.clone(), broken.clone()];

    let result = wait(&tasks, Some(Duration::from_secs(10)), ReturnWhen::FirstException);
    assert!(result.done.contains(&broken));
    assert!(result.not_done.contains(&stuck));

    let result = wait(&tasks, Some(Duration::from_millis(20)), ReturnWhen::AllCompleted);
    assert_eq!(result.not_done.len(), 1);

    release.send(()).unwrap();
    let result = wait(&tasks, None, ReturnWhen::AllCompleted);
    assert_eq!(result.done.len(), 2);
}

#[test]
fn test_as_completed_follows_completion_order() {
    let dir = TempDir::new().unwrap();
    let service = ScriptedService::default()
        .with("slow.bin", Script::new(vec![], Ok(json!({}))).delayed(Duration::from_millis(300)))
        .with("fast.bin", Script::new(vec![], Ok(json!({}))).delayed(Duration::from_millis(10)))
        .with("mid.bin", Script::new(vec![], Ok(json!({}))).delayed(Duration::from_millis(150)));
    let server = server(service, 3);
    let tasks = vec![
        server.retrieve(request(&dir, "X", "slow.bin")).unwrap(),
        server.retrieve(request(&dir, "X", "fast.bin")).unwrap(),
        server.retrieve(request(&dir, "X", "mid.bin")).unwrap(),
    ];

    let mut completed = as_completed(&tasks);
    assert_eq!(completed.remaining(), 3);
    let order: Vec<RequestTask> = completed.by_ref().collect();
    assert_eq!(order, vec![tasks[1].clone(), tasks[2].clone(), tasks[0].clone()]);
    assert!(order.iter().all(|task| task.done()));

    // Exhausted and not restartable.
    assert_eq!(completed.remaining(), 0);
    assert!(completed.next().is_none());

    let result = wait(&tasks, None, ReturnWhen::AllCompleted);
    assert_eq!(result.done.len(), 3);
}

#[test]
fn test_as_completed_next_timeout() {
    let dir = TempDir::new().unwrap();
    let (blocker, release) = Script::new(vec![], Ok(json!({}))).gated();
    let service = ScriptedService::default().with("gate.bin", blocker);
    let server = server(service, 1);
    let task = server.retrieve(request(&dir, "X", "gate.bin")).unwrap();

    let mut completed = as_completed([&task, &task]);
    assert_eq!(completed.remaining(), 1);
    assert!(matches!(
        completed.next_timeout(Some(Duration::from_millis(20))),
        Err(FetchError::Timeout(_))
    ));
    release.send(()).unwrap();
    assert_eq!(completed.next_timeout(None).unwrap(), Some(task.clone()));
    assert_eq!(completed.next_timeout(None).unwrap(), None);
}

#[test]
fn test_logs_can_be_disabled() {
    let dir = TempDir::new().unwrap();
    let service = ScriptedService::default().with("quiet.bin", Script::new(vec![], Ok(json!({}))));
    let config = ServerConfig {
        write_logs: false,
        ..ServerConfig::default()
    };
    let server = DataServer::new(config, credentials(), Arc::new(service)).unwrap();
    let task = server.retrieve(request(&dir, "X", "quiet.bin")).unwrap();
    task.wait(None);

    assert!(task.log_path().is_none());
    assert!(!dir.path().join("quiet.bin.log").exists());
    assert_eq!(task.messages().first().map(String::as_str), Some(section::REQUEST));
}

#[test]
fn test_released_task_is_still_finalized() {
    let dir = TempDir::new().unwrap();
    let (script, release) =
        Script::new(vec!["Request is queued"], Ok(json!({"href": "http://host/x", "size": 2}))).gated();
    let service = ScriptedService::default().with("orphan.bin", script);
    let server = server(service, 1);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let task = server
        .retrieve_with(request(&dir, "X", "orphan.bin"), move |task| {
            sink.lock().unwrap().push(task.status());
        })
        .unwrap();
    drop(task);

    release.send(()).unwrap();
    server.shutdown(true);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![RequestStatus::Queued, RequestStatus::Complete]
    );
    let log = log_of(&dir.path().join("orphan.bin"));
    assert!(log.contains(section::OUTPUT));
    assert!(log.contains(section::ELAPSED));
}
