#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use capability_engine::process::{OutputChunk, ProcessRunner, ProcessStatus, RunRequest, TokioProcessRunner};
use tokio_util::sync::CancellationToken;

fn request(program: &str, args: &[&str], timeout: Duration) -> RunRequest {
    RunRequest::new(program, args.iter().map(|a| a.to_string()).collect(), timeout)
}

fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[tokio::test]
async fn timeout_terminates_process() {
    let runner = TokioProcessRunner::default();
    let started = Instant::now();
    let outcome = runner
        .run(request("sleep", &["5"], Duration::from_secs(2)), CancellationToken::new(), None)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.status, ProcessStatus::TimedOut);
    assert_eq!(outcome.exit_code, None);
    assert!(elapsed >= Duration::from_secs(2), "returned early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2800), "took {:?}", elapsed);
    assert!(!process_alive(outcome.pid.unwrap()));
}

#[tokio::test]
async fn cancellation_releases_process_within_grace() {
    let runner = TokioProcessRunner::default();
    let token = CancellationToken::new();

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
            Instant::now()
        })
    };

    let outcome = runner
        .run(request("sleep", &["30"], Duration::from_secs(60)), token, None)
        .await
        .unwrap();
    let returned = Instant::now();
    let cancelled_at = canceller.await.unwrap();

    assert_eq!(outcome.status, ProcessStatus::Cancelled);
    assert!(returned.duration_since(cancelled_at) < Duration::from_millis(500));
    assert!(!process_alive(outcome.pid.unwrap()));
}

#[tokio::test]
async fn sigterm_ignoring_process_is_killed_after_grace() {
    let runner = TokioProcessRunner::default();
    let started = Instant::now();
    let outcome = runner
        .run(
            request("sh", &["-c", "trap '' TERM; sleep 30"], Duration::from_millis(300)),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, ProcessStatus::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!process_alive(outcome.pid.unwrap()));
}

#[tokio::test]
async fn metacharacters_are_literal_arguments() {
    let runner = TokioProcessRunner::default();
    let outcome = runner
        .run(
            request("printf", &["%s", "; rm -rf / && echo $HOME `id`"], Duration::from_secs(5)),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(outcome.success());
    assert_eq!(outcome.stdout, "; rm -rf / && echo $HOME `id`");
}

#[tokio::test]
async fn output_arrives_incrementally() {
    let runner = TokioProcessRunner::default();
    let chunks: Arc<Mutex<Vec<OutputChunk>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = chunks.clone();

    let outcome = runner
        .run(
            request("seq", &["1", "3"], Duration::from_secs(5)),
            CancellationToken::new(),
            Some(Arc::new(move |chunk: OutputChunk| sink.lock().unwrap().push(chunk))),
        )
        .await
        .unwrap();

    assert_eq!(outcome.stdout, "1\n2\n3\n");
    let streamed: String = chunks.lock().unwrap().iter().map(|c| c.text.as_str()).collect();
    assert_eq!(streamed, outcome.stdout);
}
