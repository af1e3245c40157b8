//! End-to-end lifecycle tests over real Unix sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use pinentryd::server::{PinentryServer, ServerConfig};
use pinentryd::{PinPrompt, Settings, Supervisor};

/// Prompt capability that answers with a fixed value and records calls.
struct FixedPrompt {
    value: Option<&'static str>,
    calls: Mutex<Vec<(Option<String>, Option<String>)>>,
}

impl FixedPrompt {
    fn new(value: Option<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            value,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl PinPrompt for FixedPrompt {
    async fn prompt_for_secret(
        &self,
        title: Option<&str>,
        prompt: Option<&str>,
    ) -> anyhow::Result<Option<String>> {
        self.calls
            .lock()
            .unwrap()
            .push((title.map(String::from), prompt.map(String::from)));
        Ok(self.value.map(String::from))
    }
}

fn fast_config(path: &std::path::Path) -> ServerConfig {
    ServerConfig::new(path)
        .with_handover_wait(Duration::from_millis(300))
        .with_health_check_interval(Duration::from_millis(100))
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(path: &std::path::Path) -> Self {
        let stream = UnixStream::connect(path).await.expect("connect failed");
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn expect(&mut self, want: &str) {
        let got = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("timed out waiting for response")
            .unwrap()
            .expect("connection closed unexpectedly");
        assert_eq!(got, want);
    }

    async fn expect_eof(mut self) {
        let got = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("timed out waiting for EOF")
            .unwrap();
        assert_eq!(got, None);
    }
}

#[tokio::test]
async fn full_session_over_the_socket() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("pinentry.sock");
    let prompt = FixedPrompt::new(Some("secret"));

    let mut server = PinentryServer::start(fast_config(&path), prompt.clone())
        .await
        .unwrap();

    let mut client = Client::connect(&path).await;
    client.expect("OK Pleased to meet you").await;
    client.send("SETDESC enter%20pin").await;
    client.expect("OK").await;
    client.send("GETPIN").await;
    client.expect("D secret").await;
    client.expect("OK").await;
    client.send("FOO").await;
    client.expect("Err Unexpected FOO").await;
    client.send("BYE").await;
    client.expect("OK closing connection").await;
    client.expect_eof().await;

    assert_eq!(
        prompt.calls.lock().unwrap().as_slice(),
        &[(Some("enter pin".to_string()), None)]
    );

    server.stop().await;
    assert!(!path.exists());
}

#[tokio::test]
async fn second_connection_is_refused_while_first_is_active() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("pinentry.sock");

    let mut server = PinentryServer::start(fast_config(&path), FixedPrompt::new(Some("pin")))
        .await
        .unwrap();

    let mut first = Client::connect(&path).await;
    first.expect("OK Pleased to meet you").await;

    // The second connection is accepted at the transport level and
    // immediately closed: no greeting, just EOF.
    let second = Client::connect(&path).await;
    second.expect_eof().await;

    // The first session is unaffected.
    first.send("SETPROMPT PIN:").await;
    first.expect("OK").await;
    first.send("BYE").await;
    first.expect("OK closing connection").await;

    server.stop().await;
}

#[tokio::test]
async fn new_instance_takes_over_from_a_live_one() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("pinentry.sock");

    let old = PinentryServer::start(fast_config(&path), FixedPrompt::new(None))
        .await
        .unwrap();
    assert!(old.is_running());

    // Starting a second instance at the same path sends the stop
    // sentinel, waits for the old instance to release the path, and
    // binds fresh.
    let mut new = PinentryServer::start(fast_config(&path), FixedPrompt::new(Some("pin")))
        .await
        .unwrap();

    // Give the old serve task a moment to finish winding down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!old.is_running());
    let mut client = Client::connect(&path).await;
    client.expect("OK Pleased to meet you").await;
    client.send("GETPIN").await;
    client.expect("D pin").await;
    client.expect("OK").await;

    new.stop().await;
}

#[tokio::test]
async fn startup_aborts_when_predecessor_will_not_release_the_path() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("pinentry.sock");

    // A listener that accepts but ignores the stop request and keeps the
    // socket file in place.
    let squatter = tokio::net::UnixListener::bind(&path).unwrap();
    let squatter_task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = squatter.accept().await {
            held.push(stream);
        }
    });

    let result = PinentryServer::start(fast_config(&path), FixedPrompt::new(None)).await;
    assert!(result.is_err(), "start should refuse to evict a live peer");
    assert!(path.exists(), "squatter's socket file must be left alone");

    squatter_task.abort();
}

#[tokio::test]
async fn stale_socket_file_is_removed_and_claimed() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("pinentry.sock");

    // A leftover file nothing is listening on (crashed predecessor).
    std::fs::File::create(&path).unwrap();

    let mut server = PinentryServer::start(fast_config(&path), FixedPrompt::new(None))
        .await
        .unwrap();

    let mut client = Client::connect(&path).await;
    client.expect("OK Pleased to meet you").await;

    server.stop().await;
}

#[tokio::test]
async fn rebinds_after_external_socket_removal() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("pinentry.sock");

    let mut server = PinentryServer::start(fast_config(&path), FixedPrompt::new(None))
        .await
        .unwrap();

    std::fs::remove_file(&path).unwrap();

    // Within a few health-check intervals the listener notices and
    // rebinds at the same path.
    let mut recovered = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if path.exists() {
            recovered = true;
            break;
        }
    }
    assert!(recovered, "socket file was not recreated");

    let mut client = Client::connect(&path).await;
    client.expect("OK Pleased to meet you").await;

    server.stop().await;
    assert!(!path.exists());
}

#[tokio::test]
async fn stop_is_idempotent() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("pinentry.sock");

    let mut server = PinentryServer::start(fast_config(&path), FixedPrompt::new(None))
        .await
        .unwrap();
    server.stop().await;
    assert!(!path.exists());
    assert!(!server.is_running());

    server.stop().await;
    assert!(!server.is_running());
}

#[tokio::test]
async fn supervisor_reconciles_settings_changes() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path_a = tmp.path().join("a.sock");
    let path_b = tmp.path().join("b.sock");

    let mut supervisor = Supervisor::new(FixedPrompt::new(Some("pin")));
    let mut settings = Settings {
        enabled: true,
        socket_path: Some(path_a.to_string_lossy().into_owned()),
        prompt_command: None,
    };

    supervisor.reconcile(&settings).await.unwrap();
    assert!(supervisor.is_running());
    assert!(path_a.exists());

    // Same settings again: no restart needed, still running.
    supervisor.reconcile(&settings).await.unwrap();
    assert!(supervisor.is_running());

    // Path change: the server moves to the new socket.
    settings.socket_path = Some(path_b.to_string_lossy().into_owned());
    supervisor.reconcile(&settings).await.unwrap();
    assert!(supervisor.is_running());
    assert!(!path_a.exists());
    assert!(path_b.exists());

    // Disabled: everything torn down.
    settings.enabled = false;
    supervisor.reconcile(&settings).await.unwrap();
    assert!(!supervisor.is_running());
    assert!(!path_b.exists());
}
