use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use devmail_rs::config::Config;
use devmail_rs::events::EventKind;
use devmail_rs::server::MailServer;
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// Start a server on an ephemeral port with a private mail directory
async fn start_server(customize: impl FnOnce(&mut Config)) -> (MailServer, SocketAddr, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.server.hostname = "test.localhost".to_string();
    config.smtp.host = "127.0.0.1".to_string();
    config.smtp.port = 0;
    config.storage.mail_dir = dir.path().join("mail");
    customize(&mut config);

    let server = MailServer::new(config).await.unwrap();
    let addr = server.listen().await.unwrap();
    (server, addr, dir)
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> (Self, String) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        let greeting = client.reply().await;
        (client, greeting)
    }

    /// Read a complete, possibly multi-line, reply
    async fn reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("reply timed out")
                .unwrap();
            reply.push_str(&line);
            if line.len() < 4 || line.as_bytes()[3] == b' ' {
                return reply;
            }
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn command(&mut self, line: &str) -> String {
        self.send(line).await;
        self.reply().await
    }
}

async fn wait_for_count(server: &MailServer, count: usize) {
    for _ in 0..100 {
        if server.store().len().await == count {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("store never reached {} message(s)", count);
}

#[tokio::test]
async fn test_smtp_greeting_and_ehlo() {
    let (server, addr, _dir) = start_server(|_| {}).await;
    let (mut client, greeting) = Client::connect(addr).await;

    assert!(greeting.starts_with("220 test.localhost"), "got: {}", greeting);

    let ehlo = client.command("EHLO test.client").await;
    assert!(ehlo.starts_with("250-test.localhost"), "got: {}", ehlo);
    assert!(ehlo.contains("SIZE 1048576"));
    assert!(ehlo.contains("8BITMIME"));
    assert!(!ehlo.contains("STARTTLS"));
    assert!(!ehlo.contains("AUTH"));

    assert!(client.command("QUIT").await.starts_with("221"));
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_smtp_full_transaction() {
    let (server, addr, _dir) = start_server(|_| {}).await;
    let (mut client, _) = Client::connect(addr).await;

    assert!(client.command("HELO test.client").await.starts_with("250"));
    assert!(client
        .command("MAIL FROM:<sender@example.com>")
        .await
        .starts_with("250"));
    assert!(client
        .command("RCPT TO:<visible@example.com>")
        .await
        .starts_with("250"));
    assert!(client
        .command("RCPT TO:<hidden@example.com>")
        .await
        .starts_with("250"));
    assert!(client.command("DATA").await.starts_with("354"));

    client.send("From: Sender <sender@example.com>").await;
    client.send("To: visible@example.com").await;
    client.send("Subject: Integration").await;
    client.send("").await;
    client.send("first line").await;
    client.send("..leading dot").await;
    let accepted = client.command(".").await;
    assert!(accepted.starts_with("250"), "got: {}", accepted);

    wait_for_count(&server, 1).await;
    let email = server.store().get_all().await.remove(0);

    assert_eq!(email.subject, "Integration");
    assert!(email.text.starts_with("first line"));
    assert!(email.text.ends_with("\n.leading dot"));
    assert_eq!(email.calculated_bcc[0].address, "hidden@example.com");

    let envelope = email.envelope.unwrap();
    assert_eq!(envelope.from, "sender@example.com");
    assert_eq!(envelope.host, "test.client");
    assert!(envelope.remote_address.starts_with("127.0.0.1:"));

    let raw = server.store().get_raw_content(&email.id).await.unwrap();
    assert!(String::from_utf8_lossy(&raw).contains("\r\n.leading dot\r\n"));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_smtp_bad_sequences() {
    let (server, addr, _dir) = start_server(|_| {}).await;
    let (mut client, _) = Client::connect(addr).await;

    assert!(client
        .command("MAIL FROM:<a@example.com>")
        .await
        .starts_with("503"));
    client.command("EHLO test.client").await;
    assert!(client
        .command("RCPT TO:<b@example.com>")
        .await
        .starts_with("503"));
    assert!(client.command("DATA").await.starts_with("503"));
    assert!(client.command("VRFY someone").await.starts_with("502"));
    assert!(client.command("NOOP").await.starts_with("250"));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_smtp_too_many_recipients() {
    let (server, addr, _dir) = start_server(|config| config.smtp.max_recipients = 2).await;
    let (mut client, _) = Client::connect(addr).await;

    client.command("EHLO test.client").await;
    client.command("MAIL FROM:<a@example.com>").await;
    assert!(client.command("RCPT TO:<1@example.com>").await.starts_with("250"));
    assert!(client.command("RCPT TO:<2@example.com>").await.starts_with("250"));
    assert!(client.command("RCPT TO:<3@example.com>").await.starts_with("452"));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_smtp_message_too_large_keeps_connection() {
    let (server, addr, _dir) = start_server(|config| config.smtp.max_message_size = 64).await;
    let (mut client, _) = Client::connect(addr).await;

    client.command("EHLO test.client").await;
    client.command("MAIL FROM:<a@example.com>").await;
    client.command("RCPT TO:<b@example.com>").await;
    client.command("DATA").await;
    client.send("Subject: big").await;
    client.send("").await;
    for _ in 0..10 {
        client.send("0123456789012345678901234567890123456789").await;
    }
    let rejected = client.command(".").await;
    assert!(rejected.starts_with("552"), "got: {}", rejected);

    assert!(client.command("NOOP").await.starts_with("250"));
    assert!(client
        .command("MAIL FROM:<a@example.com>")
        .await
        .starts_with("250"));
    assert!(server.store().is_empty().await);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_smtp_unparseable_message_is_rejected() {
    let (server, addr, _dir) = start_server(|_| {}).await;
    let (mut client, _) = Client::connect(addr).await;

    client.command("EHLO test.client").await;
    client.command("MAIL FROM:<a@example.com>").await;
    client.command("RCPT TO:<b@example.com>").await;
    client.command("DATA").await;
    let rejected = client.command(".").await;
    assert!(rejected.starts_with("554"), "got: {}", rejected);

    assert!(client.command("NOOP").await.starts_with("250"));
    assert!(server.store().is_empty().await);

    server.close().await.unwrap();
}

fn with_credentials(config: &mut Config) {
    config.smtp.auth_username = Some("dev".to_string());
    config.smtp.auth_password = Some("secret".to_string());
}

#[tokio::test]
async fn test_smtp_auth_plain() {
    let (server, addr, _dir) = start_server(with_credentials).await;
    let (mut client, _) = Client::connect(addr).await;

    let ehlo = client.command("EHLO test.client").await;
    assert!(ehlo.contains("AUTH PLAIN LOGIN"));

    let wrong = BASE64.encode(b"\0dev\0wrong");
    assert!(client
        .command(&format!("AUTH PLAIN {}", wrong))
        .await
        .starts_with("535"));

    let right = BASE64.encode(b"\0dev\0secret");
    assert!(client
        .command(&format!("AUTH PLAIN {}", right))
        .await
        .starts_with("235"));
    assert!(client
        .command(&format!("AUTH PLAIN {}", right))
        .await
        .starts_with("503"));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_smtp_auth_login() {
    let (server, addr, _dir) = start_server(with_credentials).await;
    let (mut client, _) = Client::connect(addr).await;

    client.command("EHLO test.client").await;
    assert_eq!(client.command("AUTH LOGIN").await, "334 VXNlcm5hbWU6\r\n");
    assert_eq!(
        client.command(&BASE64.encode("dev")).await,
        "334 UGFzc3dvcmQ6\r\n"
    );
    assert!(client
        .command(&BASE64.encode("secret"))
        .await
        .starts_with("235"));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_smtp_unauthenticated_sender_is_accepted() {
    let (server, addr, _dir) = start_server(with_credentials).await;
    let (mut client, _) = Client::connect(addr).await;

    client.command("EHLO test.client").await;
    assert!(client
        .command("MAIL FROM:<anonymous@example.com>")
        .await
        .starts_with("250"));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_smtp_new_event_is_emitted() {
    let (server, addr, _dir) = start_server(|_| {}).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .on(EventKind::New, move |email| {
            let _ = tx.send(email.subject.clone());
        })
        .await;

    let (mut client, _) = Client::connect(addr).await;
    client.command("EHLO test.client").await;
    client.command("MAIL FROM:<a@example.com>").await;
    client.command("RCPT TO:<b@example.com>").await;
    client.command("DATA").await;
    client.send("Subject: Event").await;
    client.send("").await;
    client.send("body").await;
    client.command(".").await;

    let subject = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subject, "Event");

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_messages_survive_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.smtp.host = "127.0.0.1".to_string();
    config.smtp.port = 0;
    config.storage.mail_dir = dir.path().join("mail");

    let server = MailServer::new(config.clone()).await.unwrap();
    let addr = server.listen().await.unwrap();
    let (mut client, _) = Client::connect(addr).await;
    client.command("EHLO test.client").await;
    client.command("MAIL FROM:<a@example.com>").await;
    client.command("RCPT TO:<b@example.com>").await;
    client.command("DATA").await;
    client.send("Subject: Persisted").await;
    client.send("").await;
    client.send("still here").await;
    client.command(".").await;
    client.command("QUIT").await;
    wait_for_count(&server, 1).await;
    let id = server.store().get_all().await[0].id.clone();
    server.close().await.unwrap();

    let restarted = MailServer::new(config).await.unwrap();
    let email = restarted.store().get(&id).await.unwrap();
    assert_eq!(email.subject, "Persisted");
    assert!(email.read);
}
