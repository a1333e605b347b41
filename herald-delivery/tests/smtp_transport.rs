//! Integration tests for the SMTP transport against a scripted server.

use std::sync::{Arc, Mutex};

use herald_delivery::{Message, SmtpConfig, SmtpTransport, Transport, TransportError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// Start a scripted SMTP server on a random port.
///
/// The server accepts a single session, answers the usual submission
/// sequence, and records every received command line. `reject_rcpt`
/// makes it answer RCPT TO with a transient 451.
async fn start_scripted_server(reject_rcpt: bool) -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let received = Arc::new(Mutex::new(Vec::new()));

    let log = received.clone();
    tokio::spawn(async move {
        let (stream, _peer) = listener.accept().await.expect("accept");
        let _ = serve_session(stream, log, reject_rcpt).await;
    });

    (port, received)
}

async fn serve_session(
    mut stream: TcpStream,
    log: Arc<Mutex<Vec<String>>>,
    reject_rcpt: bool,
) -> std::io::Result<()> {
    stream.write_all(b"220 mock.example.org ESMTP\r\n").await?;

    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut in_data = false;

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..n]);

        while let Some(pos) = buffer.windows(2).position(|w| w == b"\r\n") {
            let line: Vec<u8> = buffer.drain(..pos + 2).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 2]).into_owned();

            if in_data {
                if line == "." {
                    in_data = false;
                    stream.write_all(b"250 Queued\r\n").await?;
                }
                continue;
            }

            log.lock().expect("log mutex poisoned").push(line.clone());

            let upper = line.to_uppercase();
            if upper.starts_with("EHLO") {
                stream
                    .write_all(b"250-mock.example.org\r\n250 SIZE 10000000\r\n")
                    .await?;
            } else if upper.starts_with("MAIL FROM") {
                stream.write_all(b"250 OK\r\n").await?;
            } else if upper.starts_with("RCPT TO") {
                if reject_rcpt {
                    stream.write_all(b"451 Try again later\r\n").await?;
                } else {
                    stream.write_all(b"250 OK\r\n").await?;
                }
            } else if upper.starts_with("DATA") {
                in_data = true;
                stream.write_all(b"354 Go ahead\r\n").await?;
            } else if upper.starts_with("QUIT") {
                stream.write_all(b"221 Bye\r\n").await?;
                return Ok(());
            } else {
                stream.write_all(b"502 Not implemented\r\n").await?;
            }
        }
    }
}

fn config_for(port: u16) -> SmtpConfig {
    SmtpConfig {
        host: "127.0.0.1".to_string(),
        port,
        username: None,
        password: None,
        require_tls: false,
        timeout_secs: 5,
        hello_name: "herald.test".to_string(),
    }
}

fn sample_message() -> Message {
    Message {
        from: "\"Campaign\" <campaign@example.org>".to_string(),
        to: "recipient@example.com".to_string(),
        subject: "Hello".to_string(),
        html: "<p>Hi there</p>".to_string(),
    }
}

#[tokio::test]
async fn test_submission_sequence() {
    let (port, received) = start_scripted_server(false).await;

    let transport = SmtpTransport::new(config_for(port));
    transport
        .send(&sample_message())
        .await
        .expect("Delivery should succeed");

    let commands = received.lock().expect("log mutex poisoned").clone();
    assert_eq!(commands[0], "EHLO herald.test");
    assert_eq!(commands[1], "MAIL FROM:<campaign@example.org>");
    assert_eq!(commands[2], "RCPT TO:<recipient@example.com>");
    assert_eq!(commands[3], "DATA");
    assert_eq!(commands[4], "QUIT");
}

#[tokio::test]
async fn test_rejected_recipient_fails_the_attempt() {
    let (port, _received) = start_scripted_server(true).await;

    let transport = SmtpTransport::new(config_for(port));
    let result = transport.send(&sample_message()).await;

    match result {
        Err(TransportError::Rejected { command, response }) => {
            assert_eq!(command, "RCPT TO");
            assert!(response.starts_with("451"));
        }
        other => panic!("Expected RCPT TO rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unreachable_server_is_a_connect_failure() {
    // Bind then drop a listener so the port is very likely unused
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);

    let transport = SmtpTransport::new(config_for(port));
    let result = transport.send(&sample_message()).await;
    assert!(matches!(
        result,
        Err(TransportError::Connect(_) | TransportError::Timeout(_))
    ));
}
