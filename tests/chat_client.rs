use mini_chat::Error;
use mini_chat::config::Settings;
use mini_chat::conversation::{Conversation, Role};
use mini_chat::llm::{ChatClient, ChatRequest};
use mockito::{Matcher, Server};
use serde_json::json;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

fn settings(base_url: &str, api_key: &str) -> Settings {
    Settings {
        api_base_url: base_url.to_string(),
        api_key: api_key.to_string(),
        ..Settings::default()
    }
}

fn conversation() -> Conversation {
    let mut c = Conversation::with_system_prompt("You are terse.");
    c.append(Role::User, "hi");
    c
}

fn delta_frame(text: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({"choices": [{"index": 0, "delta": {"content": text}}]})
    )
}

#[tokio::test]
async fn streaming_assembles_deltas_in_arrival_order() {
    let mut server = Server::new_async().await;
    let body = format!(
        "{}{}{}data: [DONE]\n\n{}",
        delta_frame("Hello"),
        delta_frame(", "),
        delta_frame("world"),
        delta_frame(" (after done)")
    );
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_header("content-type", "application/json")
        .match_body(Matcher::PartialJson(json!({
            "model": "gpt-4o-mini",
            "stream": true,
            "max_tokens": 1000,
            "temperature": 0.7,
            "messages": [
                {"role": "system", "content": "You are terse."},
                {"role": "user", "content": "hi"}
            ]
        })))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let client = ChatClient::new().unwrap();
    let mut seen = Vec::new();
    let mut on_delta = |d: &str| seen.push(d.to_string());
    let text = client
        .send(
            &conversation(),
            &settings(&server.url(), "sk-test"),
            Some(&mut on_delta),
        )
        .await
        .unwrap();

    assert_eq!(text, "Hello, world");
    assert_eq!(seen, vec!["Hello", ", ", "world"]);
    mock.assert_async().await;
}

#[tokio::test]
async fn malformed_frames_do_not_abort_the_stream() {
    let mut server = Server::new_async().await;
    let body = format!(
        "{}: keep-alive\n\ndata: {{not json\n\n\n{}data: {}\n\n{}data: [DONE]\n\n",
        delta_frame("one"),
        delta_frame("two"),
        json!({"choices": [{"delta": {"role": "assistant"}}]}),
        delta_frame("three"),
    );
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let client = ChatClient::new().unwrap();
    let mut calls = 0;
    let mut on_delta = |_: &str| calls += 1;
    let text = client
        .send(
            &conversation(),
            &settings(&server.url(), "sk-test"),
            Some(&mut on_delta),
        )
        .await
        .unwrap();

    assert_eq!(text, "onetwothree");
    assert_eq!(calls, 3);
}

#[tokio::test]
async fn stream_without_done_returns_what_arrived() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(format!("{}{}", delta_frame("par"), delta_frame("tial")))
        .create_async()
        .await;

    let client = ChatClient::new().unwrap();
    let mut on_delta = |_: &str| {};
    let text = client
        .send(
            &conversation(),
            &settings(&server.url(), "sk-test"),
            Some(&mut on_delta),
        )
        .await
        .unwrap();
    assert_eq!(text, "partial");
}

#[tokio::test]
async fn non_streaming_returns_first_choice_content() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::PartialJson(json!({"stream": false})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "id": "chatcmpl-1",
                "choices": [
                    {"index": 0, "message": {"role": "assistant", "content": "first"}},
                    {"index": 1, "message": {"role": "assistant", "content": "second"}}
                ]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let client = ChatClient::new().unwrap();
    let text = client
        .send(&conversation(), &settings(&server.url(), "sk-test"), None)
        .await
        .unwrap();

    assert_eq!(text, "first");
    mock.assert_async().await;
}

#[tokio::test]
async fn http_error_preserves_status_and_body() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(401)
        .with_body("Unauthorized")
        .create_async()
        .await;

    let client = ChatClient::new().unwrap();
    let err = client
        .send(&conversation(), &settings(&server.url(), "sk-bad"), None)
        .await
        .unwrap_err();

    match err {
        Error::Remote { status, body } => {
            assert_eq!(status, 401);
            assert_eq!(body, "Unauthorized");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn http_error_on_streaming_path() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(429)
        .with_body(r#"{"error":{"message":"slow down"}}"#)
        .create_async()
        .await;

    let client = ChatClient::new().unwrap();
    let mut on_delta = |d: &str| assert!(d.is_empty(), "no deltas expected, got {d}");
    let err = client
        .send(
            &conversation(),
            &settings(&server.url(), "sk-test"),
            Some(&mut on_delta),
        )
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), Some(429));
    assert!(err.to_string().contains("slow down"));
}

#[tokio::test]
async fn unexpected_success_shape_is_a_protocol_error() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(r#"{"object": "chat.completion"}"#)
        .create_async()
        .await;

    let client = ChatClient::new().unwrap();
    let err = client
        .send(&conversation(), &settings(&server.url(), "sk-test"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
}

#[tokio::test]
async fn empty_choices_is_a_protocol_error() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(r#"{"choices": []}"#)
        .create_async()
        .await;

    let client = ChatClient::new().unwrap();
    let err = client
        .send(&conversation(), &settings(&server.url(), "sk-test"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
}

#[tokio::test]
async fn missing_credential_never_touches_the_network() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let client = ChatClient::new().unwrap();
    let err = client
        .send(&conversation(), &settings(&server.url(), ""), None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MissingCredential));
    mock.assert_async().await;
}

#[tokio::test]
async fn connection_refused_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = ChatClient::new().unwrap();
    let err = client
        .send(
            &conversation(),
            &settings(&format!("http://{addr}"), "sk-test"),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "got {err:?}");
}

#[tokio::test]
async fn trailing_slash_in_base_url_is_tolerated() {
    let request = ChatRequest::new(
        &conversation(),
        &settings("https://example.test/v1/", "k"),
        true,
    );
    assert_eq!(request.url(), "https://example.test/v1/chat/completions");
    assert!(request.is_streaming());
}

#[tokio::test]
async fn cancellation_closes_the_connection() {
    // A server that accepts and reads but never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = closed_tx.send(());
    });

    let client = ChatClient::new().unwrap();
    let request = ChatRequest::new(
        &conversation(),
        &settings(&format!("http://{addr}"), "sk-test"),
        true,
    );
    let mut on_delta = |_: &str| {};
    let started = std::time::Instant::now();
    let err = client
        .execute_until(
            request,
            Some(&mut on_delta),
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    tokio::time::timeout(Duration::from_secs(5), closed_rx)
        .await
        .expect("connection should be closed after cancellation")
        .unwrap();
}
