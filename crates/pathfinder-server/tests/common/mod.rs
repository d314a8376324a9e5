//! Test helpers: an in-process server and a raw protocol client.
//!
//! `TestServer` binds a single-domain server on an ephemeral TCP port
//! and serves it on the test runtime until dropped. `TestClient` speaks
//! the framed JSON protocol directly so tests can assert on exact
//! message sequences, notify-before-accept ordering included.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pathfinder_core::{ClientId, Props, ServiceId, SubscriptionId};
use pathfinder_server::config::DomainSpec;
use pathfinder_server::protocol::{
    Command, FailReason, FrameCodec, NotifyBody, Request, Response, ResponseBody,
};
use pathfinder_server::transport::{self, ListenAddr, Stream};
use pathfinder_server::{Server, ServerConfig};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

/// How long a test waits for any single expected message.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: ListenAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Starts a server for one domain spec, rewriting its address list
    /// to a single ephemeral TCP listener.
    pub async fn start(mut spec: DomainSpec) -> Self {
        spec.addrs = vec!["tcp:127.0.0.1:0".parse().unwrap()];
        let config = ServerConfig {
            domains: vec![spec],
        };
        let server = Server::bind(&config).await.expect("bind test server");
        let addr = server.local_addrs()[0][0].clone();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(server.run(async move {
            let _ = shutdown_rx.await;
        }));
        Self {
            addr,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Starts a server with an all-default domain.
    pub async fn start_default() -> Self {
        Self::start(DomainSpec::from_addrs("test", Vec::new())).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub struct TestClient {
    framed: Framed<Stream, FrameCodec>,
    next_ta: u64,
}

#[allow(dead_code)]
impl TestClient {
    pub async fn connect(addr: &ListenAddr) -> Self {
        let stream = transport::connect(addr).await.expect("connect");
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
            next_ta: 1,
        }
    }

    /// Sends a command under a fresh transaction id and returns the id.
    pub async fn send(&mut self, command: Command) -> u64 {
        let ta_id = self.next_ta;
        self.next_ta += 1;
        let request = Request { ta_id, command };
        self.framed
            .send(request.encode().expect("encode request"))
            .await
            .expect("send request");
        ta_id
    }

    /// Receives the next response, failing the test on timeout or EOF.
    pub async fn recv(&mut self) -> Response {
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a response")
            .expect("connection closed while waiting for a response")
            .expect("frame error");
        Response::decode(&frame).expect("decode response")
    }

    /// Receives until EOF, failing the test if more data arrives.
    pub async fn recv_eof(&mut self) {
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for EOF");
        assert!(frame.is_none(), "expected EOF, got {frame:?}");
    }

    /// Sends one command and returns its single response.
    pub async fn request(&mut self, command: Command) -> Response {
        let ta_id = self.send(command).await;
        let response = self.recv().await;
        assert_eq!(response.ta_id, ta_id, "response for the wrong transaction");
        response
    }

    /// Performs a default `hello` and returns the assigned client id.
    pub async fn hello(&mut self) -> ClientId {
        self.hello_proposing(None)
            .await
            .expect("hello should be accepted")
    }

    /// Performs a `hello`, optionally proposing a client id.
    pub async fn hello_proposing(
        &mut self,
        client_id: Option<ClientId>,
    ) -> Result<ClientId, FailReason> {
        let response = self
            .request(Command::Hello {
                min_version: 2,
                max_version: 2,
                client_id,
            })
            .await;
        match response.body {
            ResponseBody::Accept(accept) => {
                assert_eq!(accept.proto_version, Some(2));
                Ok(accept.client_id.expect("hello accept carries a client id"))
            },
            ResponseBody::Fail { reason } => Err(reason),
            other => panic!("unexpected hello response: {other:?}"),
        }
    }

    /// Publishes and returns the single response body.
    pub async fn publish(
        &mut self,
        service_id: ServiceId,
        generation: u32,
        props: Props,
        ttl: u64,
    ) -> ResponseBody {
        self.request(Command::Publish {
            service_id,
            generation,
            props,
            ttl,
        })
        .await
        .body
    }

    /// Subscribes; returns the transaction id and the `appeared` rows
    /// reported before the `accept`.
    pub async fn subscribe(
        &mut self,
        subscription_id: SubscriptionId,
        filter: Option<&str>,
    ) -> Result<(u64, Vec<NotifyBody>), FailReason> {
        let ta_id = self
            .send(Command::Subscribe {
                subscription_id,
                filter: filter.map(str::to_owned),
            })
            .await;

        let mut initial = Vec::new();
        loop {
            let response = self.recv().await;
            assert_eq!(response.ta_id, ta_id);
            match response.body {
                ResponseBody::Notify(body) => initial.push(body),
                ResponseBody::Accept(_) => return Ok((ta_id, initial)),
                ResponseBody::Fail { reason } => return Err(reason),
                ResponseBody::Complete => panic!("subscribe never completes"),
            }
        }
    }

    /// Runs a multi-response listing to completion and returns its rows.
    pub async fn listing(&mut self, command: Command) -> Vec<NotifyBody> {
        let ta_id = self.send(command).await;
        let response = self.recv().await;
        assert_eq!(response.ta_id, ta_id);
        assert!(
            matches!(response.body, ResponseBody::Accept(_)),
            "listing should open with accept, got {response:?}"
        );

        let mut rows = Vec::new();
        loop {
            let response = self.recv().await;
            assert_eq!(response.ta_id, ta_id);
            match response.body {
                ResponseBody::Notify(body) => rows.push(body),
                ResponseBody::Complete => return rows,
                other => panic!("unexpected listing response: {other:?}"),
            }
        }
    }

    /// Round-trips a `ping`, proving no other message was pending ahead
    /// of it on this session.
    pub async fn ping_fence(&mut self) {
        let response = self.request(Command::Ping).await;
        assert!(
            matches!(response.body, ResponseBody::Accept(_)),
            "ping should be accepted, got {response:?}"
        );
    }
}

/// Builds a property bag from string pairs.
pub fn props(pairs: &[(&str, &str)]) -> Props {
    let mut props = Props::new();
    for (key, value) in pairs {
        props.add(*key, *value);
    }
    props
}

/// Unwraps a `fail` body.
pub fn fail_reason(body: &ResponseBody) -> FailReason {
    match body {
        ResponseBody::Fail { reason } => *reason,
        other => panic!("expected fail, got {other:?}"),
    }
}
