//! Test doubles shared by the plugin and control loop tests.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;

use crate::config::KUBELET_SOCKET_NAME;
use crate::plugin::api::v1beta1::registration_server::Registration;
use crate::plugin::api::v1beta1::registration_server::RegistrationServer;
use crate::plugin::api::v1beta1::Empty;
use crate::plugin::api::v1beta1::RegisterRequest;

type Requests = Arc<Mutex<Vec<RegisterRequest>>>;

struct KubeletRegistration {
    requests: Requests,
}

#[tonic::async_trait]
impl Registration for KubeletRegistration {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

/// Kubelet registration endpoint that records every `Register` call.
pub(crate) struct FakeKubelet {
    socket_path: PathBuf,
    requests: Requests,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl FakeKubelet {
    /// Serve on `kubelet.sock` inside `dir`.
    pub(crate) async fn start(dir: &Path) -> Self {
        let socket_path = dir.join(KUBELET_SOCKET_NAME);
        let _ = fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path).expect("bind fake kubelet socket");

        let requests = Requests::default();
        let token = CancellationToken::new();
        let service = RegistrationServer::new(KubeletRegistration {
            requests: requests.clone(),
        });
        let shutdown = token.clone();
        let handle = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(
                    UnixListenerStream::new(listener),
                    shutdown.cancelled_owned(),
                )
                .await
                .expect("fake kubelet serve");
        });

        Self {
            socket_path,
            requests,
            token,
            handle: Some(handle),
        }
    }

    pub(crate) fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub(crate) fn requests(&self) -> Vec<RegisterRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resource names registered so far, in arrival order.
    pub(crate) fn registered_resources(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|request| request.resource_name)
            .collect()
    }

    /// Wait until at least `count` registrations arrived.
    pub(crate) async fn wait_for_requests(&self, count: usize) -> Vec<RegisterRequest> {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let requests = self.requests();
                if requests.len() >= count {
                    return requests;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("registrations should arrive")
    }

    /// Shut down and remove the socket, like a kubelet going away.
    pub(crate) async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.expect("fake kubelet task");
        }
        let _ = fs::remove_file(&self.socket_path);
    }
}

impl Drop for FakeKubelet {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub(crate) async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(outcome.is_ok(), "timed out waiting for {what}");
}
