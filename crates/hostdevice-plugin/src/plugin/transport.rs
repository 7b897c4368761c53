//! gRPC over Unix domain sockets.

use std::io;
use std::path::Path;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio::time::Instant;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Status;
use tower::service_fn;
use tracing::debug;

use super::api::v1beta1::device_plugin_client::DevicePluginClient;
use super::api::v1beta1::Empty;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Open a gRPC channel to the server listening on `socket_path`.
pub async fn connect_unix(
    socket_path: &Path,
    timeout: Duration,
) -> Result<Channel, tonic::transport::Error> {
    let socket_path = socket_path.to_path_buf();

    // the authority is ignored, the connector always dials the socket
    Endpoint::from_static("http://[::]:50051")
        .connect_timeout(timeout)
        .timeout(timeout)
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                let stream = UnixStream::connect(socket_path).await?;
                Ok::<_, io::Error>(TokioIo::new(stream))
            }
        }))
        .await
}

/// Poll the device plugin service on `socket_path` until it answers a call,
/// or `timeout` elapses.
pub async fn wait_until_serving(socket_path: &Path, timeout: Duration) -> Result<(), Status> {
    let deadline = Instant::now() + timeout;
    loop {
        let attempt = tokio::time::timeout_at(deadline, query_options(socket_path, timeout)).await;
        match attempt {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(status)) if Instant::now() + POLL_INTERVAL < deadline => {
                debug!("{} not serving yet: {status}", socket_path.display());
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Ok(Err(status)) => return Err(status),
            Err(_) => {
                return Err(Status::deadline_exceeded(format!(
                    "timed out waiting for {} to serve",
                    socket_path.display()
                )))
            }
        }
    }
}

async fn query_options(socket_path: &Path, timeout: Duration) -> Result<(), Status> {
    let channel = connect_unix(socket_path, timeout)
        .await
        .map_err(|e| Status::unavailable(format!("dial {}: {e}", socket_path.display())))?;
    DevicePluginClient::new(channel)
        .get_device_plugin_options(Request::new(Empty {}))
        .await?;
    Ok(())
}
