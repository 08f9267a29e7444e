//! HTTP server that answers the orchestrator's volume plugin calls and
//! dispatches them to a [`VolumeDriver`].
//!
//! The plugin is discovered either through a spec file containing
//! `tcp://<addr>` or through a unix socket in the plugin directory.  Both are
//! removed again when [`PluginServer::serve`] returns.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hyper::header::CONTENT_TYPE as CONTENT_TYPE_HEADER;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use nix::errno::Errno;
use nix::unistd::{Group, chown};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info, instrument, warn};

use crate::driver::VolumeDriver;
use crate::error::VolumeError;
use crate::message::{
    CONTENT_TYPE, CapabilitySet, DecodeError, IMPLEMENTS, PluginRequest, PluginResponse,
};

const SOCKET_MODE: u32 = 0o660;

/// Pause after an `accept` that failed for lack of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where the plugin listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP address advertised through `<spec_dir>/<plugin>.spec`.
    Tcp { addr: SocketAddr, spec_dir: PathBuf },
    /// Unix socket at `<socket_dir>/<plugin>.sock`, optionally owned by
    /// `group`.
    Unix {
        socket_dir: PathBuf,
        group: Option<String>,
    },
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A bound plugin endpoint serving one driver.
pub struct PluginServer<T> {
    listener: Listener,
    /// Spec file or socket to remove on shutdown.
    discovery: PathBuf,
    handler: Arc<T>,
}

impl<T> PluginServer<T>
where
    T: VolumeDriver + 'static,
{
    /// Bind `listen` and publish the discovery file for plugin `name`.
    pub async fn bind(name: &str, listen: &ListenAddr, handler: Arc<T>) -> Result<Self, VolumeError> {
        match listen {
            ListenAddr::Tcp { addr, spec_dir } => {
                let listener = TcpListener::bind(addr).await.map_err(VolumeError::transport)?;
                let local = listener.local_addr().map_err(VolumeError::transport)?;
                let spec = spec_dir.join(format!("{name}.spec"));
                write_spec_file(&spec, &local).await?;
                info!(addr = %local, spec = %spec.display(), "plugin listening on tcp");
                Ok(Self {
                    listener: Listener::Tcp(listener),
                    discovery: spec,
                    handler,
                })
            }
            ListenAddr::Unix { socket_dir, group } => {
                let socket = socket_dir.join(format!("{name}.sock"));
                let listener = bind_unix(&socket, group.as_deref()).await?;
                info!(socket = %socket.display(), "plugin listening on unix socket");
                Ok(Self {
                    listener: Listener::Unix(listener),
                    discovery: socket,
                    handler,
                })
            }
        }
    }

    /// Bound TCP address, if listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }

    /// Spec file or socket path the orchestrator discovers the plugin by.
    pub fn discovery_path(&self) -> &Path {
        &self.discovery
    }

    /// Accept connections until `shutdown` resolves, then remove the
    /// discovery file.  Each connection is served on its own task.
    ///
    /// A failed `accept` is logged and the loop carries on; when the process
    /// is out of file descriptors it pauses briefly first.
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        accept_until(shutdown, || self.accept()).await;

        info!(path = %self.discovery.display(), "plugin shutting down");
        if let Err(e) = tokio::fs::remove_file(&self.discovery).await {
            warn!(path = %self.discovery.display(), error = %e, "failed to remove discovery file");
        }
    }

    async fn accept(&self) -> io::Result<()> {
        match &self.listener {
            Listener::Tcp(l) => {
                let (stream, remote) = l.accept().await?;
                debug!(%remote, "plugin connection accepted");
                spawn_connection(stream, Arc::clone(&self.handler));
            }
            Listener::Unix(l) => {
                let (stream, _) = l.accept().await?;
                debug!("plugin connection accepted");
                spawn_connection(stream, Arc::clone(&self.handler));
            }
        }
        Ok(())
    }
}

/// Run `accept` repeatedly until `shutdown` resolves.
async fn accept_until<F, A, Fut>(shutdown: F, mut accept: A)
where
    F: Future<Output = ()>,
    A: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    tokio::pin!(shutdown);
    loop {
        let accepted = tokio::select! {
            _ = &mut shutdown => return,
            accepted = accept() => accepted,
        };
        let Err(e) = accepted else { continue };

        warn!(error = %e, "failed to accept plugin connection");
        if out_of_descriptors(&e) {
            tokio::select! {
                _ = &mut shutdown => return,
                _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
            }
        }
    }
}

fn out_of_descriptors(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == Errno::EMFILE as i32 || code == Errno::ENFILE as i32
    )
}

fn spawn_connection<S, T>(stream: S, handler: Arc<T>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: VolumeDriver + 'static,
{
    tokio::spawn(async move {
        let service = service_fn(move |req| {
            let handler = Arc::clone(&handler);
            async move { Ok::<_, Infallible>(handle_request(handler.as_ref(), req).await) }
        });
        if let Err(e) = Http::new().serve_connection(stream, service).await {
            warn!(error = %e, "plugin connection error");
        }
    });
}

/// Read one plugin call, dispatch it, and render the response.
#[instrument(skip_all, fields(path = %req.uri().path()))]
pub async fn handle_request<T>(handler: &T, req: Request<Body>) -> Response<Body>
where
    T: VolumeDriver + ?Sized,
{
    if req.method() != Method::POST {
        return respond(
            StatusCode::METHOD_NOT_ALLOWED,
            &PluginResponse::error(format!("method {} not allowed", req.method())),
        );
    }

    let path = req.uri().path().to_owned();
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) => b,
        Err(e) => {
            return respond(
                StatusCode::BAD_REQUEST,
                &PluginResponse::error(format!("failed to read request body: {e}")),
            );
        }
    };

    let request = match PluginRequest::decode(&path, &body) {
        Ok(r) => r,
        Err(e @ DecodeError::UnknownRoute(_)) => {
            return respond(StatusCode::NOT_FOUND, &PluginResponse::error(e));
        }
        Err(e @ DecodeError::Malformed(_)) => {
            return respond(StatusCode::BAD_REQUEST, &PluginResponse::error(e));
        }
    };

    debug!(%request, "plugin request received");
    let response = dispatch(handler, request).await;
    let status = if response.is_error() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    respond(status, &response)
}

/// Map a [`PluginRequest`] to the matching driver call.
async fn dispatch<T>(handler: &T, request: PluginRequest) -> PluginResponse
where
    T: VolumeDriver + ?Sized,
{
    let mountpoint = |p: PathBuf| PluginResponse::Mountpoint {
        mountpoint: p.display().to_string(),
    };

    match request {
        PluginRequest::Activate => PluginResponse::Implements {
            implements: vec![IMPLEMENTS.to_owned()],
        },
        PluginRequest::Create { name, options } => match handler.create(&name, &options).await {
            Ok(()) => PluginResponse::Ok {},
            Err(e) => e.into(),
        },
        PluginRequest::Remove { name } => match handler.remove(&name).await {
            Ok(()) => PluginResponse::Ok {},
            Err(e) => e.into(),
        },
        PluginRequest::Path { name } => match handler.path(&name).await {
            Ok(p) => mountpoint(p),
            Err(e) => e.into(),
        },
        PluginRequest::Mount { name, id } => {
            debug!(%id, "mount requested by consumer");
            match handler.mount(&name).await {
                Ok(p) => mountpoint(p),
                Err(e) => e.into(),
            }
        }
        PluginRequest::Unmount { name, id } => {
            debug!(%id, "unmount requested by consumer");
            match handler.unmount(&name).await {
                Ok(()) => PluginResponse::Ok {},
                Err(e) => e.into(),
            }
        }
        PluginRequest::Get { name } => match handler.get(&name).await {
            Ok(info) => PluginResponse::Volume {
                volume: info.into(),
            },
            Err(e) => e.into(),
        },
        PluginRequest::List => match handler.list().await {
            Ok(entries) => PluginResponse::Volumes {
                volumes: entries.into_iter().map(Into::into).collect(),
            },
            Err(e) => e.into(),
        },
        PluginRequest::Capabilities => PluginResponse::Capabilities {
            capabilities: CapabilitySet {
                scope: handler.scope(),
            },
        },
    }
}

fn respond(status: StatusCode, body: &PluginResponse) -> Response<Body> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut resp = Response::new(Body::from(payload));
    *resp.status_mut() = status;
    if let Ok(v) = CONTENT_TYPE.parse() {
        resp.headers_mut().insert(CONTENT_TYPE_HEADER, v);
    }
    resp
}

async fn write_spec_file(spec: &Path, addr: &SocketAddr) -> Result<(), VolumeError> {
    if let Some(dir) = spec.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| VolumeError::Transport(format!("cannot create {}: {e}", dir.display())))?;
    }
    tokio::fs::write(spec, format!("tcp://{addr}"))
        .await
        .map_err(|e| VolumeError::Transport(format!("cannot write {}: {e}", spec.display())))
}

async fn bind_unix(socket: &Path, group: Option<&str>) -> Result<UnixListener, VolumeError> {
    if let Some(dir) = socket.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| VolumeError::Transport(format!("cannot create {}: {e}", dir.display())))?;
    }
    // A socket left over from an unclean exit would make bind fail.
    match tokio::fs::remove_file(socket).await {
        Ok(()) => debug!(socket = %socket.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(VolumeError::transport(e)),
    }

    let listener = UnixListener::bind(socket).map_err(VolumeError::transport)?;
    tokio::fs::set_permissions(socket, std::fs::Permissions::from_mode(SOCKET_MODE))
        .await
        .map_err(VolumeError::transport)?;

    if let Some(group) = group {
        let gid = Group::from_name(group)
            .map_err(VolumeError::transport)?
            .ok_or_else(|| VolumeError::Transport(format!("unknown group {group:?}")))?
            .gid;
        chown(socket, None, Some(gid)).map_err(VolumeError::transport)?;
    }
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Scope, VolumeEntry, VolumeInfo, VolumeMetadata, VolumeOptions};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Driver that knows exactly one volume, `vol1`.
    struct OneVolume;

    #[async_trait]
    impl VolumeDriver for OneVolume {
        async fn create(
            &self,
            name: &str,
            options: &HashMap<String, String>,
        ) -> Result<(), VolumeError> {
            match options.get("share") {
                Some(_) if name == "vol1" => Ok(()),
                _ => Err(VolumeError::MissingShare),
            }
        }
        async fn remove(&self, name: &str) -> Result<(), VolumeError> {
            self.get(name).await.map(drop)
        }
        async fn path(&self, name: &str) -> Result<PathBuf, VolumeError> {
            self.get(name).await.map(|i| i.mountpoint)
        }
        async fn mount(&self, name: &str) -> Result<PathBuf, VolumeError> {
            self.path(name).await
        }
        async fn unmount(&self, name: &str) -> Result<(), VolumeError> {
            self.get(name).await.map(drop)
        }
        async fn get(&self, name: &str) -> Result<VolumeInfo, VolumeError> {
            if name != "vol1" {
                return Err(VolumeError::NotFound(name.to_owned()));
            }
            Ok(VolumeInfo {
                name: "vol1".into(),
                mountpoint: PathBuf::from("/mnt/vol1"),
                metadata: VolumeMetadata {
                    created_at: chrono::Utc::now(),
                    account: "acct".into(),
                    options: VolumeOptions {
                        share: "data".into(),
                    },
                },
            })
        }
        async fn list(&self) -> Result<Vec<VolumeEntry>, VolumeError> {
            Ok(vec![VolumeEntry {
                name: "vol1".into(),
                mountpoint: PathBuf::from("/mnt/vol1"),
            }])
        }
    }

    async fn call(path: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::post(path)
            .body(Body::from(body.to_owned()))
            .unwrap();
        let resp = handle_request(&OneVolume, req).await;
        let status = resp.status();
        assert_eq!(resp.headers()[CONTENT_TYPE_HEADER], CONTENT_TYPE);
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn activate_and_capabilities() {
        let (status, body) = call("/Plugin.Activate", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"Implements": ["VolumeDriver"]}));

        let (_, body) = call("/VolumeDriver.Capabilities", "").await;
        assert_eq!(body["Capabilities"]["Scope"], "local");
        assert_eq!(OneVolume.scope(), Scope::Local);
    }

    #[tokio::test]
    async fn success_bodies() {
        let (status, body) = call(
            "/VolumeDriver.Create",
            r#"{"Name":"vol1","Opts":{"share":"data"}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({}));

        let (_, body) = call("/VolumeDriver.Mount", r#"{"Name":"vol1","ID":"c1"}"#).await;
        assert_eq!(body["Mountpoint"], "/mnt/vol1");

        let (_, body) = call("/VolumeDriver.Get", r#"{"Name":"vol1"}"#).await;
        assert_eq!(body["Volume"]["Name"], "vol1");
        assert_eq!(body["Volume"]["Status"]["share"], "data");

        let (_, body) = call("/VolumeDriver.List", "{}").await;
        assert_eq!(body["Volumes"][0]["Mountpoint"], "/mnt/vol1");
    }

    #[tokio::test]
    async fn driver_errors_are_500_with_err() {
        let (status, body) = call("/VolumeDriver.Unmount", r#"{"Name":"nope"}"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["Err"], "volume nope not found");
    }

    #[tokio::test]
    async fn protocol_errors() {
        let (status, body) = call("/VolumeDriver.Resize", "{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["Err"].as_str().unwrap().contains("Resize"));

        let (status, _) = call("/VolumeDriver.Path", "[1,2").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = Request::get("/Plugin.Activate").body(Body::empty()).unwrap();
        let resp = handle_request(&OneVolume, req).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn tcp_server_publishes_and_removes_spec_file() {
        let tmp = tempfile::tempdir().unwrap();
        let listen = ListenAddr::Tcp {
            addr: "127.0.0.1:0".parse().unwrap(),
            spec_dir: tmp.path().join("plugins"),
        };
        let server = PluginServer::bind("test", &listen, Arc::new(OneVolume))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let spec = server.discovery_path().to_path_buf();
        assert_eq!(std::fs::read_to_string(&spec).unwrap(), format!("tcp://{addr}"));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(async {
            let _ = rx.await;
        }));

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/VolumeDriver.Path"))
            .body(r#"{"Name":"vol1"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: serde_json::Value = serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap();
        assert_eq!(body["Mountpoint"], "/mnt/vol1");

        tx.send(()).unwrap();
        task.await.unwrap();
        assert!(!spec.exists());
    }

    #[tokio::test]
    async fn unix_socket_is_group_readable_only() {
        let tmp = tempfile::tempdir().unwrap();
        let listen = ListenAddr::Unix {
            socket_dir: tmp.path().to_path_buf(),
            group: None,
        };
        // A stale socket from a previous run must not prevent binding.
        std::fs::write(tmp.path().join("test.sock"), b"").unwrap();

        let server = PluginServer::bind("test", &listen, Arc::new(OneVolume))
            .await
            .unwrap();
        let mode = std::fs::metadata(server.discovery_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o660);
        assert!(server.local_addr().is_none());

        let socket = server.discovery_path().to_path_buf();
        server.serve(async {}).await;
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn accept_errors_do_not_stop_the_loop() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let attempts = Arc::new(AtomicUsize::new(0));
        let (reached_tx, reached_rx) = tokio::sync::oneshot::channel::<()>();
        let mut reached_tx = Some(reached_tx);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let counter = Arc::clone(&attempts);
        let task = tokio::spawn(accept_until(
            async {
                let _ = stop_rx.await;
            },
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let ready = if n == 3 { reached_tx.take() } else { None };
                async move {
                    match n {
                        0 => Err(io::Error::from_raw_os_error(Errno::EMFILE as i32)),
                        1 => Err(io::Error::from_raw_os_error(Errno::ENFILE as i32)),
                        2 => Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
                        _ => {
                            if let Some(tx) = ready {
                                let _ = tx.send(());
                            }
                            std::future::pending().await
                        }
                    }
                }
            },
        ));

        // Three failures in a row, and the loop is still asking for more.
        tokio::time::timeout(Duration::from_secs(5), reached_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(!task.is_finished());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        stop_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn descriptor_exhaustion_is_recognized() {
        assert!(out_of_descriptors(&io::Error::from_raw_os_error(Errno::EMFILE as i32)));
        assert!(out_of_descriptors(&io::Error::from_raw_os_error(Errno::ENFILE as i32)));
        assert!(!out_of_descriptors(&io::Error::from(io::ErrorKind::ConnectionAborted)));
    }
}
