//! Request dispatcher: line-delimited JSON over a Unix domain socket.
//!
//! One JSON request per line in, one JSON response per line out. Every
//! mutating request takes the coordinator lock, so exactly one transaction
//! executes at a time; `ListState` answers from a snapshot taken under the
//! same lock and never exposes live state.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mrt_api::{ErrorKind, Request, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::kernel::MrouteControl;
use crate::validation;

pub struct IpcServer<K: MrouteControl + 'static> {
    coordinator: Arc<Mutex<Coordinator<K>>>,
    listener: UnixListener,
    socket_path: PathBuf,
}

impl<K: MrouteControl + 'static> IpcServer<K> {
    /// Bind the IPC socket, removing any stale socket file first.
    pub fn bind(
        socket_path: &Path,
        coordinator: Arc<Mutex<Coordinator<K>>>,
    ) -> io::Result<Self> {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "IPC socket bound");
        Ok(IpcServer {
            coordinator,
            listener,
            socket_path: socket_path.to_path_buf(),
        })
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let coordinator = Arc::clone(&self.coordinator);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, coordinator).await {
                                    debug!(error = %e, "connection closed with error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = &mut shutdown => {
                    info!("IPC server stopping");
                    break;
                }
            }
        }
    }
}

impl<K: MrouteControl + 'static> Drop for IpcServer<K> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_connection<K: MrouteControl>(
    stream: UnixStream,
    coordinator: Arc<Mutex<Coordinator<K>>>,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let mut coordinator = coordinator.lock().await;
                dispatch(request, &mut coordinator)
            }
            Err(e) => Response::error(ErrorKind::Validation, format!("invalid request: {e}")),
        };
        let mut out = serde_json::to_vec(&response).unwrap_or_else(|_| {
            br#"{"status":"error","kind":"internal","message":"response encoding failed"}"#
                .to_vec()
        });
        out.push(b'\n');
        writer.write_all(&out).await?;
    }
    Ok(())
}

fn dispatch<K: MrouteControl>(request: Request, coordinator: &mut Coordinator<K>) -> Response {
    match request {
        Request::InstallRule {
            source,
            group,
            iif,
            oifs,
        } => match validation::validate_install(&source, &group, &iif, &oifs) {
            Ok(spec) => match coordinator.install(spec) {
                Ok(()) => Response::ok(),
                Err(e) => Response::error(e.kind(), e.to_string()),
            },
            Err(e) => Response::error(ErrorKind::Validation, e.to_string()),
        },
        Request::RemoveRule { source, group } => {
            match validation::validate_key(&source, &group) {
                Ok((source, group)) => match coordinator.remove(source, group) {
                    Ok(()) => Response::ok(),
                    Err(e) => Response::error(e.kind(), e.to_string()),
                },
                Err(e) => Response::error(ErrorKind::Validation, e.to_string()),
            }
        }
        Request::ListState => Response::with_state(coordinator.state_view()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::test_util::FakeKernel;

    async fn roundtrip(stream: &mut UnixStream, request: &Request) -> Response {
        let mut line = serde_json::to_string(request).unwrap();
        line.push('\n');
        stream.write_all(line.as_bytes()).await.unwrap();

        let mut reply = String::new();
        let mut reader = BufReader::new(stream);
        reader.read_line(&mut reply).await.unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_install_list_remove_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("mrtd.sock");
        let state_file = dir.path().join("state.json");

        let mut coordinator = Coordinator::new(
            FakeKernel::with_interfaces(&["veth0", "veth1"]),
            Store::new(),
            state_file,
        );
        coordinator.start().unwrap();
        let coordinator = Arc::new(Mutex::new(coordinator));

        let server = IpcServer::bind(&socket_path, coordinator).unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server_task = tokio::spawn(server.run(async {
            let _ = stop_rx.await;
        }));

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();

        let resp = roundtrip(
            &mut stream,
            &Request::InstallRule {
                source: "0.0.0.0".to_string(),
                group: "239.1.2.3".to_string(),
                iif: "veth0".to_string(),
                oifs: vec!["veth1".to_string()],
            },
        )
        .await;
        assert_eq!(resp, Response::ok());

        let resp = roundtrip(&mut stream, &Request::ListState).await;
        let Response::Ok { state: Some(state) } = resp else {
            panic!("expected state payload, got {resp:?}");
        };
        assert_eq!(state.vifs.len(), 2);
        assert_eq!(state.rules.len(), 1);
        assert_eq!(state.rules[0].group, "239.1.2.3");

        let resp = roundtrip(
            &mut stream,
            &Request::RemoveRule {
                source: "0.0.0.0".to_string(),
                group: "239.1.2.3".to_string(),
            },
        )
        .await;
        assert_eq!(resp, Response::ok());

        let _ = stop_tx.send(());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_json_gets_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("mrtd.sock");

        let coordinator = Arc::new(Mutex::new(Coordinator::new(
            FakeKernel::with_interfaces(&[]),
            Store::new(),
            dir.path().join("state.json"),
        )));
        let server = IpcServer::bind(&socket_path, coordinator).unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server_task = tokio::spawn(server.run(async {
            let _ = stop_rx.await;
        }));

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        stream.write_all(b"{not json}\n").await.unwrap();

        let mut reply = String::new();
        BufReader::new(&mut stream).read_line(&mut reply).await.unwrap();
        let resp: Response = serde_json::from_str(&reply).unwrap();
        assert!(matches!(
            resp,
            Response::Error {
                kind: ErrorKind::Validation,
                ..
            }
        ));

        let _ = stop_tx.send(());
        server_task.await.unwrap();
    }
}
