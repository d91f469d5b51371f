//! Newline-delimited JSON framing over a Unix domain socket.
//!
//! This is a stand-in for the real NRI ttrpc protocol, sufficient to drive
//! and test the adapter's dispatch loop without depending on a registry
//! crate that does not exist for that protocol. A production deployment
//! swaps this for a real ttrpc client behind the same [`super::EventTransport`]
//! trait.

use crate::LifecycleEvent;
use async_trait::async_trait;
use enforcement_hook::ContainerContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum WireEvent {
    Create(WireContext),
    Start(WireContext),
    Stop(WireContext),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireContext {
    namespace: String,
    pod: String,
    container: String,
    rootfs: PathBuf,
    pod_annotations: HashMap<String, String>,
}

impl From<WireContext> for ContainerContext {
    fn from(w: WireContext) -> Self {
        ContainerContext {
            namespace: w.namespace,
            pod: w.pod,
            container: w.container,
            rootfs: w.rootfs,
            pod_annotations: w.pod_annotations,
        }
    }
}

impl From<WireEvent> for LifecycleEvent {
    fn from(e: WireEvent) -> Self {
        match e {
            WireEvent::Create(c) => LifecycleEvent::Create(c.into()),
            WireEvent::Start(c) => LifecycleEvent::Start(c.into()),
            WireEvent::Stop(c) => LifecycleEvent::Stop(c.into()),
        }
    }
}

/// A runtime-event transport that accepts a single connection on a Unix
/// domain socket and reads one JSON lifecycle event per line.
pub struct UnixSocketTransport {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    reader: Option<BufReader<UnixStream>>,
}

impl UnixSocketTransport {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path, listener: None, reader: None }
    }
}

#[async_trait]
impl super::EventTransport for UnixSocketTransport {
    async fn register(&mut self, plugin_name: &str, plugin_idx: &str) -> std::io::Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)?;
        log::info!(
            "registered as runtime plugin {plugin_name}#{plugin_idx} on {}",
            self.socket_path.display()
        );
        self.listener = Some(listener);
        Ok(())
    }

    async fn next_event(&mut self) -> std::io::Result<Option<LifecycleEvent>> {
        loop {
            if self.reader.is_none() {
                let listener = self.listener.as_ref().ok_or_else(|| {
                    std::io::Error::other("transport not registered")
                })?;
                let (stream, _addr) = listener.accept().await?;
                self.reader = Some(BufReader::new(stream));
            }
            let reader = self.reader.as_mut().expect("just populated");
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                self.reader = None;
                continue;
            }
            let event: WireEvent = serde_json::from_str(line.trim_end())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            return Ok(Some(event.into()));
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.reader = None;
        self.listener = None;
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

/// Serialize a [`LifecycleEvent`]-shaped wire message and write it
/// newline-terminated to `stream`. Exposed for tests and for any tool that
/// wants to drive the transport without a real NRI shim.
pub async fn send_start_event(stream: &mut UnixStream, ctx: &ContainerContext) -> std::io::Result<()> {
    let wire = WireEvent::Start(WireContext {
        namespace: ctx.namespace.clone(),
        pod: ctx.pod.clone(),
        container: ctx.container.clone(),
        rootfs: ctx.rootfs.clone(),
        pod_annotations: ctx.pod_annotations.clone(),
    });
    let mut line = serde_json::to_string(&wire)?;
    line.push('\n');
    stream.write_all(line.as_bytes()).await
}
