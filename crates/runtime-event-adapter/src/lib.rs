//! Registers with the container runtime's event bus and dispatches each
//! lifecycle event through an ordered chain of [`EnforcementHook`]s.
//!
//! The real event bus (containerd's NRI, over ttrpc-on-unix-socket) is an
//! external collaborator this system does not implement; [`EventTransport`]
//! is the trait boundary for it. [`UnixSocketTransport`] is a concrete
//! stand-in good enough to exercise and test dispatch/ordering/cancellation
//! end-to-end: it frames lifecycle events as newline-delimited JSON over a
//! Unix domain socket rather than speaking the real ttrpc protocol.

mod transport;

use async_trait::async_trait;
use enforcement_hook::{ContainerContext, EnforcementHook};
use log::{debug, error, info};
use std::sync::Arc;
use thiserror::Error;

pub use transport::UnixSocketTransport;

#[derive(Debug, Error)]
pub enum Error {
    #[error("hook {0} failed: {1}")]
    Hook(String, #[source] enforcement_hook::Error),
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),
    #[error("malformed event: {0}")]
    Malformed(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The three lifecycle moments this system cares about.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Create(ContainerContext),
    Start(ContainerContext),
    Stop(ContainerContext),
}

/// Abstraction over the container-runtime event source. A real
/// implementation speaks NRI; [`UnixSocketTransport`] is the stand-in used
/// here.
#[async_trait]
pub trait EventTransport: Send {
    async fn register(&mut self, plugin_name: &str, plugin_idx: &str) -> std::io::Result<()>;
    async fn next_event(&mut self) -> std::io::Result<Option<LifecycleEvent>>;
    async fn shutdown(&mut self) -> std::io::Result<()>;
}

/// Plugin registration identity, mirrored from the original agent's fixed
/// socket path / name / index.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub plugin_name: String,
    pub plugin_idx: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self { plugin_name: "Terminus-Enforcer".to_string(), plugin_idx: "06".to_string() }
    }
}

/// Owns the ordered hook list and the event transport; dispatches one
/// event at a time, aborting the hook chain on the first error.
pub struct Adapter<T: EventTransport> {
    config: AdapterConfig,
    hooks: Vec<Arc<dyn EnforcementHook>>,
    transport: T,
}

impl<T: EventTransport> Adapter<T> {
    pub fn new(config: AdapterConfig, hooks: Vec<Arc<dyn EnforcementHook>>, transport: T) -> Self {
        for hook in &hooks {
            info!("registered hook {}", hook.name());
        }
        Self { config, hooks, transport }
    }

    /// Register with the runtime and process events until the transport
    /// closes or `cancel` fires.
    pub async fn run(mut self, cancel: tokio_util::sync::CancellationToken) -> Result<()> {
        self.transport
            .register(&self.config.plugin_name, &self.config.plugin_idx)
            .await
            .map_err(Error::Transport)?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("runtime event adapter shutting down");
                    self.transport.shutdown().await.map_err(Error::Transport)?;
                    return Ok(());
                }
                event = self.transport.next_event() => {
                    match event.map_err(Error::Transport)? {
                        Some(event) => self.dispatch(event).await,
                        None => {
                            debug!("event transport closed");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, event: LifecycleEvent) {
        let (ctx, stage) = match &event {
            LifecycleEvent::Create(ctx) => (ctx, Stage::Process),
            LifecycleEvent::Start(ctx) => (ctx, Stage::Start),
            LifecycleEvent::Stop(ctx) => (ctx, Stage::Stop),
        };
        for hook in &self.hooks {
            let result = match stage {
                Stage::Process => hook.process(ctx).await,
                Stage::Start => hook.start(ctx).await,
                Stage::Stop => hook.stop(ctx).await,
            };
            if let Err(e) = result {
                error!(
                    "{}/{} container {}: hook {} aborted the chain: {e}",
                    ctx.namespace, ctx.pod, ctx.container, hook.name()
                );
                return;
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Stage {
    Process,
    Start,
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Arc as StdArc;

    fn ctx() -> ContainerContext {
        ContainerContext {
            namespace: "default".to_string(),
            pod: "web-0".to_string(),
            container: "app".to_string(),
            rootfs: PathBuf::from("/rootfs"),
            pod_annotations: Default::default(),
        }
    }

    struct ScriptedTransport {
        events: VecDeque<LifecycleEvent>,
        registered: StdArc<Mutex<bool>>,
    }

    #[async_trait]
    impl EventTransport for ScriptedTransport {
        async fn register(&mut self, _name: &str, _idx: &str) -> std::io::Result<()> {
            *self.registered.lock() = true;
            Ok(())
        }
        async fn next_event(&mut self) -> std::io::Result<Option<LifecycleEvent>> {
            Ok(self.events.pop_front())
        }
        async fn shutdown(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct RecordingHook {
        name: &'static str,
        calls: StdArc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl EnforcementHook for RecordingHook {
        fn name(&self) -> &str {
            self.name
        }
        async fn process(&self, _ctx: &ContainerContext) -> enforcement_hook::Result<()> {
            self.calls.lock().push(self.name);
            Ok(())
        }
        async fn start(&self, _ctx: &ContainerContext) -> enforcement_hook::Result<()> {
            self.calls.lock().push(self.name);
            if self.fail {
                return Err(enforcement_hook::Error::Domain(domain::Error::InvalidQuantity(
                    "x".to_string(),
                    "test failure",
                )));
            }
            Ok(())
        }
        async fn stop(&self, _ctx: &ContainerContext) -> enforcement_hook::Result<()> {
            self.calls.lock().push(self.name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_events_in_hook_order() {
        let calls = StdArc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn EnforcementHook>> = vec![
            Arc::new(RecordingHook { name: "first", calls: calls.clone(), fail: false }),
            Arc::new(RecordingHook { name: "second", calls: calls.clone(), fail: false }),
        ];
        let transport = ScriptedTransport {
            events: VecDeque::from([LifecycleEvent::Start(ctx())]),
            registered: StdArc::new(Mutex::new(false)),
        };
        let adapter = Adapter::new(AdapterConfig::default(), hooks, transport);
        let cancel = tokio_util::sync::CancellationToken::new();
        // the transport runs out of queued events and reports closed, which
        // ends the run loop without needing cancellation.
        adapter.run(cancel).await.unwrap();
        assert_eq!(*calls.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn first_hook_error_aborts_the_chain() {
        let calls = StdArc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn EnforcementHook>> = vec![
            Arc::new(RecordingHook { name: "first", calls: calls.clone(), fail: true }),
            Arc::new(RecordingHook { name: "second", calls: calls.clone(), fail: false }),
        ];
        let transport = ScriptedTransport {
            events: VecDeque::from([LifecycleEvent::Start(ctx())]),
            registered: StdArc::new(Mutex::new(false)),
        };
        let adapter = Adapter::new(AdapterConfig::default(), hooks, transport);
        let cancel = tokio_util::sync::CancellationToken::new();
        adapter.run(cancel).await.unwrap();
        assert_eq!(*calls.lock(), vec!["first"]);
    }
}
