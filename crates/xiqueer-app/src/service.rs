//! Capture lifecycle.

use std::sync::Arc;

use tracing::{error, info};
use xiqueer_proxy::{
    CaptureState, CaptureStateCell, ProxyConfig, ProxyServer, Result, SocketProtector,
};

use crate::pipeline::CapturePipeline;
use crate::settings::CaptureSettings;

/// Owns the proxy and reports its lifecycle through the state cell.
#[derive(Debug)]
pub struct CaptureService {
    server: ProxyServer,
    state: CaptureStateCell,
    bind_port: u16,
}

impl CaptureService {
    /// Wires the proxy to the pipeline. Nothing is bound until
    /// [`start_capture`](Self::start_capture).
    pub fn new(
        settings: &CaptureSettings,
        pipeline: CapturePipeline,
        state: CaptureStateCell,
        protector: Arc<dyn SocketProtector>,
    ) -> Self {
        let config = ProxyConfig::new()
            .with_force_ipv4_hosts(settings.force_ipv4_hosts.iter().cloned())
            .with_protector(protector);

        let server = ProxyServer::new(config).on_capture(move |exchange| {
            pipeline.handle(exchange);
        });

        Self {
            server,
            state,
            bind_port: settings.bind_port,
        }
    }

    /// Starts the proxy, or returns the current port if it is running.
    pub fn start_capture(&self) -> Result<u16> {
        match self.server.start(self.bind_port) {
            Ok(port) => {
                info!("Capture started on 127.0.0.1:{}", port);
                self.state.update(|s| CaptureState {
                    running: true,
                    last_error: None,
                    ..s.clone()
                });
                Ok(port)
            }
            Err(e) => {
                error!("Capture failed to start: {}", e);
                let message = format!("proxy failed to start: {}", e);
                self.state.update(|s| CaptureState {
                    running: false,
                    last_error: Some(message.clone()),
                    ..s.clone()
                });
                Err(e)
            }
        }
    }

    /// Stops the proxy. Safe to call when already stopped.
    pub async fn stop_capture(&self) {
        self.server.stop().await;
        self.state.update(|s| CaptureState {
            running: false,
            ..s.clone()
        });
        info!("Capture stopped");
    }

    /// Port of the running proxy.
    pub fn port(&self) -> Option<u16> {
        self.server.port()
    }

    pub fn state(&self) -> &CaptureStateCell {
        &self.state
    }
}
