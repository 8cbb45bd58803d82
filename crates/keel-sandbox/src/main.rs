mod app;
mod programs;

use anyhow::{Context, Result};
use keel_gpu::logging::{LoggingConfig, init_logging};
use winit::event_loop::EventLoop;

use app::{SandboxApp, SandboxConfig};

fn main() -> Result<()> {
    init_logging(LoggingConfig::default());

    let event_loop = EventLoop::new().context("failed to create winit EventLoop")?;
    let mut app = SandboxApp::new(SandboxConfig::default());

    event_loop
        .run_app(&mut app)
        .context("winit event loop terminated with error")?;

    Ok(())
}
