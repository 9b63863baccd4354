//! Per-instrument engine lifecycle management.
//!
//! Owns one engine task per instrument and the shutdown signalling for each.
//! The concurrency driver is chosen once from config and applies to every
//! instrument this process runs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::pipeline::PipelineEngine;
use super::serial::SerialEngine;
use super::store::OrderStore;
use super::stream::IntentStream;
use super::{EngineContext, EngineError};
use crate::config::{EngineSettings, PipelineSettings};

/// Which concurrency driver runs each instrument's engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Serial,
    Pipeline,
}

impl Strategy {
    pub fn parse(name: &str) -> Strategy {
        match name {
            "serial" => Strategy::Serial,
            "pipeline" => Strategy::Pipeline,
            other => {
                log::warn!("unknown strategy '{}', defaulting to serial", other);
                Strategy::Serial
            }
        }
    }
}

struct EngineHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), EngineError>>,
}

pub struct EngineSupervisor {
    store: Arc<dyn OrderStore>,
    stream: Arc<dyn IntentStream>,
    strategy: Strategy,
    engine_settings: EngineSettings,
    pipeline_settings: PipelineSettings,
    engines: HashMap<String, EngineHandle>,
}

impl EngineSupervisor {
    pub fn new(
        store: Arc<dyn OrderStore>,
        stream: Arc<dyn IntentStream>,
        strategy: Strategy,
        engine_settings: EngineSettings,
        pipeline_settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            stream,
            strategy,
            engine_settings,
            pipeline_settings,
            engines: HashMap::new(),
        }
    }

    /// Starts an engine for `instrument`. Idempotent while the existing
    /// engine task is still live.
    pub fn start(&mut self, instrument: &str) -> Result<(), EngineError> {
        if let Some(handle) = self.engines.get(instrument) {
            if !handle.task.is_finished() {
                log::info!("engine for {} already running", instrument);
                return Ok(());
            }
            self.engines.remove(instrument);
        }

        let ctx = Arc::new(EngineContext::new(
            instrument,
            self.store.clone(),
            self.stream.clone(),
            self.engine_settings.clone(),
        )?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = match self.strategy {
            Strategy::Serial => {
                let engine = SerialEngine::new(ctx);
                tokio::spawn(async move { engine.run(shutdown_rx).await })
            }
            Strategy::Pipeline => {
                let engine = PipelineEngine::with_settings(ctx, self.pipeline_settings.clone());
                tokio::spawn(async move { engine.run(shutdown_rx).await })
            }
        };

        log::info!("started {:?} engine for {}", self.strategy, instrument);
        self.engines.insert(
            instrument.to_string(),
            EngineHandle {
                shutdown: shutdown_tx,
                task,
            },
        );
        Ok(())
    }

    /// Signals one engine to stop and waits for its task to finish.
    pub async fn stop(&mut self, instrument: &str) {
        if let Some(handle) = self.engines.remove(instrument) {
            let _ = handle.shutdown.send(true);
            match handle.task.await {
                Ok(Ok(())) => log::info!("engine for {} stopped", instrument),
                Ok(Err(e)) => log::error!("engine for {} exited with error: {}", instrument, e),
                Err(e) => log::error!("engine task for {} panicked: {}", instrument, e),
            }
        }
    }

    pub async fn stop_all(&mut self) {
        let instruments: Vec<String> = self.engines.keys().cloned().collect();
        for instrument in instruments {
            self.stop(&instrument).await;
        }
    }

    pub fn is_running(&self, instrument: &str) -> bool {
        self.engines
            .get(instrument)
            .map_or(false, |h| !h.task.is_finished())
    }

    pub fn running(&self) -> Vec<String> {
        self.engines
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(k, _)| k.clone())
            .collect()
    }
}
