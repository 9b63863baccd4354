use crate::config;
use crate::engine::store::memory::MemoryOrderStore;
use crate::engine::store::mysql::MySqlOrderStore;
use crate::engine::store::OrderStore;
use crate::engine::stream::memory::MemoryStream;
use crate::engine::stream::IntentStream;
use crate::engine::supervisor::{EngineSupervisor, Strategy};
use crate::metrics;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tokio::sync::Mutex;

static INSTANCE: OnceCell<Mutex<Server>> = OnceCell::new();
pub fn instance() -> &'static Mutex<Server> {
    INSTANCE.get_or_init(|| Mutex::new(Server::builder()))
}

pub struct Server {
    stream: Arc<dyn IntentStream>,
    supervisor: Option<EngineSupervisor>,
}

impl Server {
    fn builder() -> Self {
        Server {
            stream: Arc::new(MemoryStream::new()),
            supervisor: None,
        }
    }

    /// Producer handle to the order-intent stream this process consumes.
    pub fn stream(&self) -> Arc<dyn IntentStream> {
        self.stream.clone()
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        let cfg = config::instance().lock().unwrap().clone();

        let store: Arc<dyn OrderStore> = if cfg.database_url.is_empty() {
            log::warn!("no database_url configured, using in-memory order store");
            Arc::new(MemoryOrderStore::new())
        } else {
            Arc::new(MySqlOrderStore::connect(&cfg.database_url).await?)
        };

        let mut supervisor = EngineSupervisor::new(
            store,
            self.stream.clone(),
            Strategy::parse(&cfg.strategy),
            cfg.engine.clone(),
            cfg.pipeline.clone(),
        );
        for instrument in &cfg.instruments {
            supervisor.start(instrument)?;
        }
        self.supervisor = Some(supervisor);

        self.start_metrics_server().await;
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(supervisor) = self.supervisor.as_mut() {
            supervisor.stop_all().await;
        }
        log::info!("server stop");
    }

    async fn start_metrics_server(&mut self) {
        let addr = config::instance()
            .lock()
            .unwrap()
            .metrics_addr
            .as_str()
            .parse()
            .unwrap();
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        encoder.encode(&metric_families, &mut buffer).unwrap();
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::bind(&addr).serve(make_svc);
        tokio::spawn(async move {
            tokio::pin!(server);
            server.await.unwrap()
        });
        log::info!("metrics server started on {}", addr);
    }
}
