use std::sync::Arc;

use broker::{DmaCalculator, PriceClient, ReqwestTransport, SessionManager, Transport};

pub mod config;
pub mod daily;
pub mod login;

use config::Config;

/// Shared handles for the process. One session manager, one calculator on top of it.
pub struct Data {
    pub session: Arc<SessionManager>,
    pub calculator: Arc<DmaCalculator>,
}

impl Data {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);
        let session = Arc::new(SessionManager::new(
            config.broker.clone(),
            Arc::clone(&transport),
        ));
        let calculator = Arc::new(DmaCalculator::new(PriceClient::new(
            transport,
            Arc::clone(&session),
        )));

        Ok(Self {
            session,
            calculator,
        })
    }
}
