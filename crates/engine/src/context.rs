//! Collaborators shared by every worker.

use std::sync::Arc;

use bus::Bus;
use db::Store;
use executors::ExecutorRegistry;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::secrets::{Encryptor, NoOpEncryptor};
use crate::token::TokenSigner;

#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn Bus>,
    pub executors: Arc<ExecutorRegistry>,
    pub encryptor: Arc<dyn Encryptor>,
    pub signer: TokenSigner,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
}

impl Services {
    /// Services with the system clock, no-op encryption and default config.
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn Bus>,
        executors: ExecutorRegistry,
        signer: TokenSigner,
    ) -> Self {
        Self {
            store,
            bus,
            executors: Arc::new(executors),
            encryptor: Arc::new(NoOpEncryptor),
            signer,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = encryptor;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }
}
