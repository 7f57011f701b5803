//! Shared handler state.

use std::sync::Arc;

use db::Store;
use engine::{Encryptor, TokenSigner};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub encryptor: Arc<dyn Encryptor>,
    pub signer: TokenSigner,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, encryptor: Arc<dyn Encryptor>, signer: TokenSigner) -> Self {
        Self { store, encryptor, signer }
    }
}

impl From<&engine::Services> for AppState {
    fn from(services: &engine::Services) -> Self {
        Self::new(services.store.clone(), services.encryptor.clone(), services.signer.clone())
    }
}
