//! Session signer: submits writes on the player's behalf

use crate::error::GatewayError;
use crate::traits::{LedgerCall, LedgerGateway, Receipt};
use crate::types::Address;
use async_trait::async_trait;
use std::sync::Arc;

/// Opaque identity/session layer.
///
/// Failures come back as `GatewayError`; the tracker classifies them.
#[async_trait]
pub trait SessionSigner: Send + Sync {
    /// Address the signer acts for
    fn address(&self) -> &Address;

    /// Submit a call and wait for its receipt
    async fn execute(&self, call: &LedgerCall) -> Result<Receipt, GatewayError>;
}

/// Signer that submits straight through a `LedgerGateway`
#[derive(Clone)]
pub struct GatewaySigner {
    address: Address,
    gateway: Arc<dyn LedgerGateway>,
}

impl GatewaySigner {
    pub fn new(address: Address, gateway: Arc<dyn LedgerGateway>) -> Self {
        Self { address, gateway }
    }
}

#[async_trait]
impl SessionSigner for GatewaySigner {
    fn address(&self) -> &Address {
        &self.address
    }

    async fn execute(&self, call: &LedgerCall) -> Result<Receipt, GatewayError> {
        self.gateway.write(&self.address, call).await
    }
}
