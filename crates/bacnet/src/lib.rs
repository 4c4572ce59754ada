//! Narrow wrapper over BACnet/IP: read one property, read several, all
//! bounded by a per-call timeout. The driver trait is the seam between the
//! collection engine and the wire; the gateway enforces the deadline so no
//! caller can be blocked past it.

pub mod codec;
pub mod ip;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;

pub use crate::types::{
    device_address,
    BacnetValue,
    ObjectType,
    PropertyId,
    ReadRequest,
};

#[derive(Debug, thiserror::Error)]
pub enum BacnetError {
    #[error("BACnet read timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}

/// The transport seam. Production uses [`ip::IpDriver`]; tests script a
/// [`testing::FakeDriver`].
#[async_trait]
pub trait BacnetDriver: Send + Sync {
    async fn read_property(
        &self,
        addr: SocketAddr,
        request: ReadRequest,
    ) -> anyhow::Result<BacnetValue>;

    /// Read-multiple is an optimization; drivers without native support fall
    /// back to a loop of single reads, failing per request.
    async fn read_property_multiple(
        &self,
        addr: SocketAddr,
        requests: &[ReadRequest],
    ) -> Vec<anyhow::Result<BacnetValue>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.read_property(addr, *request).await);
        }
        results
    }
}

/// Shared, clonable front door to the BACnet network. Every call returns
/// within `read_timeout` or fails with [`BacnetError::Timeout`].
#[derive(Clone)]
pub struct BacnetGateway {
    driver: Arc<dyn BacnetDriver>,
    read_timeout: Duration,
}

impl BacnetGateway {
    pub fn new(driver: Arc<dyn BacnetDriver>, read_timeout: Duration) -> Self {
        Self {
            driver,
            read_timeout,
        }
    }

    pub async fn read_property(
        &self,
        addr: SocketAddr,
        request: ReadRequest,
    ) -> Result<BacnetValue, BacnetError> {
        match tokio::time::timeout(self.read_timeout, self.driver.read_property(addr, request))
            .await
        {
            Ok(result) => result.map_err(BacnetError::Driver),
            Err(_) => Err(BacnetError::Timeout(self.read_timeout)),
        }
    }

    /// Per-request results; a timeout covers the whole exchange and is
    /// reported against every request in it.
    pub async fn read_properties(
        &self,
        addr: SocketAddr,
        requests: &[ReadRequest],
    ) -> Vec<Result<BacnetValue, BacnetError>> {
        let deadline = self.read_timeout;
        match tokio::time::timeout(
            deadline,
            self.driver.read_property_multiple(addr, requests),
        )
        .await
        {
            Ok(results) => results
                .into_iter()
                .map(|r| r.map_err(BacnetError::Driver))
                .collect(),
            Err(_) => requests
                .iter()
                .map(|_| Err(BacnetError::Timeout(deadline)))
                .collect(),
        }
    }
}
