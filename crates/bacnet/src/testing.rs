//! A scriptable driver for engine tests.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    types::{
        BacnetValue,
        ReadRequest,
    },
    BacnetDriver,
};

#[derive(Clone, Debug)]
pub enum FakeOutcome {
    Value(BacnetValue),
    Error(String),
    /// Sleeps forever; only the gateway timeout ends the call.
    Hang,
}

#[derive(Default)]
pub struct FakeDriver {
    script: Mutex<HashMap<(SocketAddr, ReadRequest), FakeOutcome>>,
    calls: Mutex<Vec<(SocketAddr, ReadRequest)>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, addr: SocketAddr, request: ReadRequest, outcome: FakeOutcome) {
        self.script.lock().insert((addr, request), outcome);
    }

    pub fn calls(&self) -> Vec<(SocketAddr, ReadRequest)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl BacnetDriver for FakeDriver {
    async fn read_property(
        &self,
        addr: SocketAddr,
        request: ReadRequest,
    ) -> anyhow::Result<BacnetValue> {
        self.calls.lock().push((addr, request));
        let outcome = self.script.lock().get(&(addr, request)).cloned();
        match outcome {
            Some(FakeOutcome::Value(v)) => Ok(v),
            Some(FakeOutcome::Error(message)) => Err(anyhow::anyhow!(message)),
            Some(FakeOutcome::Hang) => {
                loop {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
            },
            None => Err(anyhow::anyhow!("no response scripted for {request} at {addr}")),
        }
    }
}
