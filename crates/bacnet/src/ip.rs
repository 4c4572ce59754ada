//! The production driver: one ReadProperty exchange per call over an
//! ephemeral UDP socket. Binding per call keeps the driver trivially safe to
//! share between concurrent reads; invoke ids are still checked so a stale
//! datagram cannot be mistaken for the answer.

use std::{
    net::{
        IpAddr,
        Ipv4Addr,
        SocketAddr,
    },
    sync::atomic::{
        AtomicU8,
        Ordering,
    },
};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::{
    codec,
    types::{
        BacnetValue,
        ReadRequest,
    },
    BacnetDriver,
};

const MAX_FRAME: usize = 1500;

pub struct IpDriver {
    bind_ip: IpAddr,
    invoke_id: AtomicU8,
}

impl IpDriver {
    pub fn new(bind_ip: Option<IpAddr>) -> Self {
        Self {
            bind_ip: bind_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            invoke_id: AtomicU8::new(0),
        }
    }

    fn next_invoke_id(&self) -> u8 {
        self.invoke_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl BacnetDriver for IpDriver {
    async fn read_property(
        &self,
        addr: SocketAddr,
        request: ReadRequest,
    ) -> anyhow::Result<BacnetValue> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await?;
        socket.connect(addr).await?;
        let invoke_id = self.next_invoke_id();
        let frame = codec::encode_read_property(invoke_id, &request);
        socket.send(&frame).await?;

        let mut buf = [0u8; MAX_FRAME];
        // The socket is connected, so everything we receive comes from the
        // device; still attribute each frame by invoke id so a late answer to
        // an abandoned request, value or Error PDU alike, is skipped rather
        // than ending this call. Garbage datagrams are discarded; the gateway
        // timeout bounds the wait.
        loop {
            let n = socket.recv(&mut buf).await?;
            let (ack_invoke_id, outcome) = match codec::decode_read_property_ack(&buf[..n]) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::debug!("Discarding undecodable BACnet frame: {e:#}");
                    continue;
                },
            };
            if ack_invoke_id != invoke_id {
                tracing::debug!(
                    "Skipping stale BACnet frame (invoke {ack_invoke_id}, waiting on {invoke_id})"
                );
                continue;
            }
            return outcome;
        }
    }
}
