//! Data-plane client

use super::resp::{Connection, Frame};
use super::{DataPlane, PingReply, ReplicationInfo};
use crate::common::{Error, NodeAddr, Result, Role};
use async_trait::async_trait;
use std::time::Duration;

/// Talks to data nodes over RESP, one short-lived connection per command
#[derive(Clone)]
pub struct RespDataPlane {
    password: Option<String>,
    timeout: Duration,
}

impl RespDataPlane {
    pub fn new(password: Option<String>, timeout: Duration) -> Self {
        Self { password, timeout }
    }

    async fn request(&self, node: &NodeAddr, args: &[&str]) -> Result<Frame> {
        let exchange = async {
            let mut conn = Connection::connect(&node.host, node.port, self.timeout).await?;
            conn.auth(self.password.as_deref()).await?;
            conn.request(args).await
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout(format!("{} on {}", args.join(" "), node)))?
    }
}

#[async_trait]
impl DataPlane for RespDataPlane {
    async fn ping(&self, node: &NodeAddr) -> Result<PingReply> {
        match self.request(node, &["PING"]).await {
            Ok(frame) if frame.as_str() == Some("PONG") => Ok(PingReply::Pong),
            Ok(frame) => Ok(PingReply::Other(format!("{:?}", frame))),
            Err(e) if e.is_loading() => Ok(PingReply::Loading),
            Err(e) => Err(e),
        }
    }

    async fn role(&self, node: &NodeAddr) -> Result<ReplicationInfo> {
        let frame = self.request(node, &["ROLE"]).await?;
        parse_role(&frame)
    }

    async fn promote(&self, node: &NodeAddr) -> Result<()> {
        self.request(node, &["REPLICAOF", "NO", "ONE"]).await?;
        Ok(())
    }

    async fn replicate_from(&self, node: &NodeAddr, master: &NodeAddr) -> Result<()> {
        let port = master.port.to_string();
        self.request(node, &["REPLICAOF", &master.host, &port])
            .await?;
        Ok(())
    }
}

/// Parse a `ROLE` reply.
///
/// master: `["master", offset, [[ip, port, offset], ...]]`
/// replica: `["slave", host, port, state, offset]`
pub fn parse_role(frame: &Frame) -> Result<ReplicationInfo> {
    let items = frame
        .as_array()
        .ok_or_else(|| Error::Protocol("ROLE reply is not an array".into()))?;
    let kind = items
        .first()
        .and_then(Frame::as_str)
        .ok_or_else(|| Error::Protocol("ROLE reply has no role".into()))?;

    let role = Role::from_wire(kind);
    let offset_at = |idx: usize| {
        items
            .get(idx)
            .and_then(Frame::as_int)
            .map(|n| n.max(0) as u64)
            .unwrap_or(0)
    };

    match role {
        Role::Master => Ok(ReplicationInfo {
            role,
            offset: offset_at(1),
            master: None,
            link_up: true,
        }),
        Role::Replica => {
            let host = items.get(1).and_then(Frame::as_str).unwrap_or_default();
            let port = items.get(2).and_then(Frame::as_int).unwrap_or(0);
            let state = items.get(3).and_then(Frame::as_str).unwrap_or_default();
            let master = u16::try_from(port)
                .ok()
                .filter(|_| !host.is_empty())
                .map(|port| NodeAddr::new(host, port));
            Ok(ReplicationInfo {
                role,
                offset: offset_at(4),
                master,
                link_up: state == "connected",
            })
        }
        Role::Unknown => Ok(ReplicationInfo {
            role,
            offset: 0,
            master: None,
            link_up: false,
        }),
    }
}
