//! Monitor protocol client

use super::resp::{Connection, Frame};
use super::{MonitorQuorum, OpinionQuery, PeerChannel, PeerOpinion};
use crate::common::{Error, NodeAddr, Result, METRICS};
use async_trait::async_trait;
use std::time::Duration;

/// Client for one monitor endpoint, usually the load-balanced service in
/// front of every agent
#[derive(Debug, Clone)]
pub struct SentinelClient {
    endpoint: NodeAddr,
    password: Option<String>,
    timeout: Duration,
}

impl SentinelClient {
    pub fn new(endpoint: NodeAddr, password: Option<String>, timeout: Duration) -> Self {
        Self {
            endpoint,
            password,
            timeout,
        }
    }

    pub fn endpoint(&self) -> &NodeAddr {
        &self.endpoint
    }

    async fn request(&self, args: &[&str]) -> Result<Frame> {
        request_at(&self.endpoint, self.password.as_deref(), self.timeout, args).await
    }

    /// `PING` the agent; true on `PONG`
    pub async fn ping(&self) -> Result<bool> {
        let frame = self.request(&["PING"]).await?;
        Ok(frame.as_str() == Some("PONG"))
    }

    /// Flags of the monitored master (`SENTINEL master <name>`), e.g.
    /// `master,o_down`
    pub async fn master_flags(&self, name: &str) -> Result<Vec<String>> {
        let frame = self.request(&["SENTINEL", "master", name]).await?;
        let fields = frame
            .as_array()
            .ok_or_else(|| Error::Protocol("SENTINEL master reply is not an array".into()))?;
        let flags = fields
            .chunks(2)
            .find(|pair| pair.first().and_then(Frame::as_str) == Some("flags"))
            .and_then(|pair| pair.get(1))
            .and_then(Frame::as_str)
            .unwrap_or_default();
        Ok(flags
            .split(',')
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Identity the agent announces (`SENTINEL myid`)
    pub async fn myid(&self) -> Result<String> {
        let frame = self.request(&["SENTINEL", "myid"]).await?;
        frame
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol("SENTINEL myid reply is not a string".into()))
    }
}

async fn request_at(
    endpoint: &NodeAddr,
    password: Option<&str>,
    timeout: Duration,
    args: &[&str],
) -> Result<Frame> {
    let exchange = async {
        let mut conn = Connection::connect(&endpoint.host, endpoint.port, timeout).await?;
        conn.auth(password).await?;
        conn.request(args).await
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::Timeout(format!("{} on {}", args.join(" "), endpoint)))?
}

/// Parse a `get-master-addr-by-name` reply: `[host, port]` or nil
pub fn parse_master_addr(frame: &Frame) -> Result<Option<NodeAddr>> {
    if frame.is_null() {
        return Ok(None);
    }
    match frame.as_array() {
        Some([host, port]) => {
            let host = host
                .as_str()
                .ok_or_else(|| Error::Protocol("master host is not a string".into()))?;
            let port = port
                .as_str()
                .map(str::to_string)
                .or_else(|| port.as_int().map(|p| p.to_string()))
                .ok_or_else(|| Error::Protocol("master port missing".into()))?;
            NodeAddr::from_parts(host, &port).map(Some)
        }
        Some([]) => Ok(None),
        _ => Err(Error::Protocol(format!(
            "unexpected get-master-addr-by-name reply: {:?}",
            frame
        ))),
    }
}

#[async_trait]
impl MonitorQuorum for SentinelClient {
    async fn master_addr(&self, name: &str) -> Result<Option<NodeAddr>> {
        METRICS.master_queries.inc();
        let frame = self
            .request(&["SENTINEL", "get-master-addr-by-name", name])
            .await?;
        let master = parse_master_addr(&frame)?;
        if master.is_none() {
            return Ok(None);
        }

        // A master the quorum already declared dead is no answer at all
        match self.master_flags(name).await {
            Ok(flags) if flags.iter().any(|f| f == "o_down") => {
                tracing::debug!(name, "Quorum reports master as objectively down");
                Ok(None)
            }
            Ok(_) => Ok(master),
            Err(e) => {
                tracing::debug!(name, error = %e, "Could not read master flags");
                Ok(master)
            }
        }
    }

    async fn failover(&self, name: &str) -> Result<()> {
        METRICS.failovers_requested.inc();
        self.request(&["SENTINEL", "failover", name]).await?;
        Ok(())
    }
}

/// Peer exchange over `SENTINEL is-master-down-by-addr`
///
/// The reply is `[down, leader, epoch]` followed by the peer's current master
/// host and port.
#[derive(Debug, Clone)]
pub struct RespPeerChannel {
    password: Option<String>,
    timeout: Duration,
}

impl RespPeerChannel {
    pub fn new(password: Option<String>, timeout: Duration) -> Self {
        Self { password, timeout }
    }
}

#[async_trait]
impl PeerChannel for RespPeerChannel {
    async fn opinion(&self, peer: &NodeAddr, query: &OpinionQuery) -> Result<PeerOpinion> {
        let port = query.master.port.to_string();
        let epoch = query.epoch.to_string();
        let frame = request_at(
            peer,
            self.password.as_deref(),
            self.timeout,
            &[
                "SENTINEL",
                "is-master-down-by-addr",
                &query.master.host,
                &port,
                &epoch,
                query.requester.as_str(),
                &query.name,
            ],
        )
        .await?;
        parse_opinion(&frame)
    }
}

pub fn parse_opinion(frame: &Frame) -> Result<PeerOpinion> {
    let items = frame
        .as_array()
        .ok_or_else(|| Error::Protocol("is-master-down-by-addr reply is not an array".into()))?;
    let down = items
        .first()
        .and_then(Frame::as_int)
        .ok_or_else(|| Error::Protocol("is-master-down-by-addr reply has no state".into()))?;
    let epoch = items.get(2).and_then(Frame::as_int).unwrap_or(0).max(0) as u64;
    let master = match (items.get(3).and_then(Frame::as_str), items.get(4)) {
        (Some(host), Some(port)) if !host.is_empty() => port
            .as_int()
            .and_then(|p| u16::try_from(p).ok())
            .map(|p| NodeAddr::new(host, p)),
        _ => None,
    };
    Ok(PeerOpinion {
        down: down == 1,
        epoch,
        master,
    })
}
