//! Monitor protocol listener
//!
//! Serves the subset of the sentinel protocol the cluster uses:
//! `PING`, `AUTH`, `SENTINEL get-master-addr-by-name | failover |
//! is-master-down-by-addr | master | myid`.

use super::agent::AgentState;
use crate::common::{Error, MonitorId, NodeAddr, Result};
use crate::protocol::{Connection, Frame, MonitorQuorum, OpinionQuery};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Accept connections until shutdown
pub async fn serve(
    listener: TcpListener,
    state: Arc<AgentState>,
    password: Option<String>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Monitor protocol listening");
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                let state = state.clone();
                let password = password.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(Connection::new(stream), state, password).await {
                        tracing::debug!(%peer, error = %e, "Connection closed with error");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    mut conn: Connection,
    state: Arc<AgentState>,
    password: Option<String>,
) -> Result<()> {
    let mut session = Session {
        authenticated: password.is_none(),
        password,
    };
    while let Some(frame) = conn.read_frame().await? {
        let args = match command_args(&frame) {
            Ok(args) => args,
            Err(e) => {
                conn.write_frame(&Frame::error(format!("ERR {}", e))).await?;
                continue;
            }
        };
        let reply = dispatch(&state, &mut session, &args).await;
        conn.write_frame(&reply).await?;
    }
    Ok(())
}

/// Per-connection state
pub struct Session {
    pub authenticated: bool,
    pub password: Option<String>,
}

fn command_args(frame: &Frame) -> Result<Vec<String>> {
    let items = frame
        .as_array()
        .ok_or_else(|| Error::Protocol("expected a command array".into()))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::Protocol("command arguments must be strings".into()))
        })
        .collect()
}

fn wrong_args(cmd: &str) -> Frame {
    Frame::error(format!(
        "ERR wrong number of arguments for '{}' command",
        cmd
    ))
}

/// Execute one command against the agent state
pub async fn dispatch(state: &AgentState, session: &mut Session, args: &[String]) -> Frame {
    let Some(cmd) = args.first() else {
        return Frame::error("ERR empty command");
    };
    let cmd = cmd.to_ascii_lowercase();

    if cmd == "auth" {
        let supplied = args.last().filter(|_| args.len() >= 2);
        return match (&session.password, supplied) {
            (_, None) => wrong_args("auth"),
            (None, Some(_)) => Frame::error(
                "ERR AUTH called without any password configured",
            ),
            (Some(expected), Some(given)) if expected == given => {
                session.authenticated = true;
                Frame::ok()
            }
            (Some(_), Some(_)) => Frame::error(
                "WRONGPASS invalid username-password pair or user is disabled.",
            ),
        };
    }
    if !session.authenticated {
        return Frame::error("NOAUTH Authentication required.");
    }

    match cmd.as_str() {
        "ping" => Frame::Simple("PONG".into()),
        "sentinel" => sentinel_command(state, &args[1..]).await,
        other => Frame::error(format!("ERR unknown command '{}'", other)),
    }
}

async fn sentinel_command(state: &AgentState, args: &[String]) -> Frame {
    let Some(sub) = args.first() else {
        return wrong_args("sentinel");
    };
    match sub.to_ascii_lowercase().as_str() {
        "myid" => Frame::bulk(state.my_id().as_str()),
        "get-master-addr-by-name" => {
            let Some(name) = args.get(1) else {
                return wrong_args("sentinel get-master-addr-by-name");
            };
            match state.master_addr(name).await {
                Ok(Some(addr)) => Frame::Array(vec![
                    Frame::bulk(&addr.host),
                    Frame::bulk(addr.port.to_string()),
                ]),
                Ok(None) => Frame::Null,
                Err(e) => error_frame(e),
            }
        }
        "failover" => {
            let Some(name) = args.get(1) else {
                return wrong_args("sentinel failover");
            };
            match state.failover(name).await {
                Ok(()) => Frame::ok(),
                Err(e) => error_frame(e),
            }
        }
        "master" => {
            let Some(name) = args.get(1) else {
                return wrong_args("sentinel master");
            };
            if *name != state.name() {
                return Frame::error("ERR No such master with that name");
            }
            Frame::Array(
                state
                    .master_info()
                    .into_iter()
                    .flat_map(|(k, v)| [Frame::bulk(k), Frame::bulk(v)])
                    .collect(),
            )
        }
        "is-master-down-by-addr" => {
            if args.len() < 5 {
                return wrong_args("sentinel is-master-down-by-addr");
            }
            let master = match NodeAddr::from_parts(&args[1], &args[2]) {
                Ok(addr) => addr,
                Err(e) => return error_frame(e),
            };
            let epoch = args[3].parse().unwrap_or(0);
            let requester = MonitorId::parse(&args[4]).unwrap_or_else(|_| state.my_id());
            let query = OpinionQuery {
                name: args.get(5).cloned().unwrap_or_else(|| state.name()),
                master,
                epoch,
                requester,
            };
            let opinion = state.opinion_for(&query);
            let (host, port) = opinion
                .master
                .map(|m| (m.host, m.port as i64))
                .unwrap_or_default();
            Frame::Array(vec![
                Frame::Integer(opinion.down as i64),
                Frame::bulk("*"),
                Frame::Integer(opinion.epoch as i64),
                Frame::bulk(host),
                Frame::Integer(port),
            ])
        }
        other => Frame::error(format!("ERR unknown sentinel subcommand '{}'", other)),
    }
}

fn error_frame(e: Error) -> Frame {
    match e {
        Error::Server(msg) => Frame::Error(msg),
        other => Frame::error(format!("ERR {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SentinelSettings;
    use crate::sentinel::config::MonitorConfig;

    fn state() -> AgentState {
        AgentState::new(MonitorConfig::new(
            MonitorId::from_hostname("redis-node-0"),
            "mymaster",
            NodeAddr::new("redis-node-0.svc", 6379),
            SentinelSettings::default(),
            NodeAddr::new("redis-node-0.svc", 26379),
        ))
    }

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn open_session() -> Session {
        Session {
            authenticated: true,
            password: None,
        }
    }

    #[tokio::test]
    async fn test_get_master_addr() {
        let state = state();
        let mut session = open_session();
        let reply = dispatch(
            &state,
            &mut session,
            &args(&["SENTINEL", "get-master-addr-by-name", "mymaster"]),
        )
        .await;
        assert_eq!(
            reply,
            Frame::Array(vec![Frame::bulk("redis-node-0.svc"), Frame::bulk("6379")])
        );

        let reply = dispatch(
            &state,
            &mut session,
            &args(&["SENTINEL", "get-master-addr-by-name", "other"]),
        )
        .await;
        assert!(reply.is_null());
    }

    #[tokio::test]
    async fn test_failover_then_inprog() {
        let state = state();
        let mut session = open_session();
        let cmd = args(&["SENTINEL", "failover", "mymaster"]);
        assert_eq!(dispatch(&state, &mut session, &cmd).await, Frame::ok());
        match dispatch(&state, &mut session, &cmd).await {
            Frame::Error(msg) => assert!(msg.starts_with("INPROG")),
            other => panic!("expected INPROG, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_required() {
        let state = state();
        let mut session = Session {
            authenticated: false,
            password: Some("pw".into()),
        };
        match dispatch(&state, &mut session, &args(&["PING"])).await {
            Frame::Error(msg) => assert!(msg.starts_with("NOAUTH")),
            other => panic!("expected NOAUTH, got {:?}", other),
        }
        assert!(matches!(
            dispatch(&state, &mut session, &args(&["AUTH", "nope"])).await,
            Frame::Error(_)
        ));
        assert_eq!(
            dispatch(&state, &mut session, &args(&["AUTH", "pw"])).await,
            Frame::ok()
        );
        assert_eq!(
            dispatch(&state, &mut session, &args(&["PING"])).await,
            Frame::Simple("PONG".into())
        );
    }

    #[tokio::test]
    async fn test_is_master_down_by_addr_reports_view() {
        let state = state();
        let mut session = open_session();
        let peer = MonitorId::from_hostname("redis-node-1");
        let reply = dispatch(
            &state,
            &mut session,
            &args(&[
                "SENTINEL",
                "is-master-down-by-addr",
                "redis-node-0.svc",
                "6379",
                "0",
                peer.as_str(),
            ]),
        )
        .await;
        let items = reply.as_array().unwrap();
        assert_eq!(items[0], Frame::Integer(0));
        assert_eq!(items[3].as_str(), Some("redis-node-0.svc"));
        assert_eq!(items[4], Frame::Integer(6379));
    }

    #[tokio::test]
    async fn test_master_flags() {
        let state = state();
        let mut session = open_session();
        let reply = dispatch(&state, &mut session, &args(&["SENTINEL", "master", "mymaster"])).await;
        let items = reply.as_array().unwrap();
        let flags_at = items
            .iter()
            .position(|f| f.as_str() == Some("flags"))
            .unwrap();
        assert_eq!(items[flags_at + 1].as_str(), Some("master"));
    }
}
