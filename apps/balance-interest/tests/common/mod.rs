#![allow(dead_code)]

//! In-memory store and dialer used by the job scenarios.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use balance_interest::{AccountId, InterestPolicy, JobSettings};
use futures::{SinkExt, StreamExt};
use mesh_connect::{DialContext, MeshDialer, MeshError, MeshStream};
use resp_client::{RespCodec, RespValue};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

#[derive(Default)]
struct StoreState {
    values: HashMap<String, i64>,
    failing_keys: HashSet<String>,
    ping_fails: bool,
    commands: Vec<Vec<String>>,
}

/// Redis stand-in speaking RESP over in-memory pipes.
///
/// State survives across connections so consecutive runs see earlier writes.
#[derive(Clone, Default)]
pub struct FakeRedis {
    state: Arc<Mutex<StoreState>>,
}

impl FakeRedis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_ping(&self) {
        self.state.lock().unwrap().ping_fails = true;
    }

    pub fn fail_key(&self, key: &str) {
        self.state.lock().unwrap().failing_keys.insert(key.to_owned());
    }

    pub fn value(&self, key: &str) -> Option<i64> {
        self.state.lock().unwrap().values.get(key).copied()
    }

    /// Every command received, as its text arguments.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter_map(|c| c.into_iter().next())
            .collect()
    }

    /// Open a connection served by a background task.
    pub fn connect(&self) -> MeshStream {
        let (client, server) = tokio::io::duplex(8 * 1024);
        tokio::spawn(self.clone().serve(server));
        Box::new(client)
    }

    /// Answer requests on `stream` until the peer goes away.
    pub async fn serve<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, RespCodec);
        while let Some(Ok(request)) = framed.next().await {
            let reply = self.handle(&request);
            if framed.send(reply).await.is_err() {
                break;
            }
        }
    }

    fn handle(&self, request: &RespValue) -> RespValue {
        let RespValue::Array(Some(items)) = request else {
            return RespValue::Error("ERR protocol error".to_owned());
        };
        let args: Vec<String> = items
            .iter()
            .map(|v| v.as_text().unwrap_or_default().to_owned())
            .collect();

        let mut state = self.state.lock().unwrap();
        state.commands.push(args.clone());

        match args.first().map(|s| s.to_ascii_uppercase()).as_deref() {
            Some("PING") if state.ping_fails => {
                RespValue::Error("LOADING Redis is loading the dataset in memory".to_owned())
            }
            Some("PING") => RespValue::SimpleString("PONG".to_owned()),
            Some("INCRBY") if args.len() == 3 => {
                let key = args[1].clone();
                if state.failing_keys.contains(&key) {
                    return RespValue::Error(
                        "WRONGTYPE Operation against a key holding the wrong kind of value"
                            .to_owned(),
                    );
                }
                let Ok(delta) = args[2].parse::<i64>() else {
                    return RespValue::Error(
                        "ERR value is not an integer or out of range".to_owned(),
                    );
                };
                let value = state.values.entry(key).or_insert(0);
                *value += delta;
                RespValue::Integer(*value)
            }
            _ => RespValue::Error("ERR unknown command".to_owned()),
        }
    }
}

#[derive(Clone)]
pub enum DialMode {
    Connect(FakeRedis),
    Refuse,
    Hang,
}

/// Dialer that records the requested service names.
pub struct FakeDialer {
    mode: DialMode,
    requested: Mutex<Vec<String>>,
}

impl FakeDialer {
    pub fn new(mode: DialMode) -> Self {
        Self {
            mode,
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl MeshDialer for FakeDialer {
    async fn dial(&self, service: &str, _ctx: &DialContext) -> Result<MeshStream, MeshError> {
        self.requested.lock().unwrap().push(service.to_owned());
        match &self.mode {
            DialMode::Connect(store) => Ok(store.connect()),
            DialMode::Refuse => Err(MeshError::NoHealthyInstances {
                service: service.to_owned(),
            }),
            DialMode::Hang => std::future::pending().await,
        }
    }
}

pub fn settings(accounts: &[u32], target_service: &str) -> JobSettings {
    JobSettings {
        registry_address: "localhost:8500".to_owned(),
        registry_token: None,
        registry_timeout: Duration::from_secs(5),
        service_name: "balance-interest-lambda".to_owned(),
        target_service: target_service.to_owned(),
        accounts: accounts.iter().copied().map(AccountId::new).collect(),
        policy: InterestPolicy::new(40).unwrap(),
        dial_timeout: Duration::from_secs(10),
    }
}
