//! In-memory block upload server used by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use bytes::Bytes;
use parking_lot::Mutex;

use dog_resumable::{ChunkTransport, TransportRequest, TransportResponse, UploadError, UploadResult};

/// Content whose every 4-byte word is its own index, so any aligned chunk
/// tells the server where in the content it came from.
pub fn pattern(len: u64) -> Vec<u8> {
    assert_eq!(len % 4, 0, "pattern length must be a multiple of 4");
    (0..(len / 4) as u32).flat_map(|i| i.to_be_bytes()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Negotiate,
    Append,
    Commit,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub kind: CallKind,
    pub url: String,
    /// Block the chunk belongs to (chunk calls only)
    pub block: Option<usize>,
    /// Offset within the block (from the URL for appends, 0 for negotiate)
    pub offset: u64,
    pub len: u64,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum FaultAction {
    /// Fail before reaching the server
    Transport,
    /// Answer with this status and do nothing
    Status(u16),
    /// Process the chunk but report a wrong crc32 and keep the data out
    CorruptCrc,
    /// Hold the request this long before handling it
    Delay(Duration),
    /// Answer 200 with a body that is not JSON and do nothing
    Garbage,
}

struct Fault {
    when: Box<dyn Fn(&Call) -> bool + Send + Sync>,
    action: FaultAction,
    remaining: usize,
}

#[derive(Default)]
struct State {
    contexts: HashMap<String, (usize, Vec<u8>)>,
    next_ctx: u64,
    calls: Vec<Call>,
    commit_body: Option<String>,
    committed: Option<Vec<u8>>,
}

pub struct SimulatedServer {
    block_size: u64,
    state: Mutex<State>,
    faults: Mutex<Vec<Fault>>,
    latency: Mutex<HashMap<usize, Duration>>,
    commit_status: Mutex<Option<u16>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SimulatedServer {
    pub fn new(block_size: u64) -> Arc<Self> {
        Arc::new(Self {
            block_size,
            state: Mutex::new(State::default()),
            faults: Mutex::new(Vec::new()),
            latency: Mutex::new(HashMap::new()),
            commit_status: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Apply `action` to the next `times` calls matching `when`
    pub fn inject<F>(&self, times: usize, action: FaultAction, when: F)
    where
        F: Fn(&Call) -> bool + Send + Sync + 'static,
    {
        self.faults.lock().push(Fault {
            when: Box::new(when),
            action,
            remaining: times,
        });
    }

    /// Delay every call for `block`
    pub fn slow_block(&self, block: usize, delay: Duration) {
        self.latency.lock().insert(block, delay);
    }

    /// Make commit calls fail with `status` until cleared with `None`
    pub fn fail_commits(&self, status: Option<u16>) {
        *self.commit_status.lock() = status;
    }

    /// Register a context as if an earlier run had sent `data` for `block`
    pub fn preload(&self, block: usize, ctx: &str, data: Vec<u8>) {
        self.state
            .lock()
            .contexts
            .insert(ctx.to_string(), (block, data));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn chunk_calls_for(&self, block: usize) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.block == Some(block))
            .collect()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.calls().iter().filter(|c| c.kind == kind).count()
    }

    pub fn block_of(&self, ctx: &str) -> Option<usize> {
        self.state.lock().contexts.get(ctx).map(|(block, _)| *block)
    }

    pub fn commit_body(&self) -> Option<String> {
        self.state.lock().commit_body.clone()
    }

    pub fn committed(&self) -> Option<Vec<u8>> {
        self.state.lock().committed.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn describe(&self, request: &TransportRequest) -> Call {
        let path = request.url.splitn(4, '/').nth(3).unwrap_or_default().to_string();
        let segments: Vec<&str> = path.split('/').collect();
        let len = request.body.len() as u64;
        let block = (request.body.len() >= 4).then(|| {
            let word = u32::from_be_bytes([request.body[0], request.body[1], request.body[2], request.body[3]]);
            (word as u64 * 4 / self.block_size) as usize
        });

        match segments.first().copied() {
            Some("mkblk") => Call {
                kind: CallKind::Negotiate,
                url: request.url.clone(),
                block,
                offset: 0,
                len,
                context: None,
            },
            Some("bput") => Call {
                kind: CallKind::Append,
                url: request.url.clone(),
                block,
                offset: segments.get(2).and_then(|s| s.parse().ok()).unwrap_or(u64::MAX),
                len,
                context: segments.get(1).map(|s| s.to_string()),
            },
            _ => Call {
                kind: CallKind::Commit,
                url: request.url.clone(),
                block: None,
                offset: 0,
                len,
                context: None,
            },
        }
    }

    fn take_fault(&self, call: &Call) -> Option<FaultAction> {
        let mut faults = self.faults.lock();
        let fault = faults
            .iter_mut()
            .find(|f| f.remaining > 0 && (f.when)(call))?;
        fault.remaining -= 1;
        Some(fault.action.clone())
    }

    fn handle(&self, call: &Call, request: &TransportRequest, fault: Option<FaultAction>) -> TransportResponse {
        let mut state = self.state.lock();

        match call.kind {
            CallKind::Negotiate => {
                let block = call.block.unwrap_or(usize::MAX);
                let crc = crc32fast::hash(&request.body);
                if matches!(fault, Some(FaultAction::CorruptCrc)) {
                    return chunk_reply("ctx-corrupt", crc ^ 1, call.len);
                }
                state.next_ctx += 1;
                let ctx = format!("ctx-{}-{}", block, state.next_ctx);
                state.contexts.insert(ctx.clone(), (block, request.body.to_vec()));
                chunk_reply(&ctx, crc, call.len)
            }
            CallKind::Append => {
                let old = call.context.clone().unwrap_or_default();
                let Some((block, mut data)) = state.contexts.remove(&old) else {
                    return TransportResponse::new(701, "invalid context");
                };
                if data.len() as u64 != call.offset {
                    state.contexts.insert(old, (block, data));
                    return TransportResponse::new(400, "offset mismatch");
                }

                let crc = crc32fast::hash(&request.body);
                if matches!(fault, Some(FaultAction::CorruptCrc)) {
                    state.contexts.insert(old.clone(), (block, data));
                    return chunk_reply(&old, crc ^ 1, call.offset);
                }

                data.extend_from_slice(&request.body);
                let offset = data.len() as u64;
                state.next_ctx += 1;
                let ctx = format!("ctx-{}-{}", block, state.next_ctx);
                state.contexts.insert(ctx.clone(), (block, data));
                chunk_reply(&ctx, crc, offset)
            }
            CallKind::Commit => {
                if let Some(status) = *self.commit_status.lock() {
                    return TransportResponse::new(status, "commit failed");
                }

                let body = String::from_utf8_lossy(&request.body).into_owned();
                let mut assembled = Vec::new();
                if !body.is_empty() {
                    for ctx in body.split(',') {
                        match state.contexts.get(ctx) {
                            Some((_, data)) => assembled.extend_from_slice(data),
                            None => return TransportResponse::new(400, format!("unknown context {}", ctx)),
                        }
                    }
                }

                let segments: Vec<&str> = request.url.split('/').collect();
                let key = segments
                    .iter()
                    .position(|s| *s == "mkfile")
                    .and_then(|i| segments.get(i + 1))
                    .and_then(|s| URL_SAFE.decode(s).ok())
                    .map(|k| String::from_utf8_lossy(&k).into_owned())
                    .unwrap_or_default();
                let hash = format!("{:08x}", crc32fast::hash(&assembled));

                state.commit_body = Some(body);
                state.committed = Some(assembled);
                TransportResponse::new(
                    200,
                    serde_json::json!({ "hash": hash, "key": key }).to_string(),
                )
            }
        }
    }
}

fn chunk_reply(ctx: &str, crc32: u32, offset: u64) -> TransportResponse {
    let body = serde_json::json!({
        "ctx": ctx,
        "checksum": format!("sum-{}", ctx),
        "crc32": crc32,
        "offset": offset,
    });
    TransportResponse::new(200, body.to_string())
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChunkTransport for SimulatedServer {
    async fn execute(&self, request: TransportRequest) -> UploadResult<TransportResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let call = self.describe(&request);
        self.state.lock().calls.push(call.clone());

        let delay = call.block.and_then(|b| self.latency.lock().get(&b).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.take_fault(&call) {
            Some(FaultAction::Transport) => Err(UploadError::transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))),
            Some(FaultAction::Status(status)) => Ok(TransportResponse::new(status, Bytes::from("injected"))),
            Some(FaultAction::Garbage) => Ok(TransportResponse::new(200, "<html>bad gateway</html>")),
            Some(FaultAction::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(self.handle(&call, &request, None))
            }
            fault => Ok(self.handle(&call, &request, fault)),
        }
    }
}
