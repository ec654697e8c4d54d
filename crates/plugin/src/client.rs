use std::time::{Duration, Instant};

use kube::core::DynamicObject;
use metrics::{counter, histogram};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, warn};

use keel_core::{Capsule, CapsuleRequest, Error, Gvk, Result, UsedResource};

use crate::protocol::{BrokerCall, BrokerReply, FrameReader, FrameWriter, HostFrame, ModFrame, PROTOCOL_VERSION};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModOptions {
    pub handshake_timeout: Duration,
    /// Bound on one `initialize` or `run_capsule` call, broker traffic included.
    pub call_timeout: Duration,
}

impl Default for ModOptions {
    fn default() -> Self { Self { handshake_timeout: DEFAULT_TIMEOUT, call_timeout: DEFAULT_TIMEOUT } }
}

impl ModOptions {
    /// Defaults overridden by `KEEL_MOD_TIMEOUT_SECS` and
    /// `KEEL_MOD_HANDSHAKE_TIMEOUT_SECS`. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(secs) = env_secs("KEEL_MOD_TIMEOUT_SECS") {
            opts.call_timeout = secs;
        }
        if let Some(secs) = env_secs("KEEL_MOD_HANDSHAKE_TIMEOUT_SECS") {
            opts.handshake_timeout = secs;
        }
        opts
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            warn!(key, value = %raw, "ignoring invalid timeout");
            None
        }
    }
}

/// Host side of one mod connection.
///
/// Calls are strictly sequential. A call that times out is abandoned: its
/// late `done` frame is discarded and object calls on its broker stream are
/// refused, so the connection stays usable for the next call.
pub struct ModClient<R, W> {
    name: String,
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    opts: ModOptions,
    next_id: u64,
    next_broker: u32,
}

impl<R, W> ModClient<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wait for the handshake and check it names `name` at our protocol version.
    pub async fn connect(name: &str, reader: R, writer: W, opts: ModOptions) -> Result<Self> {
        let mut reader = FrameReader::new(reader);
        let frame = match timeout(opts.handshake_timeout, reader.next_frame::<ModFrame>()).await {
            Ok(res) => res.map_err(|e| e.context(format!("mod {name}: handshake")))?,
            Err(_) => {
                return Err(Error::DeadlineExceeded(format!(
                    "mod {name}: no handshake within {:?}",
                    opts.handshake_timeout
                )))
            }
        };
        match frame {
            Some(ModFrame::Handshake { name: got, protocol_version }) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(Error::FailedPrecondition(format!(
                        "mod {name} speaks protocol {protocol_version}, host speaks {PROTOCOL_VERSION}"
                    )));
                }
                if got != name {
                    return Err(Error::FailedPrecondition(format!("mod {name} identified itself as {got}")));
                }
            }
            Some(other) => {
                return Err(Error::FailedPrecondition(format!("mod {name}: expected handshake, got {other:?}")));
            }
            None => return Err(Error::Unavailable(format!("mod {name} exited before the handshake"))),
        }
        debug!(module = %name, "mod handshake complete");
        Ok(Self { name: name.to_string(), reader, writer: FrameWriter::new(writer), opts, next_id: 0, next_broker: 0 })
    }

    pub fn name(&self) -> &str { &self.name }

    pub async fn initialize(&mut self, config: &str, tag: &str) -> Result<()> {
        self.next_id += 1;
        let id = self.next_id;
        let frame = HostFrame::Initialize { id, config: config.to_string(), tag: tag.to_string() };
        self.call("initialize", id, frame, None).await
    }

    /// Run the mod against `capsule`, serving its object calls from `req`.
    pub async fn run_capsule(&mut self, capsule: &Capsule, req: &mut dyn CapsuleRequest) -> Result<()> {
        self.next_id += 1;
        self.next_broker += 1;
        let (id, broker) = (self.next_id, self.next_broker);
        let frame = HostFrame::RunCapsule { id, broker, capsule: Box::new(capsule.clone()) };
        self.call("run", id, frame, Some((broker, req))).await
    }

    async fn call(
        &mut self,
        op: &'static str,
        id: u64,
        frame: HostFrame,
        bridge: Option<(u32, &mut dyn CapsuleRequest)>,
    ) -> Result<()> {
        let t0 = Instant::now();
        let limit = self.opts.call_timeout;
        let outcome = timeout(limit, async {
            self.writer.send(&frame).await?;
            self.await_done(id, bridge).await
        })
        .await;
        let res = match outcome {
            Ok(res) => res,
            Err(_) => Err(Error::DeadlineExceeded(format!("mod {}: {op} exceeded {limit:?}", self.name))),
        };
        let module = self.name.clone();
        counter!("mod_calls_total", 1u64, "mod" => module.clone(), "call" => op);
        histogram!("mod_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "mod" => module.clone(), "call" => op);
        if let Err(e) = &res {
            counter!("mod_call_errors_total", 1u64, "mod" => module, "call" => op);
            debug!(module = %self.name, call = op, error = %e, "mod call failed");
        }
        res
    }

    async fn await_done(&mut self, id: u64, mut bridge: Option<(u32, &mut dyn CapsuleRequest)>) -> Result<()> {
        loop {
            let frame = self
                .reader
                .next_frame::<ModFrame>()
                .await?
                .ok_or_else(|| Error::Unavailable(format!("mod {} closed its output", self.name)))?;
            match frame {
                ModFrame::Done { id: done, error } if done == id => return error.map_or(Ok(()), Err),
                ModFrame::Done { id: stale, .. } => {
                    debug!(module = %self.name, id = stale, "discarding reply to an abandoned call");
                }
                ModFrame::BrokerCall { broker, seq, call } => {
                    let reply = match bridge.as_mut() {
                        Some((active, req)) if *active == broker => dispatch(call, &mut **req).await,
                        _ => BrokerReply::Error {
                            error: Error::FailedPrecondition(format!("broker stream {broker} is closed")),
                        },
                    };
                    self.writer.send(&HostFrame::BrokerReply { broker, seq, reply }).await?;
                }
                ModFrame::Handshake { .. } => {
                    warn!(module = %self.name, "ignoring repeated handshake");
                }
            }
        }
    }
}

/// Serve one object call against the host's request.
pub(crate) async fn dispatch(call: BrokerCall, req: &mut dyn CapsuleRequest) -> BrokerReply {
    let res = match call {
        BrokerCall::GetObject { gvk, name, current } => {
            let found = if current { req.get_current(&gvk, &name).await } else { req.get_new(&gvk, &name).await };
            found.and_then(|obj| match obj {
                Some(obj) => Ok(BrokerReply::Object { object: Some(serde_json::to_value(obj)?) }),
                None => Ok(BrokerReply::Object { object: None }),
            })
        }
        BrokerCall::SetObject { gvk, object } => match decode_object(&gvk, object) {
            Ok(obj) => req.set(obj).await.map(|_| BrokerReply::Ok),
            Err(e) => Err(e),
        },
        BrokerCall::DeleteObject { gvk, name } => req.delete(&gvk, &name).await.map(|_| BrokerReply::Ok),
        BrokerCall::MarkUsedObject { reference, state, message } => {
            req.mark_used_resource(UsedResource { reference, state, message }).await.map(|_| BrokerReply::Ok)
        }
    };
    res.unwrap_or_else(|error| BrokerReply::Error { error })
}

/// Decode an object sent by a mod and check it is of the type it claims.
pub(crate) fn decode_object(gvk: &Gvk, value: serde_json::Value) -> Result<DynamicObject> {
    let obj: DynamicObject = serde_json::from_value(value)?;
    let actual = obj.types.as_ref().map(|t| Gvk::from_api_version(&t.api_version, &t.kind));
    if actual.as_ref() != Some(gvk) {
        let shown = actual.map(|g| g.to_string()).unwrap_or_else(|| "untyped object".into());
        return Err(Error::InvalidArgument(format!("object of type {shown} sent as {gvk}")));
    }
    Ok(obj)
}
