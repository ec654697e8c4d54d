//! Mod side of the protocol: what a mod binary runs inside `main`.

use async_trait::async_trait;
use kube::core::DynamicObject;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use keel_core::{CapsuleRequest, Error, Gvk, Mod, Result, UsedResource};

use crate::client::decode_object;
use crate::protocol::{
    BrokerCall, BrokerReply, FrameReader, FrameWriter, HostFrame, ModFrame, MAGIC_COOKIE_KEY, PROTOCOL_VERSION,
    PROTOCOL_VERSION_KEY,
};

/// Refuse to run unless launched by a keel host for this mod.
pub fn check_launch_env(name: &str) -> Result<()> { check_launch(name, |k| std::env::var(k).ok()) }

fn check_launch(name: &str, get: impl Fn(&str) -> Option<String>) -> Result<()> {
    let cookie = get(MAGIC_COOKIE_KEY).unwrap_or_default();
    if cookie != name {
        return Err(Error::FailedPrecondition(format!(
            "{name} is a keel mod and must be launched by a keel host ({MAGIC_COOKIE_KEY} is not set to its name)"
        )));
    }
    let version = get(PROTOCOL_VERSION_KEY).unwrap_or_default();
    if version.trim() != PROTOCOL_VERSION.to_string() {
        return Err(Error::FailedPrecondition(format!(
            "host requested protocol {version:?}, {name} speaks {PROTOCOL_VERSION}"
        )));
    }
    Ok(())
}

/// Serve `m` over the process's stdin and stdout until the host hangs up.
pub async fn serve_stdio(m: &mut dyn Mod) -> Result<()> {
    check_launch_env(m.name())?;
    serve(m, tokio::io::stdin(), tokio::io::stdout()).await
}

pub async fn serve<R, W>(m: &mut dyn Mod, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut reader = FrameReader::new(reader);
    let mut writer = FrameWriter::new(writer);
    writer.send(&ModFrame::Handshake { name: m.name().to_string(), protocol_version: PROTOCOL_VERSION }).await?;

    // A control frame that arrived while a run was waiting on a broker reply.
    let mut stashed: Option<HostFrame> = None;
    loop {
        let frame = match stashed.take() {
            Some(f) => f,
            None => match reader.next_frame::<HostFrame>().await? {
                Some(f) => f,
                None => break,
            },
        };
        match frame {
            HostFrame::Initialize { id, config, tag } => {
                let error = m.initialize(&config, &tag).await.err();
                writer.send(&ModFrame::Done { id, error }).await?;
            }
            HostFrame::RunCapsule { id, broker, capsule } => {
                let error = {
                    let mut req = RemoteRequest {
                        broker,
                        seq: 0,
                        reader: &mut reader,
                        writer: &mut writer,
                        stash: &mut stashed,
                    };
                    m.run(&capsule, &mut req).await.err()
                };
                writer.send(&ModFrame::Done { id, error }).await?;
            }
            HostFrame::BrokerReply { broker, seq, .. } => {
                debug!(broker, seq, "ignoring broker reply outside a run");
            }
        }
    }
    debug!(module = %m.name(), "host closed the connection");
    Ok(())
}

/// Request proxy handed to a mod's `run`: each call becomes a broker round trip.
struct RemoteRequest<'a, R, W> {
    broker: u32,
    seq: u64,
    reader: &'a mut FrameReader<R>,
    writer: &'a mut FrameWriter<W>,
    stash: &'a mut Option<HostFrame>,
}

impl<'a, R, W> RemoteRequest<'a, R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn call(&mut self, call: BrokerCall) -> Result<BrokerReply> {
        if self.stash.is_some() {
            return Err(Error::Aborted("the host abandoned this run".into()));
        }
        self.seq += 1;
        let seq = self.seq;
        self.writer.send(&ModFrame::BrokerCall { broker: self.broker, seq, call }).await?;
        loop {
            let frame = self
                .reader
                .next_frame::<HostFrame>()
                .await?
                .ok_or_else(|| Error::Unavailable("host closed the connection".into()))?;
            match frame {
                HostFrame::BrokerReply { broker, seq: got, reply } if broker == self.broker && got == seq => {
                    return match reply {
                        BrokerReply::Error { error } => Err(error),
                        other => Ok(other),
                    };
                }
                HostFrame::BrokerReply { broker, seq: got, .. } => {
                    debug!(broker, seq = got, "discarding stale broker reply");
                }
                control => {
                    *self.stash = Some(control);
                    return Err(Error::Aborted("the host abandoned this run".into()));
                }
            }
        }
    }

    async fn get(&mut self, gvk: &Gvk, name: &str, current: bool) -> Result<Option<DynamicObject>> {
        match self.call(BrokerCall::GetObject { gvk: gvk.clone(), name: name.to_string(), current }).await? {
            BrokerReply::Object { object: Some(v) } => decode_object(gvk, v).map(Some),
            BrokerReply::Object { object: None } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    async fn expect_ok(&mut self, call: BrokerCall) -> Result<()> {
        match self.call(call).await? {
            BrokerReply::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: BrokerReply) -> Error { Error::Internal(format!("unexpected broker reply {reply:?}")) }

#[async_trait]
impl<'a, R, W> CapsuleRequest for RemoteRequest<'a, R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn get_current(&mut self, gvk: &Gvk, name: &str) -> Result<Option<DynamicObject>> {
        self.get(gvk, name, true).await
    }

    async fn get_new(&mut self, gvk: &Gvk, name: &str) -> Result<Option<DynamicObject>> { self.get(gvk, name, false).await }

    async fn set(&mut self, obj: DynamicObject) -> Result<()> {
        let gvk = obj
            .types
            .as_ref()
            .map(|t| Gvk::from_api_version(&t.api_version, &t.kind))
            .ok_or_else(|| Error::InvalidArgument("object has no apiVersion/kind".into()))?;
        let object = serde_json::to_value(&obj)?;
        self.expect_ok(BrokerCall::SetObject { gvk, object }).await
    }

    async fn delete(&mut self, gvk: &Gvk, name: &str) -> Result<()> {
        self.expect_ok(BrokerCall::DeleteObject { gvk: gvk.clone(), name: name.to_string() }).await
    }

    async fn mark_used_resource(&mut self, used: UsedResource) -> Result<()> {
        self.expect_ok(BrokerCall::MarkUsedObject { reference: used.reference, state: used.state, message: used.message })
            .await
    }
}
