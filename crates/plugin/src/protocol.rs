//! Wire format between the host and a mod subprocess.
//!
//! Frames are single-line JSON documents on the mod's stdin (host frames) and
//! stdout (mod frames). The first line a mod writes is its handshake. Control
//! calls carry an `id`; object-access calls made by the mod during a run carry
//! the `broker` stream of that run and a per-stream `seq`.

use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use keel_core::{Capsule, Error, Gvk, ResourceRef, Result};

pub const PROTOCOL_VERSION: u32 = 1;

/// Env var carrying the magic cookie; its value must equal the mod name.
pub const MAGIC_COOKIE_KEY: &str = "KEEL_MOD_MAGIC_COOKIE";
pub const PROTOCOL_VERSION_KEY: &str = "KEEL_MOD_PROTOCOL_VERSION";

pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    Initialize { id: u64, config: String, tag: String },
    RunCapsule { id: u64, broker: u32, capsule: Box<Capsule> },
    BrokerReply { broker: u32, seq: u64, reply: BrokerReply },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModFrame {
    Handshake { name: String, protocol_version: u32 },
    Done {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Error>,
    },
    BrokerCall { broker: u32, seq: u64, call: BrokerCall },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum BrokerCall {
    GetObject { gvk: Gvk, name: String, current: bool },
    SetObject { gvk: Gvk, object: serde_json::Value },
    DeleteObject { gvk: Gvk, name: String },
    MarkUsedObject {
        reference: ResourceRef,
        state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BrokerReply {
    Object { object: Option<serde_json::Value> },
    Ok,
    Error { error: Error },
}

pub struct FrameReader<R> {
    inner: FramedRead<R, LinesCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { inner: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)) }
    }

    /// Next frame, or `None` once the peer closed its side.
    pub async fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            let line = match self.inner.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(Error::Unavailable(format!("reading frame: {e}"))),
                Some(Ok(line)) => line,
            };
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| Error::Unavailable(format!("malformed frame: {e}")));
        }
    }
}

pub struct FrameWriter<W> {
    inner: FramedWrite<W, LinesCodec>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)) }
    }

    pub async fn send<T: Serialize>(&mut self, frame: &T) -> Result<()> {
        let line = serde_json::to_string(frame).map_err(|e| Error::Internal(format!("encoding frame: {e}")))?;
        self.inner.send(line).await.map_err(|e| Error::Unavailable(format!("writing frame: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_tagged_json() {
        let f = ModFrame::BrokerCall {
            broker: 2,
            seq: 7,
            call: BrokerCall::GetObject { gvk: Gvk::new("apps", "v1", "Deployment"), name: "web".into(), current: false },
        };
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["type"], "broker_call");
        assert_eq!(v["call"]["call"], "get_object");
        assert_eq!(v["call"]["gvk"]["group"], "apps");

        let done = serde_json::to_value(ModFrame::Done { id: 1, error: None }).unwrap();
        assert_eq!(done, serde_json::json!({ "type": "done", "id": 1 }));
    }

    #[tokio::test]
    async fn reader_skips_blank_lines_and_reports_eof() {
        let data: &[u8] = b"\n{\"type\":\"done\",\"id\":3}\n";
        let mut r = FrameReader::new(data);
        match r.next_frame::<ModFrame>().await.unwrap() {
            Some(ModFrame::Done { id, error }) => {
                assert_eq!(id, 3);
                assert!(error.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(r.next_frame::<ModFrame>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_rejects_garbage() {
        let data: &[u8] = b"hello from a confused binary\n";
        let mut r = FrameReader::new(data);
        assert!(matches!(r.next_frame::<ModFrame>().await, Err(Error::Unavailable(_))));
    }
}
