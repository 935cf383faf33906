//! Network-addressable storage backend.
//!
//! [`RemoteBackend`] forwards every [`StorageBackend`] operation over TCP
//! to a [`StorageServer`], which owns a [`FileBackend`] per served
//! container. Frames are u32-length-prefixed bincode; attribute values
//! travel as JSON text because arbitrary JSON values do not survive a
//! bincode round trip.
//!
//! The server accepts one client at a time and handles its connection to
//! completion before accepting the next, which preserves the
//! exclusive-writer guarantee a container requires. On disconnect the
//! served container is flushed.
//!
//! Url form: `scan://host:port/name` — `name` selects the container file
//! `<name>.scan` under the server's data directory.

use std::path::PathBuf;

use async_trait::async_trait;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::backend::{AttrMap, OpenMode, StorageBackend};
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::node::NodeId;

/// Upper bound on one wire frame; oversized lengths are protocol errors,
/// never allocations.
const MAX_FRAME: usize = 256 * 1024 * 1024;

/// Attribute pairs on the wire: (key, JSON-encoded value).
type WireAttrs = Vec<(String, String)>;

#[derive(Debug, Serialize, Deserialize)]
enum Request {
    Open {
        container: String,
        mode: OpenMode,
    },
    GetOrCreateGroup {
        parent: NodeId,
        name: String,
        title: String,
    },
    FindChild {
        parent: NodeId,
        name: String,
    },
    Children {
        parent: NodeId,
    },
    CreateArray {
        parent: NodeId,
        name: String,
        data: ArrayD<f64>,
        attrs: WireAttrs,
    },
    CreateEArray {
        parent: NodeId,
        name: String,
        row_shape: Vec<usize>,
        attrs: WireAttrs,
    },
    Append {
        array: NodeId,
        rows: ArrayD<f64>,
    },
    CreateVlArray {
        parent: NodeId,
        name: String,
        attrs: WireAttrs,
    },
    AppendText {
        array: NodeId,
        line: String,
    },
    WriteAt {
        array: NodeId,
        index: Vec<usize>,
        values: ArrayD<f64>,
    },
    Read {
        array: NodeId,
    },
    ReadText {
        array: NodeId,
    },
    SetAttr {
        node: NodeId,
        key: String,
        value: String,
    },
    GetAttr {
        node: NodeId,
        key: String,
    },
    AttrKeys {
        node: NodeId,
    },
    Flush,
}

#[derive(Debug, Serialize, Deserialize)]
enum Response {
    Node(NodeId),
    OptNode(Option<NodeId>),
    Names(Vec<String>),
    Data(ArrayD<f64>),
    Lines(Vec<String>),
    OptText(Option<String>),
    Unit,
    Err(String),
}

async fn write_frame<T: Serialize>(stream: &mut TcpStream, msg: &T) -> StorageResult<()> {
    let body = bincode::serialize(msg)?;
    if body.len() > MAX_FRAME {
        return Err(StorageError::Protocol(format!(
            "frame of {} bytes exceeds maximum {}",
            body.len(),
            MAX_FRAME
        )));
    }
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> StorageResult<T> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME {
        return Err(StorageError::Protocol(format!(
            "frame length {} exceeds maximum {}",
            len, MAX_FRAME
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

fn encode_attrs(attrs: &AttrMap) -> StorageResult<WireAttrs> {
    attrs
        .iter()
        .map(|(k, v)| Ok((k.clone(), serde_json::to_string(v)?)))
        .collect()
}

fn decode_attrs(attrs: WireAttrs) -> StorageResult<AttrMap> {
    attrs
        .into_iter()
        .map(|(k, v)| Ok((k, serde_json::from_str(&v)?)))
        .collect()
}

// =============================================================================
// Client
// =============================================================================

/// Storage backend speaking to a remote [`StorageServer`].
pub struct RemoteBackend {
    stream: TcpStream,
    url: String,
}

impl RemoteBackend {
    /// Connect to a storage server and open the named container.
    pub async fn connect(url: &str, mode: OpenMode) -> StorageResult<Self> {
        let rest = url
            .strip_prefix("scan://")
            .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
        let (addr, container) = rest
            .split_once('/')
            .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
        if addr.is_empty() || container.is_empty() || container.contains('/') {
            return Err(StorageError::InvalidUrl(url.to_string()));
        }
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(
            &mut stream,
            &Request::Open {
                container: container.to_string(),
                mode,
            },
        )
        .await?;
        match read_frame::<Response>(&mut stream).await? {
            Response::Node(_root) => {}
            Response::Err(msg) => return Err(StorageError::Remote(msg)),
            other => {
                return Err(StorageError::Protocol(format!(
                    "unexpected open response: {:?}",
                    other
                )))
            }
        }
        debug!(url, ?mode, "Connected to storage server");
        Ok(Self {
            stream,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&mut self, req: Request) -> StorageResult<Response> {
        write_frame(&mut self.stream, &req).await?;
        match read_frame::<Response>(&mut self.stream).await? {
            Response::Err(msg) => Err(StorageError::Remote(msg)),
            other => Ok(other),
        }
    }

    async fn call_node(&mut self, req: Request) -> StorageResult<NodeId> {
        match self.call(req).await? {
            Response::Node(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn call_unit(&mut self, req: Request) -> StorageResult<()> {
        match self.call(req).await? {
            Response::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(resp: Response) -> StorageError {
    StorageError::Protocol(format!("unexpected response: {:?}", resp))
}

#[async_trait]
impl StorageBackend for RemoteBackend {
    fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    async fn get_or_create_group(
        &mut self,
        parent: NodeId,
        name: &str,
        title: &str,
    ) -> StorageResult<NodeId> {
        self.call_node(Request::GetOrCreateGroup {
            parent,
            name: name.to_string(),
            title: title.to_string(),
        })
        .await
    }

    async fn find_child(&mut self, parent: NodeId, name: &str) -> StorageResult<Option<NodeId>> {
        match self
            .call(Request::FindChild {
                parent,
                name: name.to_string(),
            })
            .await?
        {
            Response::OptNode(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn children(&mut self, parent: NodeId) -> StorageResult<Vec<String>> {
        match self.call(Request::Children { parent }).await? {
            Response::Names(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    async fn create_array(
        &mut self,
        parent: NodeId,
        name: &str,
        data: ArrayD<f64>,
        attrs: AttrMap,
    ) -> StorageResult<NodeId> {
        let attrs = encode_attrs(&attrs)?;
        self.call_node(Request::CreateArray {
            parent,
            name: name.to_string(),
            data,
            attrs,
        })
        .await
    }

    async fn create_earray(
        &mut self,
        parent: NodeId,
        name: &str,
        row_shape: Vec<usize>,
        attrs: AttrMap,
    ) -> StorageResult<NodeId> {
        let attrs = encode_attrs(&attrs)?;
        self.call_node(Request::CreateEArray {
            parent,
            name: name.to_string(),
            row_shape,
            attrs,
        })
        .await
    }

    async fn append(&mut self, array: NodeId, rows: ArrayD<f64>) -> StorageResult<()> {
        self.call_unit(Request::Append { array, rows }).await
    }

    async fn create_vlarray(
        &mut self,
        parent: NodeId,
        name: &str,
        attrs: AttrMap,
    ) -> StorageResult<NodeId> {
        let attrs = encode_attrs(&attrs)?;
        self.call_node(Request::CreateVlArray {
            parent,
            name: name.to_string(),
            attrs,
        })
        .await
    }

    async fn append_text(&mut self, array: NodeId, line: &str) -> StorageResult<()> {
        self.call_unit(Request::AppendText {
            array,
            line: line.to_string(),
        })
        .await
    }

    async fn write_at(
        &mut self,
        array: NodeId,
        index: &[usize],
        values: ArrayD<f64>,
    ) -> StorageResult<()> {
        self.call_unit(Request::WriteAt {
            array,
            index: index.to_vec(),
            values,
        })
        .await
    }

    async fn read(&mut self, array: NodeId) -> StorageResult<ArrayD<f64>> {
        match self.call(Request::Read { array }).await? {
            Response::Data(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    async fn read_text(&mut self, array: NodeId) -> StorageResult<Vec<String>> {
        match self.call(Request::ReadText { array }).await? {
            Response::Lines(lines) => Ok(lines),
            other => Err(unexpected(other)),
        }
    }

    async fn set_attr(
        &mut self,
        node: NodeId,
        key: &str,
        value: serde_json::Value,
    ) -> StorageResult<()> {
        self.call_unit(Request::SetAttr {
            node,
            key: key.to_string(),
            value: serde_json::to_string(&value)?,
        })
        .await
    }

    async fn get_attr(
        &mut self,
        node: NodeId,
        key: &str,
    ) -> StorageResult<Option<serde_json::Value>> {
        match self
            .call(Request::GetAttr {
                node,
                key: key.to_string(),
            })
            .await?
        {
            Response::OptText(Some(text)) => Ok(Some(serde_json::from_str(&text)?)),
            Response::OptText(None) => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    async fn attr_keys(&mut self, node: NodeId) -> StorageResult<Vec<String>> {
        match self.call(Request::AttrKeys { node }).await? {
            Response::Names(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    async fn flush(&mut self) -> StorageResult<()> {
        self.call_unit(Request::Flush).await
    }
}

// =============================================================================
// Server
// =============================================================================

/// Serves containers from a data directory, one client at a time.
pub struct StorageServer {
    data_dir: PathBuf,
}

impl StorageServer {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Accept loop. Connections are handled sequentially so exactly one
    /// writer touches a container at a time.
    pub async fn serve(&self, listener: TcpListener) -> StorageResult<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            info!(%peer, "Storage client connected");
            match self.handle_client(stream).await {
                Ok(()) => info!(%peer, "Storage client disconnected"),
                Err(e) => warn!(%peer, error = %e, "Storage session ended with error"),
            }
        }
    }

    async fn handle_client(&self, mut stream: TcpStream) -> StorageResult<()> {
        // First frame must open a container.
        let (container, mode) = match read_frame::<Request>(&mut stream).await? {
            Request::Open { container, mode } => (container, mode),
            other => {
                let msg = format!("expected Open, got {:?}", other);
                write_frame(&mut stream, &Response::Err(msg.clone())).await?;
                return Err(StorageError::Protocol(msg));
            }
        };
        if container.is_empty()
            || container
                .chars()
                .any(|c| c == '/' || c == '\\' || c == '.' || c == ':')
        {
            let msg = format!("invalid container name '{}'", container);
            write_frame(&mut stream, &Response::Err(msg.clone())).await?;
            return Err(StorageError::Protocol(msg));
        }
        let path = self.data_dir.join(format!("{}.scan", container));
        let mut backend = match FileBackend::open(&path, mode).await {
            Ok(b) => b,
            Err(e) => {
                write_frame(&mut stream, &Response::Err(e.to_string())).await?;
                return Err(e);
            }
        };
        write_frame(&mut stream, &Response::Node(backend.root())).await?;
        info!(container, ?mode, "Serving container");

        loop {
            let req = match read_frame::<Request>(&mut stream).await {
                Ok(req) => req,
                // A closed connection ends the session cleanly.
                Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    backend.flush().await?;
                    return Err(e);
                }
            };
            let resp = dispatch(&mut backend, req).await;
            write_frame(&mut stream, &resp).await?;
        }
        // Final durability point for the session.
        backend.flush().await?;
        Ok(())
    }
}

async fn dispatch(backend: &mut FileBackend, req: Request) -> Response {
    let result = try_dispatch(backend, req).await;
    match result {
        Ok(resp) => resp,
        Err(e) => Response::Err(e.to_string()),
    }
}

async fn try_dispatch(backend: &mut FileBackend, req: Request) -> StorageResult<Response> {
    Ok(match req {
        Request::Open { .. } => Response::Err("container already open".to_string()),
        Request::GetOrCreateGroup {
            parent,
            name,
            title,
        } => Response::Node(backend.get_or_create_group(parent, &name, &title).await?),
        Request::FindChild { parent, name } => {
            Response::OptNode(backend.find_child(parent, &name).await?)
        }
        Request::Children { parent } => Response::Names(backend.children(parent).await?),
        Request::CreateArray {
            parent,
            name,
            data,
            attrs,
        } => Response::Node(
            backend
                .create_array(parent, &name, data, decode_attrs(attrs)?)
                .await?,
        ),
        Request::CreateEArray {
            parent,
            name,
            row_shape,
            attrs,
        } => Response::Node(
            backend
                .create_earray(parent, &name, row_shape, decode_attrs(attrs)?)
                .await?,
        ),
        Request::Append { array, rows } => {
            backend.append(array, rows).await?;
            Response::Unit
        }
        Request::CreateVlArray {
            parent,
            name,
            attrs,
        } => Response::Node(
            backend
                .create_vlarray(parent, &name, decode_attrs(attrs)?)
                .await?,
        ),
        Request::AppendText { array, line } => {
            backend.append_text(array, &line).await?;
            Response::Unit
        }
        Request::WriteAt {
            array,
            index,
            values,
        } => {
            backend.write_at(array, &index, values).await?;
            Response::Unit
        }
        Request::Read { array } => Response::Data(backend.read(array).await?),
        Request::ReadText { array } => Response::Lines(backend.read_text(array).await?),
        Request::SetAttr { node, key, value } => {
            backend
                .set_attr(node, &key, serde_json::from_str(&value)?)
                .await?;
            Response::Unit
        }
        Request::GetAttr { node, key } => {
            let value = backend.get_attr(node, &key).await?;
            let text = match value {
                Some(v) => Some(serde_json::to_string(&v)?),
                None => None,
            };
            Response::OptText(text)
        }
        Request::AttrKeys { node } => Response::Names(backend.attr_keys(node).await?),
        Request::Flush => {
            backend.flush().await?;
            Response::Unit
        }
    })
}
