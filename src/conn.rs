use std::collections::{HashMap, HashSet};
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use crate::exop_impl::StartTLS;
use crate::ldap::Ldap;
use crate::messages::Request;
use crate::protocol::{
    alloc_msgid, ItemSender, LdapCodec, LdapOp, MiscCommand, PendingOp, ResultSender,
};
use crate::result::{LdapError, LdapResult, Result};
use crate::search::SearchItem;
use crate::RequestId;

use lber::structures::{Null, Tag};

use futures_util::future::TryFutureExt;
use futures_util::sink::SinkExt;
use native_tls::TlsConnector;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_native_tls::{TlsConnector as TokioTlsConnector, TlsStream};
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, Framed};
use url::Url;
use uuid::Uuid;

#[derive(Debug)]
enum ConnType {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
    /// Transitional state while the plaintext transport is being wrapped
    /// in TLS. Reads signal EOF, writes fail.
    Detached,
}

impl AsyncRead for ConnType {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_read(cx, buf),
            ConnType::Tls(tls) => Pin::new(tls).poll_read(cx, buf),
            ConnType::Detached => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for ConnType {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_write(cx, buf),
            ConnType::Tls(tls) => Pin::new(tls).poll_write(cx, buf),
            ConnType::Detached => {
                Poll::Ready(Err(io::Error::from(io::ErrorKind::NotConnected)))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_flush(cx),
            ConnType::Tls(tls) => Pin::new(tls).poll_flush(cx),
            ConnType::Detached => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_shutdown(cx),
            ConnType::Tls(tls) => Pin::new(tls).poll_shutdown(cx),
            ConnType::Detached => Poll::Ready(Ok(())),
        }
    }
}

/// Additional settings for an LDAP connection.
///
/// The structure is opaque for better extensibility. An instance with
/// default values is constructed by [`new()`](#method.new), and all
/// available settings can be replaced through a builder-like interface,
/// by calling the appropriate functions.
#[derive(Clone)]
pub struct LdapConnSettings {
    conn_timeout: Option<Duration>,
    op_timeout: Option<Duration>,
    connector: Option<TlsConnector>,
    starttls: bool,
    no_tls_verify: bool,
    strict_dn: bool,
}

impl Default for LdapConnSettings {
    fn default() -> LdapConnSettings {
        LdapConnSettings {
            conn_timeout: None,
            op_timeout: None,
            connector: None,
            starttls: false,
            no_tls_verify: false,
            strict_dn: true,
        }
    }
}

impl LdapConnSettings {
    /// Create an instance of the structure with default settings.
    pub fn new() -> LdapConnSettings {
        LdapConnSettings {
            ..Default::default()
        }
    }

    /// Set the connection timeout. If a connection to the server can't
    /// be established before the timeout expires, an error will be
    /// returned to the user. Defaults to `None`, meaning an infinite
    /// timeout.
    pub fn set_conn_timeout(mut self, timeout: Duration) -> Self {
        self.conn_timeout = Some(timeout);
        self
    }

    /// Set the default per-operation timeout, applied to every operation
    /// which doesn't override it with
    /// [`with_timeout()`](crate::Ldap::with_timeout). Defaults to `None`,
    /// meaning operations wait indefinitely.
    pub fn set_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    /// Set a custom TLS connector, which enables setting various options
    /// when establishing a secure connection. The default of `None` will
    /// use a connector with default settings.
    ///
    /// Supplying a connector forces a secure connection even for an
    /// __ldap__ URL.
    pub fn set_connector(mut self, connector: TlsConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// If `true`, use the StartTLS extended operation to establish a
    /// secure connection. Defaults to `false`.
    pub fn set_starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    /// The `starttls` settings indicates whether the StartTLS extended
    /// operation will be used to establish a secure connection.
    pub fn starttls(&self) -> bool {
        self.starttls
    }

    /// If `true`, try to establish a TLS connection without certificate
    /// verification. Defaults to `false`.
    pub fn set_no_tls_verify(mut self, no_tls_verify: bool) -> Self {
        self.no_tls_verify = no_tls_verify;
        self
    }

    /// If `true` (the default), DN arguments of operations are run
    /// through the strict DN parser before any request is sent. Disable
    /// to pass caller-assembled DNs through verbatim.
    pub fn set_strict_dn(mut self, strict_dn: bool) -> Self {
        self.strict_dn = strict_dn;
        self
    }
}

enum LoopMode {
    SingleOp,
    Continuous,
}

/// An entry of the pending-request table.
///
/// At most one entry exists per message ID; an entry never outlives the
/// socket identified by `socket_id`.
struct Pending {
    tx: ResultSender,
    op_name: &'static str,
    socket_id: Uuid,
}

#[allow(clippy::needless_doctest_main)]
/// Asynchronous connection to an LDAP server. __*__
///
/// Opening a connection with [`new()`](#method.new) will return a tuple
/// consisting of the connection itself and an [`Ldap`](struct.Ldap.html) handle for
/// performing the LDAP operations. The connection must be spawned on the active
/// Tokio executor before using the handle. A convenience macro, [`drive!`](macro.drive.html), is
/// provided by the library. For the connection `conn`, it does the equivalent of:
///
/// ```rust,no_run
/// # use ldapmux::LdapConnAsync;
/// # use log::warn;
/// # #[tokio::main]
/// # async fn main() {
/// # let (conn, _ldap) = LdapConnAsync::new("ldap://localhost:2389").await.unwrap();
/// tokio::spawn(async move {
///     if let Err(e) = conn.drive().await {
///         warn!("LDAP connection error: {}", e);
///     }
/// });
/// # }
/// ```
///
/// If you need custom connection lifecycle handling, use the [`drive()`](#method.drive) method
/// on the connection inside your own `async` block.
///
/// The `Ldap` handle can be freely cloned, with each clone capable of launching a separate
/// LDAP operation multiplexed on the original connection.
pub struct LdapConnAsync {
    msgmap: Arc<Mutex<(RequestId, HashSet<RequestId>)>>,
    resultmap: HashMap<RequestId, Pending>,
    searchmap: HashMap<RequestId, (ItemSender, Uuid)>,
    rx: mpsc::UnboundedReceiver<PendingOp>,
    id_scrub_rx: mpsc::UnboundedReceiver<RequestId>,
    misc_rx: mpsc::UnboundedReceiver<MiscCommand>,
    stream: Framed<ConnType, LdapCodec>,
    socket_id: Uuid,
    hostname: String,
    no_tls_verify: bool,
}

/// Drive the connection until its completion. __*__
///
/// See the introduction of [LdapConnAsync](struct.LdapConnAsync.html) for the exact code produced by
/// the macro.
#[macro_export]
macro_rules! drive {
    ($conn:expr) => {
        $crate::tokio::spawn(async move {
            if let Err(e) = $conn.drive().await {
                $crate::log::warn!("LDAP connection error: {}", e);
            }
        });
    };
}

impl LdapConnAsync {
    /// Open a connection to an LDAP server specified by `url`, using
    /// `settings` to specify additional parameters.
    pub async fn with_settings(settings: LdapConnSettings, url: &str) -> Result<(Self, Ldap)> {
        let url = Url::parse(url)?;
        Self::from_url_with_settings(settings, &url).await
    }

    /// Open a connection to an LDAP server specified by `url`.
    ///
    /// The `url` is an LDAP URL with the __ldap__ or __ldaps__ scheme,
    /// selecting a plain TCP or a TLS connection with the default port of
    /// 389 or 636, respectively. The connection element in the returned
    /// tuple must be spawned on the current Tokio executor before using
    /// the `Ldap` element. See the introduction to this struct's
    /// documentation.
    pub async fn new(url: &str) -> Result<(Self, Ldap)> {
        Self::with_settings(LdapConnSettings::new(), url).await
    }

    /// Open a connection to an LDAP server specified by an already parsed `Url`, using
    /// `settings` to specify additional parameters.
    pub async fn from_url_with_settings(
        settings: LdapConnSettings,
        url: &Url,
    ) -> Result<(Self, Ldap)> {
        let mut settings = settings;
        let timeout = settings.conn_timeout.take();
        let conn_future = LdapConnAsync::new_tcp(url, settings);
        Ok(if let Some(timeout) = timeout {
            time::timeout(timeout, conn_future).await?
        } else {
            conn_future.await
        }?)
    }

    /// Open a connection to an LDAP server specified by an already parsed `Url`.
    pub async fn from_url(url: &Url) -> Result<(Self, Ldap)> {
        Self::from_url_with_settings(LdapConnSettings::new(), url).await
    }

    async fn new_tcp(url: &Url, mut settings: LdapConnSettings) -> Result<(Self, Ldap)> {
        let mut port = 389;
        let scheme = match url.scheme() {
            s @ "ldap" => {
                if settings.starttls() {
                    "starttls"
                } else if settings.connector.is_some() {
                    // explicit TLS options force a secure connection
                    "ldaps"
                } else {
                    s
                }
            }
            s @ "ldaps" => {
                settings = settings.set_starttls(false);
                port = 636;
                s
            }
            s => return Err(LdapError::UnknownScheme(String::from(s))),
        };
        if let Some(url_port) = url.port() {
            port = url_port;
        }
        let (hostname, host_port) = match url.host_str() {
            Some("") | None => (String::from("localhost"), format!("localhost:{}", port)),
            Some(h) => (String::from(h), format!("{}:{}", h, port)),
        };
        let stream = TcpStream::connect(host_port.as_str()).await?;
        let (mut conn, mut ldap) = Self::conn_pair(ConnType::Tcp(stream), hostname, &settings);
        match scheme {
            "ldap" => (),
            "ldaps" => {
                let parts = conn.stream.into_parts();
                let tls_stream = if let ConnType::Tcp(stream) = parts.io {
                    Self::create_tls_stream(&settings, &conn.hostname, stream).await?
                } else {
                    panic!("underlying stream not TCP");
                };
                conn.stream = parts.codec.framed(ConnType::Tls(tls_stream));
            }
            "starttls" => {
                let (tls_tx, tls_rx) = oneshot::channel();
                ldap.misc_tx.send(MiscCommand::StartTls {
                    connector: settings.connector.take().map(Box::new),
                    tx: tls_tx,
                })?;
                let (tx, rx) = oneshot::channel();
                tokio::spawn(async move {
                    conn.single_op(tx).await;
                });
                let res = tokio::try_join!(
                    rx.map_err(LdapError::from),
                    tls_rx.map_err(LdapError::from)
                );
                match res {
                    Ok((conn_res, tls_res)) => {
                        conn = conn_res?;
                        tls_res?;
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => unimplemented!(),
        }
        Ok((conn, ldap))
    }

    async fn create_tls_stream(
        settings: &LdapConnSettings,
        hostname: &str,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>> {
        let connector = match settings.connector.clone() {
            Some(connector) => connector,
            None => Self::create_connector(settings.no_tls_verify)?,
        };
        TokioTlsConnector::from(connector)
            .connect(hostname, stream)
            .await
            .map_err(LdapError::from)
    }

    fn create_connector(no_tls_verify: bool) -> Result<TlsConnector> {
        let mut builder = TlsConnector::builder();
        if no_tls_verify {
            builder.danger_accept_invalid_certs(true);
        }
        Ok(builder.build()?)
    }

    fn conn_pair(
        ctype: ConnType,
        hostname: String,
        settings: &LdapConnSettings,
    ) -> (Self, Ldap) {
        let codec = LdapCodec;
        let (tx, rx) = mpsc::unbounded_channel();
        let (id_scrub_tx, id_scrub_rx) = mpsc::unbounded_channel();
        let (misc_tx, misc_rx) = mpsc::unbounded_channel();
        let conn = LdapConnAsync {
            // the counter is pre-incremented, so the first ID in use is 2
            msgmap: Arc::new(Mutex::new((1, HashSet::new()))),
            resultmap: HashMap::new(),
            searchmap: HashMap::new(),
            rx,
            id_scrub_rx,
            misc_rx,
            stream: codec.framed(ctype),
            socket_id: Uuid::new_v4(),
            hostname,
            no_tls_verify: settings.no_tls_verify,
        };
        let ldap = Ldap {
            msgmap: conn.msgmap.clone(),
            tx,
            id_scrub_tx,
            misc_tx,
            last_id: 0,
            timeout: None,
            default_timeout: settings.op_timeout,
            controls: None,
            search_opts: None,
            strict_dn: settings.strict_dn,
        };
        (conn, ldap)
    }

    /// Repeatedly poll the connection until it exits.
    pub async fn drive(self) -> Result<()> {
        self.turn(LoopMode::Continuous).await.map(|_| ())
    }

    pub(crate) async fn single_op(self, tx: oneshot::Sender<Result<Self>>) {
        if tx.send(self.turn(LoopMode::SingleOp).await).is_err() {
            warn!("single op send error");
        }
    }

    async fn turn(mut self, mode: LoopMode) -> Result<Self> {
        loop {
            tokio::select! {
                req_id = self.id_scrub_rx.recv() => {
                    if let Some(req_id) = req_id {
                        self.resultmap.remove(&req_id);
                        self.searchmap.remove(&req_id);
                        let mut msgmap = self.msgmap.lock().expect("msgmap mutex (id_scrub)");
                        msgmap.1.remove(&req_id);
                    }
                },
                op = self.rx.recv() => {
                    if let Some(op) = op {
                        self.process_op(op).await?;
                    } else {
                        break;
                    }
                },
                misc = self.misc_rx.recv() => {
                    if let Some(cmd) = misc {
                        match cmd {
                            MiscCommand::EndSocket => {
                                if let Err(e) = self.stream.get_mut().shutdown().await {
                                    warn!("socket shutdown error: {}", e);
                                }
                            },
                            MiscCommand::StartTls { connector, tx } => {
                                let res = self.upgrade_tls(connector).await;
                                if tx.send(res).is_err() {
                                    warn!("starttls result send error");
                                }
                            },
                        }
                    } else {
                        break;
                    }
                },
                resp = self.stream.next() => {
                    match resp {
                        None => {
                            self.drain_pending();
                            break;
                        },
                        Some(Err(e)) => {
                            warn!("socket receive error: {}", e);
                            self.drain_pending();
                            return Err(LdapError::from(e));
                        },
                        Some(Ok((id, (tag, controls)))) => self.dispatch_incoming(id, tag, controls),
                    }
                },
            };
            if let LoopMode::SingleOp = mode {
                break;
            }
        }
        Ok(self)
    }

    async fn process_op(&mut self, op: PendingOp) -> Result<()> {
        let PendingOp {
            id,
            op,
            tag,
            controls,
            tx,
            op_name,
        } = op;
        if let LdapOp::Search(ref search_tx) = op {
            self.searchmap.insert(id, (search_tx.clone(), self.socket_id));
        }
        if let Err(e) = self.stream.send((id, tag, controls)).await {
            warn!("socket send error: {}", e);
            let _ = tx.send(Err(LdapError::ConnectionClosed { op: op_name }));
            self.searchmap.remove(&id);
            self.drain_pending();
            return Err(LdapError::from(e));
        }
        match op {
            LdapOp::Single => {
                self.resultmap.insert(
                    id,
                    Pending {
                        tx,
                        op_name,
                        socket_id: self.socket_id,
                    },
                );
                return Ok(());
            }
            LdapOp::Search(_) => (),
            LdapOp::Abandon(msgid) => {
                // no response follows for the abandoned op or the abandon itself
                self.resultmap.remove(&msgid);
                self.searchmap.remove(&msgid);
                let mut msgmap = self.msgmap.lock().expect("msgmap mutex (abandon)");
                msgmap.1.remove(&id);
            }
            LdapOp::Unbind => {
                // the close below is the expected acknowledgement
                if let Err(e) = self.stream.get_mut().shutdown().await {
                    warn!("socket shutdown error: {}", e);
                }
                if let Err(e) = self.stream.close().await {
                    warn!("socket close error: {}", e);
                }
            }
        }
        if tx
            .send(Ok((Tag::Null(Null {
                ..Default::default()
            }), vec![])))
            .is_err()
        {
            warn!("ldap null result send error");
        }
        Ok(())
    }

    fn dispatch_incoming(&mut self, id: RequestId, tag: Tag, controls: Vec<crate::controls::Control>) {
        if let Some((tx, _)) = self.searchmap.get(&id) {
            let protoop = if let Tag::StructureTag(protoop) = tag {
                protoop
            } else {
                warn!("unmatched tag structure for id {}", id);
                return;
            };
            let (item, mut remove) = match protoop.id {
                4 | 25 => (SearchItem::Entry(protoop), false),
                5 => (SearchItem::Done(Tag::StructureTag(protoop).into()), true),
                19 => (SearchItem::Referral(protoop), false),
                other => {
                    warn!("unrecognized protocol op {} for search {}", other, id);
                    self.searchmap.remove(&id);
                    return;
                }
            };
            if tx.send((item, controls)).is_err() {
                warn!("ldap search item send error, op={}", id);
                remove = true;
            }
            if remove {
                self.searchmap.remove(&id);
                let mut msgmap = self.msgmap.lock().expect("msgmap mutex (search done)");
                msgmap.1.remove(&id);
            }
        } else if let Some(pending) = self.resultmap.remove(&id) {
            if pending.tx.send(Ok((tag, controls))).is_err() {
                warn!("ldap result send error, op={}", id);
            }
            let mut msgmap = self.msgmap.lock().expect("msgmap mutex (stream rx)");
            msgmap.1.remove(&id);
        } else {
            warn!("unmatched id: {}", id);
        }
    }

    /// Reject every pending request owned by the closing socket and drop
    /// the search channels, releasing their message IDs. After this, the
    /// table holds no entry with the closed socket's id.
    fn drain_pending(&mut self) {
        let socket_id = self.socket_id;
        let mut scrubbed = Vec::new();
        let stale = self
            .resultmap
            .iter()
            .filter(|(_, pending)| pending.socket_id == socket_id)
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();
        for id in stale {
            if let Some(pending) = self.resultmap.remove(&id) {
                let _ = pending.tx.send(Err(LdapError::ConnectionClosed {
                    op: pending.op_name,
                }));
                scrubbed.push(id);
            }
        }
        let stale = self
            .searchmap
            .iter()
            .filter(|(_, (_, sid))| *sid == socket_id)
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();
        for id in stale {
            self.searchmap.remove(&id);
            scrubbed.push(id);
        }
        let mut msgmap = self.msgmap.lock().expect("msgmap mutex (drain)");
        for id in scrubbed {
            msgmap.1.remove(&id);
        }
    }

    /// Perform the StartTLS exchange and splice the transport.
    ///
    /// The exop is written on a fresh message ID; unrelated incoming
    /// messages keep being dispatched while its response is awaited. On
    /// success the framed transport is rebuilt around the TLS stream with
    /// the same codec and socket id, so pending requests survive the
    /// splice. A handshake failure leaves the transport detached, which
    /// drains the connection on the next turn of the loop.
    async fn upgrade_tls(&mut self, connector: Option<Box<TlsConnector>>) -> Result<()> {
        if !matches!(self.stream.get_ref(), ConnType::Tcp(_)) {
            return Err(LdapError::AlreadyTls);
        }
        let id = alloc_msgid(&self.msgmap);
        let req = Request::Extended(StartTLS.into());
        self.stream.send((id, req.into_tag(), None)).await?;
        loop {
            match self.stream.next().await {
                None => {
                    self.drain_pending();
                    return Err(LdapError::ConnectionClosed {
                        op: "ExtendedRequest",
                    });
                }
                Some(Err(e)) => {
                    self.drain_pending();
                    return Err(LdapError::from(e));
                }
                Some(Ok((rid, (tag, controls)))) => {
                    if rid == id {
                        {
                            let mut msgmap = self.msgmap.lock().expect("msgmap mutex (starttls)");
                            msgmap.1.remove(&id);
                        }
                        LdapResult::from(tag).success()?;
                        break;
                    }
                    self.dispatch_incoming(rid, tag, controls);
                }
            }
        }
        let parts =
            mem::replace(&mut self.stream, LdapCodec.framed(ConnType::Detached)).into_parts();
        let stream = match parts.io {
            ConnType::Tcp(stream) => stream,
            _ => return Err(LdapError::AlreadyTls),
        };
        let connector = match connector {
            Some(connector) => *connector,
            None => Self::create_connector(self.no_tls_verify)?,
        };
        let tls_stream = match TokioTlsConnector::from(connector)
            .connect(&self.hostname, stream)
            .await
        {
            Ok(tls_stream) => tls_stream,
            Err(e) => {
                self.drain_pending();
                return Err(LdapError::from(e));
            }
        };
        self.stream = parts.codec.framed(ConnType::Tls(tls_stream));
        Ok(())
    }
}
