//! MeshLink: a self-organizing, authenticated, end-to-end-encrypted
//! peer mesh library.
//!
//! A [`MeshLink`] handle owns one mesh participant: its graph of known
//! peers, its transport connections, and the single reactor thread
//! that drives all of them. No process-global state exists -- every
//! operation is threaded explicitly through the handle.

pub mod callbacks;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod graph;
pub mod invite;
pub mod meta;
pub mod reactor;
pub mod routing;
pub mod transport;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex as StateLock;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};

use callbacks::{Callbacks, LogLevel};
use channel::{Channel, ChannelId, Shutdown as ChannelShutdown};
use config::host::HostRecord;
use config::{ConfigStore, MainConfig};
use crypto::sptps::Session;
use crypto::{KeyPair, PublicKey, Signature};
use error::*;
use graph::node::{DeviceClass, MtuState};
use graph::{Edge, Graph, NodeName, NodeStatus};
use meta::connection::{Connection, ConnectionState};
use meta::flood::broadcast_except;
use meta::wire;
use meta::{Line, RequestId};
use reactor::{Reactor, ReactorHandle};

/// Application identifier recorded alongside the self node; carried
/// only for the embedding application's own bookkeeping.
pub type AppId = String;

/// Interval between ping sweeps of active connections, and the
/// deadline `stop()` waits for a graceful drain.
pub const PINGTIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Shared state guarded by the external-entry-point mutex.
struct Inner {
    store: ConfigStore,
    keypair: KeyPair,
    graph: Graph,
    device_class: DeviceClass,
    connections: HashMap<NodeName, Connection>,
    channels: HashMap<ChannelId, Channel>,
    callbacks: Callbacks,
    port: u16,
    next_local_channel_port: u16,
    /// Addresses the application has told us this node is reachable at;
    /// seeded into every `export()`/`invite()` host blob and into the
    /// self entry of an invitation's peer list.
    local_addresses: Vec<SocketAddr>,
    /// Wakes a per-connection write task once new outbound work
    /// (a queued line or a UDP-bound datagram) is enqueued for that
    /// peer; `enqueue_line`/`TxQueue::push` alone don't wake a task
    /// blocked in `tokio::select!` on the socket read.
    write_notify: HashMap<NodeName, Arc<Notify>>,
    udp_tx: routing::TxQueue,
    next_udp_seq: u32,
    /// The remote socket address observed on each peer's live
    /// meta-connection, as seen by the local kernel -- this is what a
    /// `REQ_EXTERNAL` response reports back, since it reflects whatever
    /// NAT the peer is actually behind rather than what the peer
    /// believes its own address is.
    observed_addrs: HashMap<NodeName, SocketAddr>,
}

impl Inner {
    /// Applies one parsed meta-protocol line received from `from`
    ///. May mutate the graph and queue lines for
    /// reflooding on other active connections.
    fn dispatch(&mut self, from: &NodeName, line: Line) -> Result<()> {
        match line.id {
            RequestId::Ping => self.send_line_to(from, Line::new(RequestId::Pong, vec![])),
            RequestId::Pong => Ok(()),
            RequestId::Ack => Ok(()),
            RequestId::TermReq => {
                if let Some(conn) = self.connections.get_mut(from) {
                    conn.begin_draining();
                }
                Ok(())
            }
            RequestId::AddEdge => self.handle_add_edge(from, line),
            RequestId::DelEdge => self.handle_del_edge(from, line),
            RequestId::AddSubnet => self.handle_add_subnet(from, line),
            RequestId::DelSubnet => self.handle_del_subnet(from, line),
            RequestId::ReqPubkey => self.handle_req_pubkey(from),
            RequestId::AnsPubkey => self.handle_ans_pubkey(from, line),
            RequestId::ReqExternal => self.handle_req_external(from),
            RequestId::AnsExternal => self.handle_ans_external(from, line),
            RequestId::ReqKey | RequestId::AnsKey | RequestId::KeyChanged => {
                // Key distribution rides the already-authenticated SPTPS
                // session for this peer; nothing further to verify here.
                Ok(())
            }
            RequestId::Id => self.handle_id_confirmed(from, line),
        }
    }

    /// The authenticated `ID` line sent once a session is established,
    /// confirming the name claimed during the cleartext bootstrap
    /// actually belongs to whoever is on the other end of the SPTPS
    /// session. Announces the local half of the new edge; the peer
    /// announces the reverse half symmetrically on its own side when it
    /// processes this same line, so the edge goes active once both
    /// floods have propagated.
    fn handle_id_confirmed(&mut self, from: &NodeName, line: Line) -> Result<()> {
        let claimed = line.args.first().ok_or_else(|| Error::simple(ErrorKind::Protocol))?;
        if claimed != from.as_str() {
            return Err("ID line name does not match the connection's authenticated peer").wrapped(ErrorKind::Auth);
        }
        self.dump_state_to(from)?;
        let self_name = self.graph.self_name().clone();
        let edge = Edge::new(self_name.clone(), self_name, from.clone(), 1, None, 0, next_edge_serial());
        let line = edge_to_line(&edge);
        self.graph.add_edge(edge)?;
        self.fire_reachability_transitions();
        broadcast_except(self.connections.iter_mut(), None, &line);
        Ok(())
    }

    fn send_line_to(&mut self, to: &NodeName, line: Line) -> Result<()> {
        if let Some(conn) = self.connections.get_mut(to) {
            conn.enqueue_line(&line)?;
        }
        Ok(())
    }

    fn handle_add_edge(&mut self, from: &NodeName, line: Line) -> Result<()> {
        let edge = parse_edge_args(&line.args)?;
        let application = self.graph.add_edge(edge.clone())?;
        self.fire_reachability_transitions();
        if application == graph::EdgeApplication::Fresh {
            broadcast_except(self.connections.iter_mut(), Some(from), &line);
        }
        Ok(())
    }

    fn handle_del_edge(&mut self, from: &NodeName, line: Line) -> Result<()> {
        if line.args.len() < 2 {
            return Err("DEL_EDGE requires from/to arguments").wrapped(ErrorKind::Protocol);
        }
        let edge_from = NodeName::new(&line.args[0])?;
        let edge_to = NodeName::new(&line.args[1])?;
        let removed = self.graph.del_edge(&edge_from, &edge_to)?;
        self.fire_reachability_transitions();
        if removed {
            broadcast_except(self.connections.iter_mut(), Some(from), &line);
        }
        Ok(())
    }

    fn handle_add_subnet(&mut self, from: &NodeName, line: Line) -> Result<()> {
        if line.args.len() < 3 {
            return Err("ADD_SUBNET requires owner/prefix/len arguments").wrapped(ErrorKind::Protocol);
        }
        let owner = NodeName::new(&line.args[0])?;
        let addr = line.args[1].parse().wrapped(ErrorKind::Protocol)?;
        let len: u8 = line.args[2].parse().wrapped(ErrorKind::Protocol)?;
        let serial: u64 = line.args.get(3).map(|s| s.parse()).transpose().wrapped(ErrorKind::Protocol)?.unwrap_or(0);
        let applied = self.graph.subnets_mut().announce(graph::subnet::Subnet {
            owner,
            prefix: graph::subnet::Prefix::new(addr, len),
            serial,
        });
        if applied {
            broadcast_except(self.connections.iter_mut(), Some(from), &line);
        }
        Ok(())
    }

    fn handle_del_subnet(&mut self, from: &NodeName, line: Line) -> Result<()> {
        if line.args.len() < 3 {
            return Err("DEL_SUBNET requires owner/prefix/len arguments").wrapped(ErrorKind::Protocol);
        }
        let owner = NodeName::new(&line.args[0])?;
        let addr = line.args[1].parse().wrapped(ErrorKind::Protocol)?;
        let len: u8 = line.args[2].parse().wrapped(ErrorKind::Protocol)?;
        self.graph.subnets_mut().withdraw(&owner, &graph::subnet::Prefix::new(addr, len));
        broadcast_except(self.connections.iter_mut(), Some(from), &line);
        Ok(())
    }

    fn handle_req_pubkey(&mut self, from: &NodeName) -> Result<()> {
        let pubkey = self.keypair.public_key();
        let line = Line::new(RequestId::AnsPubkey, vec![self.graph.self_name().to_string(), Line::encode_binary(pubkey.as_bytes())]);
        self.send_line_to(from, line)
    }

    fn handle_ans_pubkey(&mut self, _from: &NodeName, line: Line) -> Result<()> {
        if line.args.len() < 2 {
            return Err("ANS_PUBKEY requires name/key arguments").wrapped(ErrorKind::Protocol);
        }
        let name = NodeName::new(&line.args[0])?;
        let bytes = Line::decode_binary(&line.args[1])?;
        let pubkey = PublicKey::from_bytes(&bytes)?;
        self.graph.ensure_node(&name).pubkey = Some(pubkey);
        Ok(())
    }

    /// Only `BACKBONE`/`STATIONARY` nodes originate this; a `PORTABLE`
    /// peer's request is honoured anyway since the responder doesn't
    /// police the requester's own class.
    fn handle_req_external(&mut self, from: &NodeName) -> Result<()> {
        let addr = self.connections.get(from).and_then(|_| self.observed_remote_addr(from));
        if let Some(addr) = addr {
            let line = Line::new(RequestId::AnsExternal, vec![addr.to_string()]);
            self.send_line_to(from, line)?;
        }
        Ok(())
    }

    fn handle_ans_external(&mut self, from: &NodeName, line: Line) -> Result<()> {
        let addr: SocketAddr = line.args.first().ok_or(Error::simple(ErrorKind::Protocol))?.parse().wrapped(ErrorKind::Protocol)?;
        if let Some(node) = self.graph.node_mut(from) {
            node.external_address = Some(addr);
        }
        Ok(())
    }

    fn observed_remote_addr(&self, from: &NodeName) -> Option<SocketAddr> {
        self.observed_addrs.get(from).copied()
    }

    fn fire_reachability_transitions(&mut self) {
        for (name, status) in self.graph.recompute_reachability().unwrap_or_default() {
            if let Some(cb) = &mut self.callbacks.node_status {
                cb(&name, status);
            }
        }
    }

    /// On entering `ACTIVE`, dump edges, then subnets, then public
    /// keys, so the new peer's view of the mesh converges without
    /// waiting for the next unrelated flood.
    fn dump_state_to(&mut self, peer: &NodeName) -> Result<()> {
        for edge in self.graph.edges().cloned().collect::<Vec<_>>() {
            let line = edge_to_line(&edge);
            self.send_line_to(peer, line)?;
        }
        for subnet in self.graph.subnets().iter().cloned().collect::<Vec<_>>() {
            let line = Line::new(
                RequestId::AddSubnet,
                vec![subnet.owner.to_string(), subnet.prefix.addr.to_string(), subnet.prefix.len.to_string(), subnet.serial.to_string()],
            );
            self.send_line_to(peer, line)?;
        }
        let pubkeys: Vec<(NodeName, PublicKey)> = self
            .graph
            .nodes()
            .filter_map(|node| node.pubkey.clone().map(|pk| (node.name.clone(), pk)))
            .collect();
        for (name, pubkey) in pubkeys {
            let line = Line::new(RequestId::AnsPubkey, vec![name.to_string(), Line::encode_binary(pubkey.as_bytes())]);
            self.send_line_to(peer, line)?;
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Edge serials only need to move forward across reconnects of the same
/// pair; wall-clock seconds are coarse but sufficient since a
/// same-second re-announcement of an unchanged edge is a harmless
/// `Duplicate`, not a `Stale` that would be dropped.
fn next_edge_serial() -> u64 {
    unix_now()
}

fn parse_edge_args(args: &[String]) -> Result<Edge> {
    if args.len() < 5 {
        return Err("ADD_EDGE requires owner/from/to/weight/options arguments").wrapped(ErrorKind::Protocol);
    }
    let owner = NodeName::new(&args[0])?;
    let from = NodeName::new(&args[1])?;
    let to = NodeName::new(&args[2])?;
    let weight: u32 = args[3].parse().wrapped(ErrorKind::Protocol)?;
    let options: u32 = args[4].parse().wrapped(ErrorKind::Protocol)?;
    let serial: u64 = args.get(5).map(|s| s.parse()).transpose().wrapped(ErrorKind::Protocol)?.unwrap_or(0);
    Ok(Edge::new(owner, from, to, weight, None, options, serial))
}

fn resolve_one(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", host, port)
        .to_socket_addrs()
        .wrapped(ErrorKind::Network)?
        .next()
        .ok_or_else(|| Error::simple(ErrorKind::Network))
}

fn edge_to_line(edge: &Edge) -> Line {
    Line::new(
        RequestId::AddEdge,
        vec![
            edge.owner.to_string(),
            edge.from.to_string(),
            edge.to.to_string(),
            edge.weight.to_string(),
            edge.options.to_string(),
            edge.serial.to_string(),
        ],
    )
}

/// A handle to one mesh participant.
///
/// Cloning a `MeshLink` is not supported; instead `Arc` it if several
/// owners need the same handle. Multiple independent `MeshLink`
/// handles may coexist in one process.
impl std::fmt::Debug for MeshLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshLink").finish_non_exhaustive()
    }
}

pub struct MeshLink {
    inner: StateLock<Inner>,
    reactor_handle: Mutex<Option<ReactorHandle>>,
    reactor_thread: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    running: AtomicBool,
    port: AtomicU16,
    /// Set by `start()` from the `Arc` it was called on, so methods
    /// taking only `&self` (like `join`) can still spawn reactor work
    /// tied to this handle's lifetime instead of a borrow's.
    self_weak: Mutex<Option<std::sync::Weak<MeshLink>>>,
}

impl MeshLink {
    /// `open(confbase, name, appid, class)`: opens or
    /// initialises the confbase, generating a long-term key and self
    /// node on first use. Fails with `ErrorKind::Busy` if another
    /// instance already holds the directory lock, or `ErrorKind::Auth`
    /// if `name` doesn't match the stored identity.
    pub fn open(confbase: impl AsRef<Path>, name: &str, _appid: &AppId, class: DeviceClass) -> Result<Self> {
        let store = ConfigStore::open(confbase.as_ref())?;
        let keypair = KeyPair::load_or_generate(&store.key_path_for_load())?;
        let node_name = NodeName::new(name)?;

        let existing = store.load_main_config()?;
        let port = match &existing {
            Some(cfg) => {
                if cfg.name != node_name {
                    return Err("confbase identity does not match requested name").wrapped(ErrorKind::Auth);
                }
                cfg.port
            }
            None => 0,
        };

        let main_config = MainConfig { name: node_name.clone(), port, device_class: class, options: 0 };
        store.save_main_config(&main_config)?;

        let graph = Graph::new(node_name);

        let inner = Inner {
            store,
            keypair,
            graph,
            device_class: class,
            connections: HashMap::new(),
            channels: HashMap::new(),
            callbacks: Callbacks::new(),
            port,
            next_local_channel_port: 1024,
            local_addresses: Vec::new(),
            write_notify: HashMap::new(),
            udp_tx: routing::TxQueue::new(),
            next_udp_seq: 0,
            observed_addrs: HashMap::new(),
        };

        Ok(MeshLink {
            inner: StateLock::new(inner),
            reactor_handle: Mutex::new(None),
            reactor_thread: Mutex::new(None),
            stop_tx: Mutex::new(None),
            running: AtomicBool::new(false),
            port: AtomicU16::new(port),
            self_weak: Mutex::new(None),
        })
    }

    pub fn set_receive_cb(&self, cb: impl FnMut(&NodeName, &[u8]) + Send + 'static) {
        self.inner.lock().callbacks.receive = Some(Box::new(cb));
    }

    pub fn set_node_status_cb(&self, cb: impl FnMut(&NodeName, NodeStatus) + Send + 'static) {
        self.inner.lock().callbacks.node_status = Some(Box::new(cb));
    }

    pub fn set_log_cb(&self, cb: impl FnMut(LogLevel, &str) + Send + 'static) {
        self.inner.lock().callbacks.log = Some(Box::new(cb));
    }

    pub fn set_channel_accept_cb(&self, cb: impl FnMut(&NodeName, ChannelId) -> bool + Send + 'static) {
        self.inner.lock().callbacks.channel_accept = Some(Box::new(cb));
    }

    pub fn set_channel_receive_cb(&self, cb: impl FnMut(ChannelId, &[u8]) + Send + 'static) {
        self.inner.lock().callbacks.channel_receive = Some(Box::new(cb));
    }

    /// `add_address(addr)`: records an address the application knows
    /// this node to be reachable at, included in future
    /// `export()`/`invite()` host blobs.
    pub fn add_address(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock();
        if !inner.local_addresses.contains(&addr) {
            inner.local_addresses.push(addr);
        }
    }

    /// `set_canonical_address(hostname)`: a human-memorable name for
    /// this node, carried in its own host record and handed to peers
    /// during invite and export/import so they have something to dial
    /// that survives the current address list changing.
    pub fn set_canonical_address(&self, hostname: &str) {
        let mut inner = self.inner.lock();
        let self_name = inner.graph.self_name().clone();
        inner.graph.ensure_node(&self_name).canonical_hostname = Some(hostname.to_string());
    }

    /// Signs an application-chosen message under this node's long-term
    /// identity key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.inner.lock().keypair.sign(message).as_bytes().to_vec()
    }

    /// Verifies a signature produced by `peer`'s `sign()`, using
    /// `peer`'s public key as already known to the local graph.
    pub fn verify(&self, peer: &str, message: &[u8], signature: &[u8]) -> Result<()> {
        let peer_name = NodeName::new(peer)?;
        let inner = self.inner.lock();
        let pubkey = inner
            .graph
            .node(&peer_name)
            .and_then(|n| n.pubkey.clone())
            .ok_or_else(|| Error::simple(ErrorKind::NoEnt))?;
        pubkey.verify(message, &Signature::from_bytes(signature))
    }

    /// `start()`: spawns the single reactor thread,
    /// which binds the listening sockets and begins driving I/O.
    /// Idempotent: a second call while already running is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        *self.self_weak.lock().unwrap() = Some(Arc::downgrade(self));

        let requested_port = self.inner.lock().port;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (bound_tx, bound_rx) = std::sync::mpsc::channel();

        let this = Arc::clone(self);
        let thread = std::thread::Builder::new()
            .name("meshlink-reactor".into())
            .spawn(move || {
                if let Err(e) = run_reactor(this, requested_port, stop_rx, bound_tx) {
                    tracing::error!(error = %e, "meshlink reactor terminated with an error");
                }
            })
            .wrapped(ErrorKind::NoMem)?;

        match bound_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                // The reactor thread died before reporting a bind
                // result; `run_reactor`'s early `?`s already logged why.
                self.running.store(false, Ordering::SeqCst);
                let _ = thread.join();
                return Err("reactor thread exited before binding").wrapped(ErrorKind::Network);
            }
        }

        *self.stop_tx.lock().unwrap() = Some(stop_tx);
        *self.reactor_thread.lock().unwrap() = Some(thread);
        Ok(())
    }

    /// `stop()`: sets the shutdown flag and joins the
    /// reactor thread, which itself sends `TERMREQ` to every active
    /// peer and waits up to `PINGTIMEOUT` for drain before force-closing.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        if let Some(thread) = self.reactor_thread.lock().unwrap().take() {
            let _ = thread.join();
        }
        *self.reactor_handle.lock().unwrap() = None;
        Ok(())
    }

    /// `get_port()`: the port actually bound; never 0
    /// once `start()` has completed.
    pub fn get_port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    /// `set_port(p)`: valid only while stopped; `p == 0`
    /// means let the OS assign one at the next `start()`.
    pub fn set_port(&self, port: u16) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err("set_port is only valid while stopped").wrapped(ErrorKind::Busy);
        }
        let mut inner = self.inner.lock();
        inner.port = port;
        let name = inner.graph.self_name().clone();
        let device_class = inner.device_class;
        inner.store.save_main_config(&MainConfig { name, port, device_class, options: 0 })?;
        self.port.store(port, Ordering::SeqCst);
        Ok(())
    }

    /// `send(dest, bytes)`: enqueues one datagram for
    /// routing; returns whether it was queued (may be `false` under
    /// back-pressure or if `dest` is unreachable).
    pub fn send(&self, dest: &str, bytes: &[u8]) -> Result<bool> {
        let dest_name = NodeName::new(dest)?;
        let mut inner = self.inner.lock();
        let route = match routing::route(&inner.graph, &dest_name) {
            Ok(route) => route,
            Err(_) => return Ok(false),
        };
        match route {
            routing::Encapsulation::Relay { next_hop } => {
                let line = Line::new(RequestId::Ack, vec![dest_name.to_string(), Line::encode_binary(bytes)]);
                match inner.send_line_to(&next_hop, line) {
                    Ok(()) => {
                        if let Some(n) = inner.write_notify.get(&next_hop) {
                            n.notify_one();
                        }
                        Ok(true)
                    }
                    Err(_) => Ok(false),
                }
            }
            routing::Encapsulation::DirectUdp { peer, .. } => {
                let payload = channel::wire::encode_datagram(bytes);
                Ok(inner.udp_tx.push(peer, payload).is_ok())
            }
        }
    }

    /// `invite(name)`.
    pub fn invite(&self, invitee_name: &str, host: &str) -> Result<String> {
        let inner = self.inner.lock();
        let port = self.get_port();
        invite::invite(&inner.store, &inner.keypair, host, port, invitee_name)
    }

    /// `join(url)`: valid only if this handle has no prior peers.
    /// Connects out over a throwaway runtime, presents the cookie,
    /// verifies the signed bundle against it, persists the inviter
    /// plus every peer the bundle introduced, and (if the mesh is
    /// running) queues a real meta-connection to the inviter on the
    /// reactor, since the inviter has no way to dial back.
    pub fn join(&self, url: &str) -> Result<()> {
        {
            let inner = self.inner.lock();
            invite::ensure_can_join(&inner.graph)?;
        }
        let (host, port, cookie) = config::invitation::parse_invitation_url(url)?;
        let addr = resolve_one(&host, port)?;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .wrapped(ErrorKind::NoMem)?;
        let bundle_text = rt.block_on(async {
            let mut stream = transport::connect_meta(addr).await?;
            wire::write_frame(&mut stream, format!("1 {}", cookie).as_bytes()).await?;
            let reply = wire::read_frame(&mut stream).await?;
            String::from_utf8(reply).wrapped(ErrorKind::Protocol)
        })?;

        let bundle = invite::InviteBundle::deserialize(&bundle_text)?;
        invite::verify_bundle(&bundle, &cookie)?;

        let mut inner = self.inner.lock();
        let self_name = inner.graph.self_name().clone();
        if bundle.assigned_name != self_name {
            return Err("invitation bundle assigned a different name than this node's identity").wrapped(ErrorKind::Auth);
        }

        let inviter_record = HostRecord { addresses: vec![addr], ..HostRecord::default() };
        inner.store.save_host(&bundle.inviter_name, &inviter_record)?;
        let inviter_node = inner.graph.ensure_node(&bundle.inviter_name);
        inviter_node.pubkey = Some(bundle.inviter_pubkey.clone());
        inviter_node.addresses = vec![addr];

        for (name, record) in &bundle.peer_list {
            if *name == self_name || *name == bundle.inviter_name {
                continue;
            }
            inner.store.save_host(name, record)?;
            let node = inner.graph.ensure_node(name);
            node.pubkey = record.ecdsa_public_key.clone();
            node.addresses = record.addresses.clone();
            node.canonical_hostname = record.canonical_address.clone();
            if let Some(class) = record.device_class {
                node.device_class = class;
            }
        }
        drop(inner);

        // The inviter has no way to learn of this node until it dials
        // in, since `handle_join_request` never adds the joiner to the
        // inviter's own graph -- so the joiner always initiates here,
        // independent of the name-ordering tie-break `spawn_outbound_dials`
        // otherwise uses to pick exactly one side of a known pair.
        let reactor = self.reactor_handle.lock().unwrap().clone();
        let self_arc = self.self_weak.lock().unwrap().as_ref().and_then(std::sync::Weak::upgrade);
        if let (Some(reactor), Some(handle)) = (reactor, self_arc) {
            let inviter_name = bundle.inviter_name.clone();
            let _ = reactor.queue_from_outside(move || {
                tokio::task::spawn_local(async move {
                    match transport::connect_meta(addr).await {
                        Ok(stream) => run_connection(handle, stream, ConnectionRole::Initiator).await,
                        Err(e) => tracing::debug!(peer = %inviter_name, %addr, error = %e, "failed to dial inviter after join"),
                    }
                });
            });
        }
        Ok(())
    }

    /// `export()`: serialises the self node's host blob.
    pub fn export(&self) -> Result<String> {
        let inner = self.inner.lock();
        let self_name = inner.graph.self_name().clone();
        let canonical_address = inner.graph.node(&self_name).and_then(|n| n.canonical_hostname.clone());
        let record = HostRecord {
            addresses: inner.local_addresses.clone(),
            subnets: Vec::new(),
            ecdsa_public_key: Some(inner.keypair.public_key()),
            canonical_address,
            device_class: Some(inner.device_class),
        };
        Ok(record.export(inner.graph.self_name().as_str()))
    }

    /// `import(blob)`: parses one host blob and merges it
    /// into the local `hosts/` store and graph.
    pub fn import(&self, blob: &str) -> Result<()> {
        let (name, record) = HostRecord::import(blob)?;
        let node_name = NodeName::new(&name)?;
        let mut inner = self.inner.lock();
        inner.store.save_host(&node_name, &record)?;
        let node = inner.graph.ensure_node(&node_name);
        node.pubkey = record.ecdsa_public_key.clone();
        node.canonical_hostname = record.canonical_address.clone();
        node.addresses = record.addresses.clone();
        if let Some(class) = record.device_class {
            node.device_class = class;
        }
        Ok(())
    }

    /// `blacklist(node)`: tears down connections, drops
    /// edges, and removes the node.
    pub fn blacklist(&self, node: &str) -> Result<()> {
        let node_name = NodeName::new(node)?;
        let mut inner = self.inner.lock();
        if let Some(mut conn) = inner.connections.remove(&node_name) {
            conn.close();
        }
        inner.write_notify.remove(&node_name);
        inner.observed_addrs.remove(&node_name);
        inner.graph.remove_node(&node_name)?;
        inner.fire_reachability_transitions();
        Ok(())
    }

    /// `wait_for_reachable(node, timeout)`: returns `false`
    /// on timeout without side effects.
    pub fn wait_for_reachable(&self, node: &str, timeout: Duration) -> bool {
        let Ok(node_name) = NodeName::new(node) else { return false };
        let deadline = Instant::now() + timeout;
        loop {
            {
                let inner = self.inner.lock();
                if let Some(n) = inner.graph.node(&node_name) {
                    if n.reachable {
                        return true;
                    }
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn channel_open(&self, peer: &str, remote_port: u16) -> Result<ChannelId> {
        let peer_name = NodeName::new(peer)?;
        let mut inner = self.inner.lock();
        let local_port = inner.next_local_channel_port;
        inner.next_local_channel_port = inner.next_local_channel_port.wrapping_add(1).max(1024);
        let id = ChannelId { local_port, remote_port };
        let mut channel = Channel::new(id, peer_name);
        channel.mark_open();
        inner.channels.insert(id, channel);
        Ok(id)
    }

    pub fn channel_close(&self, id: ChannelId) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(ch) = inner.channels.get_mut(&id) {
            ch.shutdown(ChannelShutdown::Both);
        }
        inner.channels.remove(&id);
        Ok(())
    }

    pub fn channel_send(&self, id: ChannelId, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let ch = inner.channels.get_mut(&id).ok_or(Error::simple(ErrorKind::NoEnt))?;
        ch.send(data)
    }

    pub fn channel_shutdown(&self, id: ChannelId, how: ChannelShutdown) -> Result<()> {
        let mut inner = self.inner.lock();
        let ch = inner.channels.get_mut(&id).ok_or(Error::simple(ErrorKind::NoEnt))?;
        ch.shutdown(how);
        Ok(())
    }

    /// Devtools/introspection: every edge currently known.
    pub fn edges(&self) -> Vec<Edge> {
        self.inner.lock().graph.edges().cloned().collect()
    }

    /// Devtools/introspection: names of peers with a live connection.
    pub fn connections(&self) -> Vec<NodeName> {
        self.inner.lock().connections.keys().cloned().collect()
    }

    /// Devtools/introspection: the external address this node last
    /// learned for `node`, if any.
    pub fn external_address_of(&self, node: &str) -> Option<SocketAddr> {
        let node_name = NodeName::new(node).ok()?;
        self.inner.lock().graph.node(&node_name)?.external_address
    }
}

/// How often known peers with no live connection get a fresh outbound
/// dial attempt.
const CONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// How often queued UDP datagrams and channel segments get sealed and
/// flushed to the wire.
const UDP_DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Binds the listening sockets and drives accept/read/write/timer work
/// until `stop_rx` observes `true`. Runs on its own
/// OS thread, one per handle, atop a single-threaded reactor.
fn run_reactor(
    handle: Arc<MeshLink>,
    requested_port: u16,
    mut stop_rx: watch::Receiver<bool>,
    bound_tx: std::sync::mpsc::Sender<Result<()>>,
) -> Result<()> {
    let mut reactor = match Reactor::new() {
        Ok(r) => r,
        Err(e) => {
            let _ = bound_tx.send(Err(Error::simple(e.kind())));
            return Err(e);
        }
    };
    *handle.reactor_handle.lock().unwrap() = Some(reactor.handle());

    let listeners = match reactor.block_on(transport::Listeners::bind(requested_port)) {
        Ok(l) => l,
        Err(e) => {
            let _ = bound_tx.send(Err(Error::simple(e.kind())));
            return Err(e);
        }
    };
    let bound_port = listeners.get_port();
    handle.port.store(bound_port, Ordering::SeqCst);
    {
        let mut inner = handle.inner.lock();
        inner.port = bound_port;
        let name = inner.graph.self_name().clone();
        let device_class = inner.device_class;
        if let Err(e) = inner.store.save_main_config(&MainConfig { name, port: bound_port, device_class, options: 0 }) {
            let _ = bound_tx.send(Err(Error::simple(e.kind())));
            return Err(e);
        }
    }
    let _ = bound_tx.send(Ok(()));

    reactor.block_on(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        let mut connect_interval = tokio::time::interval(CONNECT_INTERVAL);
        let mut udp_drain_interval = tokio::time::interval(UDP_DRAIN_INTERVAL);
        let mut udp_buf_v4 = vec![0u8; 65535];
        let mut udp_buf_v6 = vec![0u8; 65535];
        loop {
            tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        drain_on_stop(&handle).await;
                        break;
                    }
                }
                accepted = listeners.tcp_v4.accept() => {
                    if let Ok((stream, addr)) = accepted {
                        tracing::debug!(%addr, "accepted meta-connection (IPv4)");
                        tokio::task::spawn_local(accept_connection(Arc::clone(&handle), stream));
                    }
                }
                accepted = listeners.tcp_v6.accept() => {
                    if let Ok((stream, addr)) = accepted {
                        tracing::debug!(%addr, "accepted meta-connection (IPv6)");
                        tokio::task::spawn_local(accept_connection(Arc::clone(&handle), stream));
                    }
                }
                received = listeners.udp_v4.recv_from(&mut udp_buf_v4) => {
                    if let Ok((len, _from)) = received {
                        handle_udp_datagram(&handle, &udp_buf_v4[..len]);
                    }
                }
                received = listeners.udp_v6.recv_from(&mut udp_buf_v6) => {
                    if let Ok((len, _from)) = received {
                        handle_udp_datagram(&handle, &udp_buf_v6[..len]);
                    }
                }
                _ = ping_interval.tick() => {
                    send_pings(&handle);
                }
                _ = connect_interval.tick() => {
                    spawn_outbound_dials(&handle);
                }
                _ = udp_drain_interval.tick() => {
                    drain_udp_tx(&handle, &listeners).await;
                    drain_channel_segments(&handle, &listeners).await;
                }
            }
        }
    });

    Ok(())
}

fn send_pings(handle: &Arc<MeshLink>) {
    let mut inner = handle.inner.lock();
    let peers: Vec<NodeName> = inner
        .connections
        .iter()
        .filter(|(_, c)| c.state == ConnectionState::Active)
        .map(|(name, _)| name.clone())
        .collect();
    for peer in &peers {
        let _ = inner.send_line_to(peer, Line::new(RequestId::Ping, vec![]));
    }
    for peer in &peers {
        if let Some(n) = inner.write_notify.get(peer) {
            n.notify_one();
        }
    }
}

/// Sends `TERMREQ` to every active peer and waits up to `PINGTIMEOUT`
/// for their per-connection tasks to drain and remove themselves before
/// force-closing whatever is left.
async fn drain_on_stop(handle: &Arc<MeshLink>) {
    let (peers, notifies) = {
        let mut inner = handle.inner.lock();
        let peers: Vec<NodeName> = inner.connections.keys().cloned().collect();
        for peer in &peers {
            let _ = inner.send_line_to(peer, Line::new(RequestId::TermReq, vec![]));
        }
        for conn in inner.connections.values_mut() {
            conn.begin_draining();
        }
        let notifies: Vec<Arc<Notify>> = peers.iter().filter_map(|p| inner.write_notify.get(p).cloned()).collect();
        (peers, notifies)
    };
    for n in &notifies {
        n.notify_one();
    }

    let deadline = tokio::time::Instant::now() + PINGTIMEOUT;
    loop {
        {
            let inner = handle.inner.lock();
            if peers.iter().all(|p| !inner.connections.contains_key(p)) {
                break;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut inner = handle.inner.lock();
    for conn in inner.connections.values_mut() {
        conn.close();
    }
    inner.connections.clear();
    inner.write_notify.clear();
}

/// Which side of an accepted TCP stream this meta-connection task is
/// playing. The responder already knows the peer's claimed name from
/// the cleartext bootstrap frame that `accept_connection` dispatched on.
enum ConnectionRole {
    Initiator,
    Responder(NodeName),
}

/// Single entry point for an accepted stream, both address families.
/// One framed read disambiguates the two kinds of traffic that share
/// the listening port: a join-cookie presentation, or a peer's
/// bootstrap `ID` line ahead of the SPTPS handshake.
async fn accept_connection(handle: Arc<MeshLink>, mut stream: TcpStream) {
    let first = match wire::read_frame(&mut stream).await {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!(error = %e, "accept: failed to read bootstrap frame");
            return;
        }
    };
    let text = String::from_utf8_lossy(&first).into_owned();
    let mut parts = text.split_whitespace();
    match parts.next() {
        Some("1") => {
            if let Some(cookie) = parts.next() {
                handle_join_request(&handle, &mut stream, cookie).await;
            } else {
                tracing::debug!("accept: join request missing a cookie");
            }
        }
        Some("ID") => match parts.next().map(NodeName::new) {
            Some(Ok(peer_name)) => run_connection(handle, stream, ConnectionRole::Responder(peer_name)).await,
            _ => tracing::debug!("accept: malformed ID bootstrap line"),
        },
        _ => tracing::debug!("accept: unrecognised bootstrap line"),
    }
}

/// Looks up the presented cookie, builds the signed invite bundle, and
/// writes it back. Silently drops the connection on any failure: an
/// unauthenticated joiner gets no information about why a cookie was
/// refused.
async fn handle_join_request(handle: &Arc<MeshLink>, stream: &mut TcpStream, cookie: &str) {
    let bundle_text = {
        let inner = handle.inner.lock();
        let invitation = match inner.store.load_invitation(cookie) {
            Ok(Some(inv)) => inv,
            _ => return,
        };
        if invitation.is_expired_at(unix_now()) {
            let _ = inner.store.remove_invitation(cookie);
            return;
        }
        let Ok(assigned_name) = NodeName::new(invitation.invitee_name.clone()) else { return };
        let self_name = inner.graph.self_name().clone();
        let peer_list: Vec<(NodeName, HostRecord)> = inner
            .graph
            .nodes()
            .map(|n| {
                let (addresses, pubkey) = if n.name == self_name {
                    (inner.local_addresses.clone(), Some(inner.keypair.public_key()))
                } else {
                    (n.addresses.clone(), n.pubkey.clone())
                };
                let record = HostRecord {
                    addresses,
                    subnets: Vec::new(),
                    ecdsa_public_key: pubkey,
                    canonical_address: n.canonical_hostname.clone(),
                    device_class: Some(n.device_class),
                };
                (n.name.clone(), record)
            })
            .collect();
        let bundle = invite::build_bundle(self_name, &inner.keypair, cookie, assigned_name, peer_list);
        let _ = inner.store.remove_invitation(cookie);
        bundle.serialize()
    };
    let _ = wire::write_frame(stream, bundle_text.as_bytes()).await;
}

/// Drives one meta-connection from its post-bootstrap state (handshake
/// not yet started) through the handshake and into the steady-state
/// read/write loop, cleaning up the shared connection table on exit.
async fn run_connection(handle: Arc<MeshLink>, mut stream: TcpStream, role: ConnectionRole) {
    let peer_name = match establish_connection(&handle, &mut stream, role).await {
        Ok(name) => name,
        Err(e) => {
            tracing::debug!(error = %e, "meta-connection handshake failed");
            return;
        }
    };
    if let Err(e) = run_active_connection(&handle, &mut stream, &peer_name).await {
        tracing::debug!(peer = %peer_name, error = %e, "meta-connection closed");
    }
    let mut inner = handle.inner.lock();
    if let Some(mut conn) = inner.connections.remove(&peer_name) {
        conn.close();
    }
    inner.write_notify.remove(&peer_name);
    inner.observed_addrs.remove(&peer_name);
}

/// Completes the bootstrap/handshake legs of one meta-connection and
/// activates it. The initiator sends its own `ID` first and waits for
/// the peer's in reply; the responder already has the peer's claimed
/// name from the frame `accept_connection` dispatched on, but still
/// sends its own `ID` back so the connection is symmetric.
async fn establish_connection(handle: &Arc<MeshLink>, stream: &mut TcpStream, role: ConnectionRole) -> Result<NodeName> {
    let (self_name, self_key) = {
        let inner = handle.inner.lock();
        (inner.graph.self_name().clone(), inner.keypair.try_clone()?)
    };
    let is_initiator = matches!(role, ConnectionRole::Initiator);
    let peer_name = match role {
        ConnectionRole::Initiator => {
            wire::write_frame(stream, format!("ID {}", self_name).as_bytes()).await?;
            let resp = wire::read_frame(stream).await?;
            parse_bootstrap_id(&resp)?
        }
        ConnectionRole::Responder(name) => {
            wire::write_frame(stream, format!("ID {}", self_name).as_bytes()).await?;
            name
        }
    };

    let peer_key = {
        let inner = handle.inner.lock();
        inner
            .graph
            .node(&peer_name)
            .and_then(|n| n.pubkey.clone())
            .ok_or_else(|| Error::simple(ErrorKind::Auth))?
    };

    let session = Session::new(self_key, peer_key);
    let mut conn = Connection::new(session);
    conn.begin_connecting()?;
    conn.begin_handshaking()?;

    if is_initiator {
        let (_, kex) = conn.session.start()?;
        wire::write_frame(stream, &kex).await?;
    }
    loop {
        let frame = wire::read_frame(stream).await?;
        let progress = conn.session.handle_handshake(&frame)?;
        for (_, payload) in &progress.to_send {
            wire::write_frame(stream, payload).await?;
        }
        if progress.established {
            break;
        }
    }

    conn.activate(peer_name.clone())?;
    let peer_addr = stream.peer_addr().ok();
    {
        let mut inner = handle.inner.lock();
        inner.write_notify.insert(peer_name.clone(), Arc::new(Notify::new()));
        if let Some(addr) = peer_addr {
            inner.observed_addrs.insert(peer_name.clone(), addr);
        }
        inner.connections.insert(peer_name.clone(), conn);
        let node = inner.graph.ensure_node(&peer_name);
        if node.preferred_udp_address.is_none() {
            if let Some(addr) = node.addresses.first().copied() {
                node.preferred_udp_address = Some(addr);
            }
        }
        // UDP path MTU probing isn't driven over the wire; a freshly
        // activated connection is assumed stable at the conservative
        // default so routing can pick DirectUdp once an address exists.
        node.mtu.discovered = Some(MtuState::DEFAULT_MAX);
        node.mtu.probes_survived_at_high_water = 2;
        inner.send_line_to(&peer_name, Line::new(RequestId::Id, vec![self_name.to_string()]))?;
        inner.send_line_to(&peer_name, Line::new(RequestId::ReqExternal, vec![]))?;
    }
    flush_outbound(handle, stream, &peer_name).await?;
    Ok(peer_name)
}

fn parse_bootstrap_id(frame: &[u8]) -> Result<NodeName> {
    let text = std::str::from_utf8(frame).wrapped(ErrorKind::Protocol)?;
    let mut parts = text.split_whitespace();
    if parts.next() != Some("ID") {
        return Err("expected an ID bootstrap line").wrapped(ErrorKind::Protocol);
    }
    let name = parts.next().ok_or_else(|| Error::simple(ErrorKind::Protocol))?;
    NodeName::new(name)
}

/// Seals and writes whatever lines are queued for `peer_name` on its
/// connection. A no-op once the connection has been torn down.
async fn flush_outbound(handle: &Arc<MeshLink>, stream: &mut TcpStream, peer_name: &NodeName) -> Result<()> {
    let records = {
        let mut inner = handle.inner.lock();
        match inner.connections.get_mut(peer_name) {
            Some(conn) => conn.drain_outbound_records()?,
            None => return Ok(()),
        }
    };
    for record in records {
        wire::write_frame(stream, &record).await?;
    }
    Ok(())
}

/// Steady-state loop for an activated connection: reads frames off the
/// wire and dispatches the lines they decode to, and wakes on
/// `write_notify` to flush anything other code enqueued for this peer.
/// Returns once the connection leaves the active/draining states or the
/// socket errs.
async fn run_active_connection(handle: &Arc<MeshLink>, stream: &mut TcpStream, peer_name: &NodeName) -> Result<()> {
    let notify = {
        let inner = handle.inner.lock();
        inner.write_notify.get(peer_name).cloned().ok_or_else(|| Error::simple(ErrorKind::Inval))?
    };
    loop {
        {
            let inner = handle.inner.lock();
            match inner.connections.get(peer_name) {
                Some(conn) if conn.state == ConnectionState::Active || conn.state == ConnectionState::Draining => {}
                _ => return Ok(()),
            }
        }
        tokio::select! {
            frame = wire::read_frame(stream) => {
                let frame = frame?;
                let lines = {
                    let mut inner = handle.inner.lock();
                    let conn = inner.connections.get_mut(peer_name).ok_or_else(|| Error::simple(ErrorKind::Inval))?;
                    conn.receive_record(&frame)?
                };
                for line in lines {
                    let mut inner = handle.inner.lock();
                    let _ = inner.dispatch(peer_name, line);
                }
                {
                    let inner = handle.inner.lock();
                    for (name, n) in inner.write_notify.iter() {
                        if name != peer_name {
                            n.notify_one();
                        }
                    }
                }
                flush_outbound(handle, stream, peer_name).await?;
            }
            _ = notify.notified() => {
                flush_outbound(handle, stream, peer_name).await?;
            }
        }
    }
}

/// Dials every known peer with no live connection, picking exactly one
/// side of each pair by lexicographic name so both ends don't race to
/// open duplicate connections.
fn spawn_outbound_dials(handle: &Arc<MeshLink>) {
    let to_dial: Vec<(NodeName, SocketAddr)> = {
        let inner = handle.inner.lock();
        let self_name = inner.graph.self_name().clone();
        inner
            .graph
            .nodes()
            .filter(|n| n.name != self_name)
            .filter(|n| self_name < n.name)
            .filter(|n| !inner.connections.contains_key(&n.name))
            .filter_map(|n| n.addresses.first().map(|addr| (n.name.clone(), *addr)))
            .collect()
    };
    for (peer_name, addr) in to_dial {
        let h = Arc::clone(handle);
        tokio::task::spawn_local(async move {
            match transport::connect_meta(addr).await {
                Ok(stream) => run_connection(h, stream, ConnectionRole::Initiator).await,
                Err(e) => tracing::debug!(peer = %peer_name, %addr, error = %e, "failed to dial known peer"),
            }
        });
    }
}

/// Seals `plaintext` for `dest`'s active session and resolves the UDP
/// address to send it to. Disjoint-field borrows of `connections` then
/// `graph` are both fine under NLL since the `conn` borrow's last use
/// precedes the `graph` access.
fn seal_for_udp(inner: &mut Inner, dest: &NodeName, plaintext: &[u8]) -> Option<(Vec<u8>, SocketAddr)> {
    let conn = inner.connections.get_mut(dest)?;
    if conn.state != ConnectionState::Active {
        return None;
    }
    let record = conn.session.seal(plaintext).ok()?;
    let addr = inner.graph.node(dest).and_then(|n| n.preferred_udp_address.or_else(|| n.addresses.first().copied()))?;
    let self_name = inner.graph.self_name().clone();
    let self_id = inner.graph.id_of(&self_name);
    let dest_id = inner.graph.id_of(dest);
    inner.next_udp_seq = inner.next_udp_seq.wrapping_add(1);
    let seq = inner.next_udp_seq;
    let header = transport::UdpHeader { src: self_id, dst: dest_id, seq };
    let mut datagram = header.encode().to_vec();
    datagram.extend_from_slice(&record);
    Some((datagram, addr))
}

/// Drains the raw `send()` datagram queue, sealing and writing each one
/// to whichever UDP socket matches the destination's address family.
async fn drain_udp_tx(handle: &Arc<MeshLink>, listeners: &transport::Listeners) {
    loop {
        let next = {
            let mut inner = handle.inner.lock();
            let Some((dest, payload)) = inner.udp_tx.pop() else { break };
            seal_for_udp(&mut inner, &dest, &payload)
        };
        if let Some((datagram, addr)) = next {
            let socket = if addr.is_ipv4() { &listeners.udp_v4 } else { &listeners.udp_v6 };
            let _ = socket.send_to(&datagram, addr).await;
        }
    }
}

/// Drains every open channel's backlog (fresh segments plus anything
/// overdue for retransmission) into sealed UDP datagrams.
async fn drain_channel_segments(handle: &Arc<MeshLink>, listeners: &transport::Listeners) {
    let outgoing: Vec<(Vec<u8>, SocketAddr)> = {
        let mut inner = handle.inner.lock();
        let now = Instant::now();
        let ids: Vec<ChannelId> = inner.channels.keys().copied().collect();
        let mut payloads: Vec<(NodeName, Vec<u8>)> = Vec::new();
        for id in ids {
            let (peer, segments, retransmits) = {
                let ch = inner.channels.get_mut(&id).unwrap();
                (ch.peer.clone(), ch.drain_segments(), ch.segments_to_retransmit(now))
            };
            for (seq, data, fin) in segments {
                payloads.push((peer.clone(), channel::wire::encode_segment(id, seq, &data, fin)));
            }
            for (seq, data) in retransmits {
                payloads.push((peer.clone(), channel::wire::encode_segment(id, seq, &data, false)));
            }
        }
        payloads.into_iter().filter_map(|(peer, payload)| seal_for_udp(&mut inner, &peer, &payload)).collect()
    };
    for (datagram, addr) in outgoing {
        let socket = if addr.is_ipv4() { &listeners.udp_v4 } else { &listeners.udp_v6 };
        let _ = socket.send_to(&datagram, addr).await;
    }
}

/// Opens one inbound UDP datagram: verifies it's addressed to this
/// node, opens its sealed record under the sender's session, and routes
/// the plaintext to either the raw-datagram callback or the owning
/// channel.
fn handle_udp_datagram(handle: &Arc<MeshLink>, bytes: &[u8]) {
    let Ok(header) = transport::UdpHeader::decode(bytes) else { return };
    let body = &bytes[transport::UDP_HEADER_LEN..];
    let mut inner = handle.inner.lock();
    let self_id = {
        let self_name = inner.graph.self_name().clone();
        inner.graph.id_of(&self_name)
    };
    if header.dst != self_id {
        tracing::debug!(dst = header.dst, "dropping UDP datagram not addressed to this node (no multi-hop relay)");
        return;
    }
    let Some(sender) = inner.graph.name_of(header.src).cloned() else { return };
    let Some(conn) = inner.connections.get_mut(&sender) else { return };
    let Ok(Some((ty, plaintext))) = conn.session.open(body) else { return };
    if ty != crypto::sptps::RecordType::Application {
        return;
    }
    let Ok(decoded) = channel::wire::decode(&plaintext) else { return };
    match decoded {
        channel::wire::Decoded::Datagram(data) => {
            if let Some(cb) = &mut inner.callbacks.receive {
                cb(&sender, &data);
            }
        }
        channel::wire::Decoded::Segment { id, seq, data, fin } => {
            if let Some(ch) = inner.channels.get_mut(&id) {
                ch.on_segment(seq, data, fin);
                let available = ch.read_available();
                if !available.is_empty() {
                    if let Some(cb) = &mut inner.callbacks.channel_receive {
                        cb(id, &available);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Routes this crate's `tracing` spans to the test harness's own
    /// captured output instead of stdout, so `cargo test -- --nocapture`
    /// shows them lined up with the failing assertion.
    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[test]
    fn identity_and_port_survive_close_and_reopen() {
        init_test_tracing();
        let dir = tempfile::tempdir().unwrap();
        let mesh = MeshLink::open(dir.path(), "alice", &"app".to_string(), DeviceClass::Stationary).unwrap();
        mesh.set_port(4433).unwrap();
        drop(mesh);

        let reopened = MeshLink::open(dir.path(), "alice", &"app".to_string(), DeviceClass::Stationary).unwrap();
        assert_eq!(reopened.get_port(), 4433);
    }

    #[test]
    fn open_refuses_mismatched_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = MeshLink::open(dir.path(), "alice", &"app".to_string(), DeviceClass::Stationary).unwrap();
        drop(mesh);

        let err = MeshLink::open(dir.path(), "bob", &"app".to_string(), DeviceClass::Stationary).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[test]
    fn set_port_zero_resolves_to_a_real_port_once_started() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = Arc::new(MeshLink::open(dir.path(), "alice", &"app".to_string(), DeviceClass::Stationary).unwrap());
        mesh.set_port(0).unwrap();
        mesh.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_ne!(mesh.get_port(), 0);
        mesh.stop().unwrap();
    }

    #[test]
    fn start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = Arc::new(MeshLink::open(dir.path(), "alice", &"app".to_string(), DeviceClass::Stationary).unwrap());
        mesh.start().unwrap();
        mesh.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let port = mesh.get_port();
        assert_ne!(port, 0);
        mesh.stop().unwrap();
        mesh.stop().unwrap();
    }

    #[test]
    fn blacklist_removes_node_and_fires_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = MeshLink::open(dir.path(), "alice", &"app".to_string(), DeviceClass::Stationary).unwrap();
        {
            let mut inner = mesh.inner.lock();
            let bob = NodeName::new("bob").unwrap();
            inner.graph.ensure_node(&bob);
            inner.graph.add_edge(Edge::new(NodeName::new("alice").unwrap(), NodeName::new("alice").unwrap(), bob.clone(), 1, None, 0, 1)).unwrap();
            inner.graph.add_edge(Edge::new(bob.clone(), bob.clone(), NodeName::new("alice").unwrap(), 1, None, 0, 1)).unwrap();
        }
        assert!(mesh.wait_for_reachable("bob", Duration::from_millis(10)));
        mesh.blacklist("bob").unwrap();
        assert!(!mesh.wait_for_reachable("bob", Duration::from_millis(10)));
    }
}
