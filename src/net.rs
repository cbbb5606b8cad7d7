// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Newline-delimited JSON over TCP. A request is one JSON `Request` on one
//! line; the answer is one JSON `Reply` on one line. The server runs a
//! thread per connection and answers requests on a connection in order. The
//! client opens a fresh connection per call, so a blocked read never holds up
//! another request.

use crate::{Connector, Reply, ReplicaDescriptor, ReplicaService, ReplicaTransport, Request, TransportError};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Accepts connections forever, handing each to its own thread.
pub fn serve(listener: TcpListener, service: Arc<ReplicaService>) -> io::Result<()> {
    info!(
        "replica {} serving on {}",
        service.qualifier(),
        listener.local_addr()?
    );
    for stream in listener.incoming() {
        let stream = stream?;
        let service = service.clone();
        thread::spawn(move || {
            if let Err(e) = handle_connection(stream, &service) {
                warn!("replica {} connection failed: {}", service.qualifier(), e);
            }
        });
    }
    Ok(())
}

/// Runs `serve` on a background thread and returns the bound address.
pub fn spawn_server(listener: TcpListener, service: Arc<ReplicaService>) -> io::Result<SocketAddr> {
    let addr = listener.local_addr()?;
    thread::spawn(move || {
        if let Err(e) = serve(listener, service) {
            warn!("server on {} stopped: {}", addr, e);
        }
    });
    Ok(addr)
}

fn handle_connection(stream: TcpStream, service: &ReplicaService) -> io::Result<()> {
    let peer = stream.peer_addr()?;
    debug!("replica {} accepted {}", service.qualifier(), peer);
    let reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = serde_json::from_str(&line).map_err(invalid_data)?;
        let reply = service.handle(request);
        let mut out = serde_json::to_string(&reply).map_err(invalid_data)?;
        out.push('\n');
        writer.write_all(out.as_bytes())?;
    }
    debug!("replica {} closed {}", service.qualifier(), peer);
    Ok(())
}

/// Client end of the TCP transport for one replica.
#[derive(Clone, Debug)]
pub struct TcpReplica {
    descriptor: ReplicaDescriptor,
}

impl TcpReplica {
    pub fn new(descriptor: ReplicaDescriptor) -> Self {
        TcpReplica { descriptor }
    }

    fn unreachable(&self, e: io::Error) -> TransportError {
        TransportError::Unreachable {
            replica: self.descriptor.qualifier.clone(),
            reason: e.to_string(),
        }
    }

    fn protocol(&self, reason: String) -> TransportError {
        TransportError::Protocol {
            replica: self.descriptor.qualifier.clone(),
            reason,
        }
    }
}

impl ReplicaTransport for TcpReplica {
    fn call(&self, request: Request) -> Result<Reply, TransportError> {
        let mut stream =
            TcpStream::connect(&self.descriptor.address).map_err(|e| self.unreachable(e))?;
        let mut line = serde_json::to_string(&request).map_err(|e| self.protocol(e.to_string()))?;
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .map_err(|e| self.unreachable(e))?;
        let mut answer = String::new();
        let n = BufReader::new(stream)
            .read_line(&mut answer)
            .map_err(|e| self.unreachable(e))?;
        if n == 0 {
            return Err(self.unreachable(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before reply",
            )));
        }
        serde_json::from_str(&answer).map_err(|e| self.protocol(e.to_string()))
    }
}

/// Connects to replicas by their TCP address.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, replica: &ReplicaDescriptor) -> Result<Arc<dyn ReplicaTransport>, TransportError> {
        Ok(Arc::new(TcpReplica::new(replica.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientId, Config, NameRegistry, Response, Session, StoreError};

    fn start(qualifier: &str) -> (Arc<ReplicaService>, ReplicaDescriptor) {
        let service = Arc::new(ReplicaService::new(qualifier, 1));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = spawn_server(listener, service.clone()).unwrap();
        let d = ReplicaDescriptor::new(qualifier, &addr.to_string()).unwrap();
        (service, d)
    }

    #[test]
    fn replies_cross_the_wire() {
        let (service, d) = start("A");
        let r = TcpReplica::new(d);
        assert_eq!(
            r.call(Request::Put { tuple: "<a,1>".into() }),
            Ok(Ok(Response::Put))
        );
        assert_eq!(service.store().snapshot(), vec!["<a,1>"]);
        assert_eq!(
            r.call(Request::TakePhase2 {
                tuple: "<a,1>".into(),
                client_id: ClientId(9)
            }),
            Ok(Err(StoreError::NotHolder {
                tuple: "<a,1>".into(),
                client: ClientId(9)
            }))
        );
    }

    #[test]
    fn nobody_listening_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let r = TcpReplica::new(ReplicaDescriptor::new("A", &addr.to_string()).unwrap());
        assert!(matches!(
            r.call(Request::GetState),
            Err(TransportError::Unreachable { .. })
        ));
    }

    #[test]
    fn session_over_tcp() {
        let names = Arc::new(NameRegistry::new());
        for q in &["A", "B", "C"] {
            let (_, d) = start(q);
            names
                .register("TupleSpaces", &d.qualifier, &d.address)
                .unwrap();
        }
        let s = Session::new(Config::default(), names, Arc::new(TcpConnector));
        s.put("<x,1>").unwrap();
        s.put("<x,2>").unwrap();
        assert_eq!(s.read("<x,2>").unwrap(), "<x,2>");
        assert_eq!(s.take("<x,.>").unwrap(), "<x,1>");
        assert_eq!(s.get_state("B").unwrap(), vec!["<x,2>"]);
    }
}
