// src/session.rs

//! Per-connection handshake.
//!
//! ```text
//! client                              daemon
//!   | ------------ connect ------------> |  peer credentials from the kernel
//!   | <--------- ALLOW | DENY ---------- |  signature check, DENY closes
//!   | ------- i32 interface version ---> |
//!   | <-------- OK | UNSUPPORTED ------- |  UNSUPPORTED closes
//!   | <======= version handler =======>  |
//! ```
//!
//! Authorization always comes first and does not depend on the version the
//! client asks for. Any I/O failure ends the connection on the spot.

use anyhow::{Context, Result, bail};
use log::{debug, error, info};
use std::os::unix::net::UnixStream;

use crate::constants::{
    ProtocolVersion, RESPONSE_ALLOW, RESPONSE_DENY, RESPONSE_OK, RESPONSE_UNSUPPORTED,
};
use crate::credentials::{CredentialVerifier, SignatureRegistry};
use crate::utils::UnixStreamExt;
use crate::v3::VersionHandler;

/// Identity of the connecting process, as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredential {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

impl PeerCredential {
    pub fn from_stream(stream: &UnixStream) -> Result<Self> {
        let ucred = rustix::net::sockopt::socket_peercred(stream)
            .context("Failed to get socket credentials")?;
        Ok(Self {
            pid: ucred.pid.as_raw_nonzero().get(),
            uid: ucred.uid.as_raw(),
            gid: ucred.gid.as_raw(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Allowed,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Accepted(ProtocolVersion),
    /// Retired or unknown version, as sent by the peer.
    Rejected(i32),
}

/// How a connection ended, when it ended without an I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The peer failed verification and was sent `DENY`.
    Denied,
    /// The peer asked for a retired or unknown version.
    Unsupported(i32),
    /// The version handler ran to completion.
    Served(ProtocolVersion),
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Served(_))
    }
}

/// State of one accepted connection.
pub struct Session {
    stream: UnixStream,
    peer: PeerCredential,
    authorization: Option<Authorization>,
    version: Option<ProtocolVersion>,
}

impl Session {
    /// Captures the peer credentials. Without them the peer cannot be
    /// trusted, so failure here ends the connection with no response.
    pub fn new(stream: UnixStream) -> Result<Self> {
        let peer = PeerCredential::from_stream(&stream)?;
        debug!(
            "Client PID: {}, UID: {}, GID: {}",
            peer.pid, peer.uid, peer.gid
        );
        Ok(Self {
            stream,
            peer,
            authorization: None,
            version: None,
        })
    }

    pub fn peer(&self) -> PeerCredential {
        self.peer
    }

    /// Checks the peer and tells it the verdict.
    pub fn authorize<R: SignatureRegistry>(
        &mut self,
        verifier: &CredentialVerifier<R>,
    ) -> Result<Authorization> {
        if self.authorization.is_some() {
            bail!("Session already authorized");
        }

        let authorization = if verifier.verify(self.peer.uid) {
            self.stream
                .write_string(RESPONSE_ALLOW)
                .context("Failed to send credentials allowed message")?;
            Authorization::Allowed
        } else {
            if let Err(e) = self.stream.write_string(RESPONSE_DENY) {
                error!("Failed to send credentials denied message: {e:?}");
            }
            Authorization::Denied
        };

        self.authorization = Some(authorization);
        Ok(authorization)
    }

    /// Reads the requested interface version and answers it.
    pub fn negotiate(&mut self) -> Result<Negotiation> {
        if self.authorization != Some(Authorization::Allowed) {
            bail!("Refusing to negotiate with an unauthorized peer");
        }

        let raw = self
            .stream
            .read_i32()
            .context("Failed to get interface version")?;

        match ProtocolVersion::try_from(raw) {
            Ok(ProtocolVersion::V2) => {
                error!("Protocol version 2 is no longer supported");
            }
            Ok(version) => {
                self.stream
                    .write_string(RESPONSE_OK)
                    .context("Failed to send version acknowledgement")?;
                self.version = Some(version);
                return Ok(Negotiation::Accepted(version));
            }
            Err(_) => {
                error!("Unsupported interface version: {raw}");
            }
        }

        if let Err(e) = self.stream.write_string(RESPONSE_UNSUPPORTED) {
            error!("Failed to send unsupported version message: {e:?}");
        }
        Ok(Negotiation::Rejected(raw))
    }

    /// Hands the connection to the handler for the negotiated version.
    /// Failures inside the handler are logged, not returned.
    pub fn hand_off(&mut self, handler: &dyn VersionHandler) -> Result<ProtocolVersion> {
        if self.authorization != Some(Authorization::Allowed) {
            bail!("Refusing to hand off an unauthorized session");
        }
        let Some(version) = self.version else {
            bail!("No interface version negotiated");
        };

        if let Err(e) = handler.serve(&mut self.stream) {
            error!("[Version {}] Communication error: {e:?}", version as i32);
        }
        Ok(version)
    }
}

/// Runs the whole handshake for one connection.
///
/// `handler_for` picks the handler for a negotiated version. Only versions
/// that [`Session::negotiate`] accepts ever reach it.
pub fn handle_client<R, F>(
    stream: UnixStream,
    verifier: &CredentialVerifier<R>,
    handler_for: F,
) -> Result<SessionOutcome>
where
    R: SignatureRegistry,
    F: FnOnce(ProtocolVersion) -> Box<dyn VersionHandler>,
{
    let mut session = Session::new(stream)?;
    let peer = session.peer();

    if session.authorize(verifier)? == Authorization::Denied {
        info!("Denied client PID {} (UID {})", peer.pid, peer.uid);
        return Ok(SessionOutcome::Denied);
    }

    let version = match session.negotiate()? {
        Negotiation::Accepted(version) => version,
        Negotiation::Rejected(raw) => return Ok(SessionOutcome::Unsupported(raw)),
    };

    info!(
        "Client PID {} (UID {}) using interface version {}",
        peer.pid, peer.uid, version as i32
    );
    let handler = handler_for(version);
    let version = session.hand_off(handler.as_ref())?;
    Ok(SessionOutcome::Served(version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::{FakeRegistry, TEST_WHITELIST};
    use std::io::Read;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::{self, JoinHandle};

    struct CountingHandler(Arc<AtomicUsize>);

    impl VersionHandler for CountingHandler {
        fn serve(&self, stream: &mut UnixStream) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            stream.write_string("served")
        }
    }

    fn own_uid() -> u32 {
        rustix::process::getuid().as_raw()
    }

    fn spawn_server(
        registry: FakeRegistry,
    ) -> (UnixStream, Arc<AtomicUsize>, JoinHandle<Result<SessionOutcome>>) {
        let (client, server) = UnixStream::pair().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = thread::spawn(move || {
            let verifier = CredentialVerifier::new(registry, &TEST_WHITELIST);
            handle_client(server, &verifier, move |_| {
                Box::new(CountingHandler(counter)) as Box<dyn VersionHandler>
            })
        });
        (client, calls, handle)
    }

    fn trusted() -> FakeRegistry {
        FakeRegistry::default().with(own_uid(), "com.example.trusted", &[("0", Some("abc"))])
    }

    fn assert_closed(client: &mut UnixStream) {
        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn trusted_client_on_version_3_is_served_once() {
        let (mut client, calls, server) = spawn_server(trusted());

        assert_eq!(client.read_string().unwrap(), RESPONSE_ALLOW);
        client.write_i32(3).unwrap();
        assert_eq!(client.read_string().unwrap(), RESPONSE_OK);
        assert_eq!(client.read_string().unwrap(), "served");

        let outcome = server.join().unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::Served(ProtocolVersion::V3));
        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_package_is_denied_before_version_exchange() {
        let (mut client, calls, server) = spawn_server(FakeRegistry::default());

        assert_eq!(client.read_string().unwrap(), RESPONSE_DENY);
        let outcome = server.join().unwrap().unwrap();
        assert_eq!(outcome, SessionOutcome::Denied);
        assert!(!outcome.is_success());
        assert_closed(&mut client);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn untrusted_signature_is_denied() {
        let registry =
            FakeRegistry::default().with(own_uid(), "com.example.evil", &[("0", Some("evil"))]);
        let (mut client, _, server) = spawn_server(registry);

        assert_eq!(client.read_string().unwrap(), RESPONSE_DENY);
        assert_eq!(server.join().unwrap().unwrap(), SessionOutcome::Denied);
    }

    #[test]
    fn version_2_is_retired() {
        let (mut client, calls, server) = spawn_server(trusted());

        assert_eq!(client.read_string().unwrap(), RESPONSE_ALLOW);
        client.write_i32(2).unwrap();
        assert_eq!(client.read_string().unwrap(), RESPONSE_UNSUPPORTED);

        assert_eq!(
            server.join().unwrap().unwrap(),
            SessionOutcome::Unsupported(2)
        );
        assert_closed(&mut client);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_versions_are_unsupported() {
        for version in [0, 1, 4, 99, -3, i32::MAX] {
            let (mut client, calls, server) = spawn_server(trusted());

            assert_eq!(client.read_string().unwrap(), RESPONSE_ALLOW);
            client.write_i32(version).unwrap();
            assert_eq!(client.read_string().unwrap(), RESPONSE_UNSUPPORTED);

            assert_eq!(
                server.join().unwrap().unwrap(),
                SessionOutcome::Unsupported(version)
            );
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn truncated_version_fails_the_connection() {
        let (mut client, calls, server) = spawn_server(trusted());

        assert_eq!(client.read_string().unwrap(), RESPONSE_ALLOW);
        std::io::Write::write_all(&mut client, &[3, 0]).unwrap();
        drop(client);

        assert!(server.join().unwrap().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_errors_do_not_change_the_outcome() {
        struct Failing;
        impl VersionHandler for Failing {
            fn serve(&self, _stream: &mut UnixStream) -> Result<()> {
                bail!("boom")
            }
        }

        let (mut client, server) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            let verifier = CredentialVerifier::new(trusted(), &TEST_WHITELIST);
            handle_client(server, &verifier, |_| Box::new(Failing) as Box<dyn VersionHandler>)
        });

        assert_eq!(client.read_string().unwrap(), RESPONSE_ALLOW);
        client.write_i32(3).unwrap();
        assert_eq!(client.read_string().unwrap(), RESPONSE_OK);
        assert_eq!(
            handle.join().unwrap().unwrap(),
            SessionOutcome::Served(ProtocolVersion::V3)
        );
    }

    #[test]
    fn session_steps_cannot_be_skipped() {
        let (_client, server) = UnixStream::pair().unwrap();
        let mut session = Session::new(server).unwrap();
        assert_eq!(session.peer().uid, own_uid());
        assert_eq!(session.peer().pid, std::process::id() as i32);

        assert!(session.negotiate().is_err());
        assert!(
            session
                .hand_off(&CountingHandler(Arc::new(AtomicUsize::new(0))))
                .is_err()
        );
    }

    #[test]
    fn authorization_happens_once() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut session = Session::new(server).unwrap();
        let verifier = CredentialVerifier::new(trusted(), &TEST_WHITELIST);

        assert_eq!(session.authorize(&verifier).unwrap(), Authorization::Allowed);
        assert_eq!(client.read_string().unwrap(), RESPONSE_ALLOW);
        assert!(session.authorize(&verifier).is_err());
    }
}
