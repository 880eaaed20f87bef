//! In-memory doubles for the lookup, transport and signer seams.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    dkim::{MessageSigner, SigningError},
    dns::{DnsError, MailServer, MxLookup},
    transport::{Stage, Transport, TransportError},
};

/// Lookup returning fixed records and counting calls.
pub struct StaticLookup {
    servers: Vec<MailServer>,
    calls: AtomicUsize,
}

impl StaticLookup {
    pub fn new(servers: &[(&str, u16)]) -> Arc<Self> {
        Arc::new(Self {
            servers: servers
                .iter()
                .map(|(host, priority)| MailServer::new((*host).to_string(), *priority))
                .collect(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MxLookup for StaticLookup {
    async fn lookup_mx(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.servers.is_empty() {
            return Err(DnsError::NoMailServers(domain.to_string()));
        }
        Ok(Arc::new(self.servers.clone()))
    }
}

/// How a scripted host answers.
#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
    Accept,
    Refuse(u16),
    Hang,
}

/// One call made to a [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub host: String,
    pub sender: String,
    pub recipient: String,
    pub payload: Vec<u8>,
}

/// Transport whose hosts answer from a script, recording every contact.
///
/// Hosts missing from the script answer `421`.
#[derive(Default)]
pub struct ScriptedTransport {
    script: HashMap<String, Behaviour>,
    contacts: Mutex<Vec<Contact>>,
}

impl ScriptedTransport {
    pub fn new(script: &[(&str, Behaviour)]) -> Arc<Self> {
        Arc::new(Self {
            script: script
                .iter()
                .map(|(host, behaviour)| ((*host).to_string(), *behaviour))
                .collect(),
            contacts: Mutex::default(),
        })
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts.lock().unwrap().clone()
    }

    pub fn contacted(&self) -> Vec<String> {
        self.contacts().into_iter().map(|c| c.host).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        host: &str,
        sender: &str,
        recipient: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.contacts.lock().unwrap().push(Contact {
            host: host.to_string(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            payload: payload.to_vec(),
        });

        match self
            .script
            .get(host)
            .copied()
            .unwrap_or(Behaviour::Refuse(421))
        {
            Behaviour::Accept => Ok(()),
            Behaviour::Refuse(code) => Err(TransportError::Rejected {
                stage: Stage::RcptTo,
                code,
                message: "scripted".to_string(),
            }),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }
}

/// Signer that prepends a fixed header, or always fails.
pub struct FakeSigner {
    fail: bool,
    calls: AtomicUsize,
}

impl FakeSigner {
    pub const HEADER: &'static [u8] = b"DKIM-Signature: v=1; d=x.com; s=test; b=fake\r\n";

    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MessageSigner for FakeSigner {
    fn sign(&self, raw: &[u8]) -> Result<Vec<u8>, SigningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SigningError::new("key rejected"));
        }
        Ok([Self::HEADER, raw].concat())
    }
}
