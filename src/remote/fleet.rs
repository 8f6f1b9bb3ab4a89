//! Fleet of connected hosts.
//!
//! Connection setup (TCP, handshake, auth, OS probe) dominates startup
//! latency, so hosts are connected on one thread each and joined before the
//! engine proceeds. Any single failure aborts the run; a fleet with a dead
//! member cannot produce a valid measurement.

use crate::config::{HostConfig, MASTER_ROLE};
use crate::error::{BenchError, Result};
use crate::remote::host::RemoteHost;
use log::info;
use std::thread;

pub struct Fleet {
    hosts: Vec<RemoteHost>,
}

impl Fleet {
    /// Connects every host concurrently. Fails if any connection fails.
    pub fn connect(configs: Vec<HostConfig>) -> Result<Self> {
        info!("Connecting to {} host(s)", configs.len());
        let handles: Vec<_> = configs
            .into_iter()
            .map(|config| {
                thread::spawn(move || {
                    let label = config.address.clone();
                    (label, RemoteHost::connect(config))
                })
            })
            .collect();

        let mut hosts = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            let (label, result) = handle.join().map_err(|_| BenchError::Connectivity {
                host: "unknown".into(),
                message: "connection thread panicked".into(),
            })?;
            match result {
                Ok(host) => hosts.push(host),
                Err(e) => {
                    log::error!("Failed to connect to {}: {}", label, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(Self::from_hosts(hosts))
    }

    pub fn from_hosts(hosts: Vec<RemoteHost>) -> Self {
        Self { hosts }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// The host that drives the benchmark tool.
    pub fn master(&mut self) -> Result<&mut RemoteHost> {
        self.by_role(MASTER_ROLE)
            .ok_or_else(|| BenchError::Config(format!("no host with role '{}'", MASTER_ROLE)))
    }

    pub fn by_role(&mut self, role: &str) -> Option<&mut RemoteHost> {
        self.hosts.iter_mut().find(|h| h.role() == role)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RemoteHost> {
        self.hosts.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteHost> {
        self.hosts.iter()
    }
}
