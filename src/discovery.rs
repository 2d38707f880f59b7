//! Discovery adapter: an abstract publish/browse/resolve interface. The
//! concrete DNS-SD implementation lives behind the `bonjour` feature; the
//! core only depends on the traits, so hosts can plug in anything that can
//! announce or find a `host:port`.

use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Service type announced by viewers accepting plaintext connections.
pub const SERVICE_TYPE_PLAIN: &str = "_nslogger._tcp";
/// Service type announced by viewers requiring TLS.
pub const SERVICE_TYPE_TLS: &str = "_nslogger-ssl._tcp";
/// TXT record key whose value `1` marks a TLS-requiring service.
pub const TXT_KEY_TLS: &str = "p";

/// One service announcement seen while browsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFound {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub requires_tls: bool,
}

/// What to browse for.
#[derive(Debug, Clone)]
pub struct BrowseQuery {
    pub service_type: String,
    /// Restrict browsing to the `local.` domain.
    pub only_local_domain: bool,
    /// When set, only services with this exact name are reported.
    pub name_filter: Option<String>,
}

/// Client-side browse/resolve interface.
pub trait DiscoverySource: Send {
    /// Begins browsing; matches are delivered through `sink` (possibly from
    /// an adapter-owned thread) until [`stop_browsing`](Self::stop_browsing).
    fn browse(&mut self, query: BrowseQuery, sink: Box<dyn Fn(ServiceFound) + Send + Sync>)
        -> Result<()>;

    /// Resolves a previously reported service name to socket addresses.
    fn resolve(&mut self, service_name: &str) -> Result<Vec<SocketAddr>>;

    fn stop_browsing(&mut self);
}

/// Viewer-side publication interface.
pub trait DiscoveryPublisher: Send {
    /// Publishes a service; the announcement stays up until the returned
    /// handle is dropped.
    fn publish(&mut self, name: &str, port: u16, txt: &[(String, String)])
        -> Result<PublishHandle>;
}

/// Keeps a published service announced; unpublishes on drop.
pub struct PublishHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl PublishHandle {
    pub fn new(cancel: Box<dyn FnOnce() + Send>) -> PublishHandle {
        PublishHandle {
            cancel: Some(cancel),
        }
    }
}

impl Drop for PublishHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for PublishHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PublishHandle")
    }
}

/// Resolves a bare `host:port` through the system resolver, preferring
/// link-local/private IPv4 addresses the way Bonjour-discovered services are
/// usually reachable.
pub fn resolve_host_port(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    use std::net::ToSocketAddrs;

    let mut addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(Error::Transport)?
        .collect();
    if addrs.is_empty() {
        return Err(Error::Configuration(format!(
            "no address found for {}:{}",
            host, port
        )));
    }
    addrs.sort_by_key(|addr| !addr.is_ipv4());
    Ok(addrs)
}

#[cfg(feature = "bonjour")]
pub use self::bonjour::BonjourDiscovery;

#[cfg(feature = "bonjour")]
mod bonjour {
    //! DNS-SD implementation over `async-dnssd`, driven by a dedicated
    //! reactor thread.

    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use async_dnssd::Interface;
    use futures::future::Either;
    use futures::{Future, Stream};
    use tokio_core::reactor::{Core, Timeout};

    use super::{BrowseQuery, DiscoveryPublisher, DiscoverySource, PublishHandle, ServiceFound};
    use crate::error::{Error, Result};

    const BROWSE_TIMEOUT: Duration = Duration::from_secs(5);
    const BROWSE_RETRY_DELAY: Duration = Duration::from_secs(10);

    pub struct BonjourDiscovery {
        resolved: Arc<Mutex<HashMap<String, (String, u16)>>>,
        stopping: Arc<AtomicBool>,
        browse_thread: Option<thread::JoinHandle<()>>,
    }

    impl BonjourDiscovery {
        pub fn new() -> BonjourDiscovery {
            BonjourDiscovery {
                resolved: Arc::new(Mutex::new(HashMap::new())),
                stopping: Arc::new(AtomicBool::new(false)),
                browse_thread: None,
            }
        }
    }

    impl Default for BonjourDiscovery {
        fn default() -> BonjourDiscovery {
            BonjourDiscovery::new()
        }
    }

    impl DiscoverySource for BonjourDiscovery {
        fn browse(
            &mut self,
            query: BrowseQuery,
            sink: Box<dyn Fn(ServiceFound) + Send + Sync>,
        ) -> Result<()> {
            // A previous stop_browsing must not cancel this browse.
            self.stopping.store(false, Ordering::Relaxed);
            let resolved = self.resolved.clone();
            let stopping = self.stopping.clone();
            let requires_tls = query.service_type == super::SERVICE_TYPE_TLS;

            let handle = thread::Builder::new()
                .name(String::from("nslogger-bonjour"))
                .spawn(move || {
                    let mut core = match Core::new() {
                        Ok(core) => core,
                        Err(e) => {
                            log::warn!(target: "NSLogger", "bonjour reactor failed: {}", e);
                            return;
                        }
                    };
                    let reactor = core.handle();
                    let domain = if query.only_local_domain {
                        Some("local.")
                    } else {
                        None
                    };

                    while !stopping.load(Ordering::Relaxed) {
                        let listener = match async_dnssd::browse(
                            Interface::Any,
                            &query.service_type,
                            domain,
                            &reactor,
                        ) {
                            Ok(listener) => listener,
                            Err(e) => {
                                log::warn!(target: "NSLogger", "bonjour browse failed: {:?}", e);
                                return;
                            }
                        };

                        let timeout = match Timeout::new(BROWSE_TIMEOUT, &reactor) {
                            Ok(timeout) => timeout,
                            Err(_) => return,
                        };
                        match core.run(listener.into_future().select2(timeout)) {
                            Ok(Either::A(((Some(browse_result), _), _))) => {
                                let service_name = browse_result.service_name.to_string();
                                if let Some(ref wanted) = query.name_filter {
                                    if *wanted != service_name {
                                        continue;
                                    }
                                }
                                let resolve = match browse_result.resolve(&reactor) {
                                    Ok(resolve) => resolve,
                                    Err(_) => continue,
                                };
                                if let Ok((Some(details), _)) = core.run(resolve.into_future()) {
                                    let host = details.host_target.to_string();
                                    let port = details.port;
                                    if let Ok(mut cache) = resolved.lock() {
                                        cache.insert(service_name.clone(), (host.clone(), port));
                                    }
                                    sink(ServiceFound {
                                        service_name,
                                        host,
                                        port,
                                        requires_tls,
                                    });
                                    return;
                                }
                            }
                            Ok(_) | Err(_) => {
                                log::info!(target: "NSLogger",
                                           "bonjour browse timed out, will retry");
                            }
                        }

                        // Nothing resolvable yet; wait before browsing again.
                        if let Ok(delay) = Timeout::new(BROWSE_RETRY_DELAY, &reactor) {
                            let _ = core.run(delay);
                        }
                    }
                })
                .map_err(Error::Transport)?;

            self.browse_thread = Some(handle);
            Ok(())
        }

        fn resolve(&mut self, service_name: &str) -> Result<Vec<SocketAddr>> {
            let cached = self
                .resolved
                .lock()
                .map_err(|_| Error::Configuration(String::from("bonjour cache poisoned")))?
                .get(service_name)
                .cloned();
            match cached {
                Some((host, port)) => super::resolve_host_port(&host, port),
                None => Err(Error::Configuration(format!(
                    "unknown service {:?}",
                    service_name
                ))),
            }
        }

        fn stop_browsing(&mut self) {
            self.stopping.store(true, Ordering::Relaxed);
            self.browse_thread = None;
        }
    }

    impl DiscoveryPublisher for BonjourDiscovery {
        fn publish(
            &mut self,
            name: &str,
            port: u16,
            txt: &[(String, String)],
        ) -> Result<PublishHandle> {
            let name = name.to_string();
            let service_type = if txt
                .iter()
                .any(|(key, value)| key == super::TXT_KEY_TLS && value == "1")
            {
                super::SERVICE_TYPE_TLS
            } else {
                super::SERVICE_TYPE_PLAIN
            };
            let stopping = Arc::new(AtomicBool::new(false));
            let thread_stop = stopping.clone();
            let service_type = service_type.to_string();

            thread::Builder::new()
                .name(String::from("nslogger-publish"))
                .spawn(move || {
                    let mut core = match Core::new() {
                        Ok(core) => core,
                        Err(_) => return,
                    };
                    let reactor = core.handle();
                    let registration = async_dnssd::register(
                        Interface::Any,
                        &name,
                        &service_type,
                        None,
                        None,
                        port,
                        &[],
                        &reactor,
                    );
                    let registration = match registration {
                        Ok(registration) => registration,
                        Err(e) => {
                            log::warn!(target: "NSLoggerViewer",
                                       "bonjour registration failed: {:?}", e);
                            return;
                        }
                    };
                    // Keep the registration alive until unpublished.
                    let _keepalive = registration;
                    while !thread_stop.load(Ordering::Relaxed) {
                        if let Ok(tick) = Timeout::new(Duration::from_millis(250), &reactor) {
                            let _ = core.run(tick);
                        }
                    }
                })
                .map_err(Error::Transport)?;

            Ok(PublishHandle::new(Box::new(move || {
                stopping.store(true, Ordering::Relaxed);
            })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_host_port_handles_loopback() {
        let addrs = resolve_host_port("127.0.0.1", 50000).unwrap();
        assert!(addrs.iter().any(|addr| addr.is_ipv4()));
        assert_eq!(addrs[0].port(), 50000);
    }

    #[test]
    fn publish_handle_cancels_on_drop() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let handle = PublishHandle::new(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(!cancelled.load(Ordering::SeqCst));
        drop(handle);
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
