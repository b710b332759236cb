use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap},
    fmt,
    rc::Rc,
    time::{Duration, Instant},
};

use local_sync::semaphore::Semaphore;
use monoio_http_proto::Headers;

use crate::{
    backend::{Backend, MonoioBackend},
    body::ByteStream,
    config::{HttpVersion, PoolConfig, ProxyMode},
    connection::{ConnectOptions, Connection, TunnelRoute},
    origin::{Origin, Scheme},
    request::{merge_headers, Request},
    response::Response,
    util::{with_timeout, AsyncMutex},
    Error, Result,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Evicts the connection when a request is dropped before the connection
/// has produced a response or an error.
struct InFlight<'a, B: Backend> {
    pool: &'a ConnectionPool<B>,
    connection: Connection<B>,
    armed: bool,
}

impl<B: Backend> Drop for InFlight<'_, B> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // a live HTTP/2 connection may still carry other streams
        if self.connection.http_version() == Some(HttpVersion::Http2) && !self.connection.is_closed()
        {
            return;
        }
        #[cfg(feature = "logging")]
        tracing::debug!(origin = %self.connection.origin(), "pool.evict cancelled request");
        self.pool.remove(&self.connection);
        self.connection.close();
    }
}

struct ProxyState {
    origin: Origin,
    mode: ProxyMode,
    headers: Headers,
    options: ConnectOptions,
    tunnel: Rc<TunnelRoute>,
}

/// Where a request goes; the origin is the key its connection is pooled under.
enum Route {
    Direct(Origin),
    Forward(Origin),
    Tunnel(Origin, Rc<TunnelRoute>),
}

impl Route {
    fn origin(&self) -> &Origin {
        match self {
            Route::Direct(o) | Route::Forward(o) | Route::Tunnel(o, _) => o,
        }
    }
}

pub(crate) struct PoolShared<B: Backend> {
    config: PoolConfig,
    backend: B,
    direct: ConnectOptions,
    proxy: Option<ProxyState>,
    connections: RefCell<HashMap<Origin, Vec<Connection<B>>>>,
    // one permit per pooled connection
    admission: Option<Semaphore>,
    acquisition_lock: AsyncMutex,
    next_sweep: Cell<Option<Instant>>,
}

/// Connections keyed by origin, shared by every request on this thread.
pub struct ConnectionPool<B: Backend = MonoioBackend> {
    shared: Rc<PoolShared<B>>,
}

impl<B: Backend> Clone for ConnectionPool<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl ConnectionPool<MonoioBackend> {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_backend(config, MonoioBackend)
    }
}

impl<B: Backend> ConnectionPool<B> {
    pub fn with_backend(config: PoolConfig, backend: B) -> Self {
        let direct = ConnectOptions::direct(&config);
        let proxy = config.proxy.as_ref().and_then(|proxy| {
            // a bad proxy URL is rejected by the builder
            let origin = proxy.url.origin().ok()?;
            let options = ConnectOptions::proxy(&config, proxy);
            let tunnel = Rc::new(TunnelRoute {
                proxy_origin: origin.clone(),
                proxy_headers: proxy.headers.clone(),
                proxy_options: options.clone(),
            });
            Some(ProxyState {
                origin,
                mode: proxy.mode,
                headers: proxy.headers.clone(),
                options,
                tunnel,
            })
        });
        let admission = config.max_connections.map(Semaphore::new);
        Self {
            shared: Rc::new(PoolShared {
                config,
                backend,
                direct,
                proxy,
                connections: RefCell::new(HashMap::new()),
                admission,
                acquisition_lock: AsyncMutex::new(),
                next_sweep: Cell::new(None),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Rc<PoolShared<B>>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Sends `request` on a pooled connection, opening one if none is
    /// available. The connection stays checked out until the response body
    /// is finished, closed or dropped.
    pub async fn handle_request<Bd: ByteStream>(
        &self,
        mut request: Request<Bd>,
    ) -> Result<Response<B>> {
        let target = request.url.origin()?;
        let route = self.route(target, &mut request);
        self.sweep();

        let pool_timeout = request.timeouts().pool;
        loop {
            let connection = self.acquire(&route, pool_timeout).await?;
            let mut in_flight = InFlight {
                pool: self,
                connection: connection.clone(),
                armed: true,
            };
            let result = connection.handle_request(&mut request).await;
            in_flight.armed = false;
            match result {
                Ok(response) => {
                    return Ok(Response::new(
                        response,
                        Rc::downgrade(&self.shared),
                        connection,
                    ))
                }
                Err(Error::NewConnectionRequired) => continue,
                Err(e) => {
                    #[cfg(feature = "logging")]
                    tracing::debug!(origin = %connection.origin(), error = %e, "pool.evict");
                    self.remove(&connection);
                    return Err(e);
                }
            }
        }
    }

    /// Forwarded requests are rewritten here, once, to absolute-form with the
    /// proxy headers merged in.
    fn route<Bd>(&self, target: Origin, request: &mut Request<Bd>) -> Route {
        let Some(proxy) = &self.shared.proxy else {
            return Route::Direct(target);
        };
        let forward = match proxy.mode {
            ProxyMode::ForwardOnly => true,
            ProxyMode::TunnelOnly => false,
            ProxyMode::Default => target.scheme == Scheme::Http,
        };
        if forward {
            request.url.target = request.url.absolute_form();
            request.headers = merge_headers(&proxy.headers, &request.headers);
            Route::Forward(proxy.origin.clone())
        } else {
            Route::Tunnel(target, proxy.tunnel.clone())
        }
    }

    async fn acquire(&self, route: &Route, pool_timeout: Option<Duration>) -> Result<Connection<B>> {
        let _guard = self.shared.acquisition_lock.lock().await?;
        let origin = route.origin();

        let mut reuse = None;
        let mut evicted = Vec::new();
        if let Some(list) = self.shared.connections.borrow().get(origin) {
            for connection in list {
                if connection.should_close() {
                    evicted.push(connection.clone());
                } else if connection.is_available() {
                    reuse = Some(connection.clone());
                }
            }
        }
        for connection in evicted {
            #[cfg(feature = "logging")]
            tracing::debug!(origin = %connection.origin(), "pool.evict");
            self.remove(&connection);
            connection.close();
        }
        if let Some(connection) = reuse {
            #[cfg(feature = "logging")]
            tracing::debug!(%origin, info = %connection.info(), "pool.acquire");
            return Ok(connection);
        }

        let connection = self.create_connection(route);
        self.add_to_pool(&connection, pool_timeout).await?;
        #[cfg(feature = "logging")]
        tracing::debug!(%origin, "pool.acquire new connection");
        Ok(connection)
    }

    fn create_connection(&self, route: &Route) -> Connection<B> {
        let backend = self.shared.backend.clone();
        match route {
            Route::Direct(origin) => {
                Connection::new(origin.clone(), backend, self.shared.direct.clone())
            }
            Route::Forward(origin) => {
                let options = self
                    .shared
                    .proxy
                    .as_ref()
                    .map(|p| p.options.clone())
                    .unwrap_or_else(|| self.shared.direct.clone());
                Connection::new(origin.clone(), backend, options)
            }
            Route::Tunnel(origin, tunnel) => Connection::tunnelled(
                origin.clone(),
                backend,
                self.shared.direct.clone(),
                tunnel.clone(),
            ),
        }
    }

    /// Takes an admission permit, evicting an idle connection first when the
    /// pool is full.
    async fn add_to_pool(
        &self,
        connection: &Connection<B>,
        pool_timeout: Option<Duration>,
    ) -> Result<()> {
        if let Some(admission) = &self.shared.admission {
            if admission.available_permits() == 0 {
                self.evict_one_idle();
            }
            match with_timeout(pool_timeout, admission.acquire()).await {
                Some(Ok(permit)) => permit.forget(),
                Some(Err(_)) | None => return Err(Error::PoolTimeout),
            }
        }
        self.shared
            .connections
            .borrow_mut()
            .entry(connection.origin().clone())
            .or_default()
            .push(connection.clone());
        Ok(())
    }

    fn evict_one_idle(&self) {
        let idle = self
            .shared
            .connections
            .borrow()
            .values()
            .flatten()
            .find(|c| c.is_idle())
            .cloned();
        if let Some(connection) = idle {
            #[cfg(feature = "logging")]
            tracing::debug!(origin = %connection.origin(), "pool.evict idle for capacity");
            self.remove(&connection);
            connection.close();
        }
    }

    /// Drops `connection` from the pool and returns its permit. False if it
    /// was not pooled.
    fn remove(&self, connection: &Connection<B>) -> bool {
        let mut connections = self.shared.connections.borrow_mut();
        let Some(list) = connections.get_mut(connection.origin()) else {
            return false;
        };
        let Some(idx) = list.iter().position(|c| c.ptr_eq(connection)) else {
            return false;
        };
        list.remove(idx);
        if list.is_empty() {
            connections.remove(connection.origin());
        }
        if let Some(admission) = &self.shared.admission {
            admission.add_permits(1);
        }
        true
    }

    fn len(&self) -> usize {
        self.shared.connections.borrow().values().map(Vec::len).sum()
    }

    pub(crate) fn on_response_closed(&self, connection: &Connection<B>) {
        if connection.is_closed() {
            self.remove(connection);
        } else if connection.is_idle() {
            let over_limit = self
                .shared
                .config
                .max_keepalive_connections
                .map_or(false, |max| self.len() > max);
            if over_limit && self.remove(connection) {
                #[cfg(feature = "logging")]
                tracing::debug!(origin = %connection.origin(), "pool.evict over keepalive limit");
                connection.close();
            }
        }
    }

    /// Closes idle connections past keep-alive or dropped by the peer, at
    /// most once a second.
    fn sweep(&self) {
        if self.shared.config.keepalive_expiry.is_none() {
            return;
        }
        let now = Instant::now();
        if self.shared.next_sweep.get().map_or(false, |at| now < at) {
            return;
        }
        self.shared.next_sweep.set(Some(now + SWEEP_INTERVAL));

        let expired: Vec<_> = self
            .shared
            .connections
            .borrow()
            .values()
            .flatten()
            .filter(|c| c.should_close())
            .cloned()
            .collect();
        for connection in expired {
            #[cfg(feature = "logging")]
            tracing::debug!(origin = %connection.origin(), "pool.evict expired");
            self.remove(&connection);
            connection.close();
        }
    }

    /// Closes every connection. Idempotent.
    pub fn close(&self) {
        let drained: Vec<_> = self
            .shared
            .connections
            .borrow_mut()
            .drain()
            .flat_map(|(_, list)| list)
            .collect();
        if let Some(admission) = &self.shared.admission {
            admission.add_permits(drained.len());
        }
        for connection in drained {
            connection.close();
        }
    }

    pub fn connections(&self) -> Vec<Connection<B>> {
        self.shared
            .connections
            .borrow()
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// `origin -> sorted connection descriptions`.
    pub fn connection_info(&self) -> BTreeMap<String, Vec<String>> {
        let mut info = BTreeMap::new();
        for (origin, list) in self.shared.connections.borrow().iter() {
            let mut descriptions: Vec<String> = list.iter().map(Connection::info).collect();
            descriptions.sort();
            info.insert(origin.to_string(), descriptions);
        }
        info
    }
}

impl<B: Backend> fmt::Debug for ConnectionPool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ConnectionPool [Connections: {}]>", self.len())
    }
}
