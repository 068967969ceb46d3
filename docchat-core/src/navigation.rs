use async_trait::async_trait;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Route {
    #[default]
    Home,
    Session(String),
}

impl Route {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Route::Home => None,
            Route::Session(id) => Some(id),
        }
    }

    pub fn path(&self) -> String {
        match self {
            Route::Home => "/".to_string(),
            Route::Session(id) => format!("/chat/{id}"),
        }
    }
}

/// Routing collaborator. `navigate` resolves once the transition has
/// committed, so the caller can sequence dependent state writes after it.
#[async_trait]
pub trait Navigator: Send + Sync {
    async fn navigate(&self, route: Route);
}

/// Navigator that commits immediately and publishes the current route.
#[derive(Debug)]
pub struct MemoryNavigator {
    route: watch::Sender<Route>,
}

impl MemoryNavigator {
    pub fn new() -> Self {
        let (route, _) = watch::channel(Route::Home);
        Self { route }
    }

    pub fn current(&self) -> Route {
        self.route.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Route> {
        self.route.subscribe()
    }
}

impl Default for MemoryNavigator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Navigator for MemoryNavigator {
    async fn navigate(&self, route: Route) {
        tracing::debug!(path = %route.path(), "Route committed");
        self.route.send_replace(route);
    }
}
