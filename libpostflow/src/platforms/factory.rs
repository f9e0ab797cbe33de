//! Registry of platform adapters
//!
//! The factory maps each [`Platform`] to a constructor and caches the
//! adapter it builds, so every caller shares one instance per platform.
//! Tests register mock adapters in place of the real ones.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use reqwest::Client;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{PlatformError, Result};
use crate::platforms::bluesky::BlueskyAdapter;
use crate::platforms::http::build_client;
use crate::platforms::instagram::InstagramAdapter;
use crate::platforms::linkedin::LinkedInAdapter;
use crate::platforms::poll::PollPolicy;
use crate::platforms::threads::ThreadsAdapter;
use crate::platforms::tiktok::TikTokAdapter;
use crate::platforms::twitter::TwitterAdapter;
use crate::platforms::youtube::YouTubeAdapter;
use crate::platforms::PlatformAdapter;
use crate::types::Platform;

/// Builds an adapter on first use
pub type Constructor = Arc<dyn Fn() -> Result<Arc<dyn PlatformAdapter>> + Send + Sync>;

#[derive(Default)]
struct Registry {
    constructors: HashMap<Platform, Constructor>,
    instances: HashMap<Platform, Arc<dyn PlatformAdapter>>,
}

#[derive(Default)]
pub struct PlatformFactory {
    registry: RwLock<Registry>,
}

impl PlatformFactory {
    /// Empty factory, every lookup fails until something is registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the real adapters of every platform present in `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let factory = Self::new();
        let client = build_client(config.http.timeout())?;
        let poll = PollPolicy::from(&config.http);
        let platforms = &config.platforms;

        for platform in platforms.configured() {
            let client = client.clone();
            let constructor: Constructor = match platform {
                Platform::Bluesky => {
                    let bluesky = platforms.bluesky.clone().unwrap_or_default();
                    Arc::new(move || -> Result<Arc<dyn PlatformAdapter>> {
                        Ok(Arc::new(BlueskyAdapter::new(bluesky.clone(), client.clone())))
                    })
                }
                _ => {
                    let Some(app) = platforms.oauth(platform).cloned() else {
                        continue;
                    };
                    oauth_constructor(platform, app, client, poll)
                }
            };
            factory.register(platform, constructor);
        }

        info!(
            platforms = ?factory.registered(),
            "Platform adapters registered"
        );
        Ok(factory)
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a constructor, replacing any cached adapter for the platform
    pub fn register(&self, platform: Platform, constructor: Constructor) {
        let mut registry = self.write();
        registry.instances.remove(&platform);
        registry.constructors.insert(platform, constructor);
    }

    /// Register a ready-made adapter under its own platform
    pub fn register_instance(&self, adapter: Arc<dyn PlatformAdapter>) {
        let platform = adapter.platform();
        let shared = adapter.clone();
        let constructor: Constructor =
            Arc::new(move || -> Result<Arc<dyn PlatformAdapter>> { Ok(shared.clone()) });
        let mut registry = self.write();
        registry.constructors.insert(platform, constructor);
        registry.instances.insert(platform, adapter);
    }

    /// Shared adapter for `platform`, built on first request
    pub fn get_platform(&self, platform: Platform) -> Result<Arc<dyn PlatformAdapter>> {
        let constructor = {
            let registry = self.read();
            if let Some(adapter) = registry.instances.get(&platform) {
                return Ok(adapter.clone());
            }
            registry.constructors.get(&platform).cloned()
        };

        let constructor = constructor.ok_or_else(|| {
            PlatformError::platform(format!("{} is not implemented", platform))
                .with_context("platform", platform.as_str())
                .with_context("reason", "not_implemented")
        })?;

        let adapter = constructor()?;
        let mut registry = self.write();
        // Another caller may have built it while the lock was released
        let adapter = registry
            .instances
            .entry(platform)
            .or_insert(adapter)
            .clone();
        debug!(platform = %platform, "Platform adapter ready");
        Ok(adapter)
    }

    /// Drop cached adapters so the next lookup rebuilds them
    pub fn clear(&self) {
        self.write().instances.clear();
    }

    pub fn registered(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.read().constructors.keys().copied().collect();
        platforms.sort();
        platforms
    }
}

fn oauth_constructor(
    platform: Platform,
    app: crate::config::OAuthAppConfig,
    client: Client,
    poll: PollPolicy,
) -> Constructor {
    Arc::new(move || -> Result<Arc<dyn PlatformAdapter>> {
        let app = app.clone();
        let client = client.clone();
        let adapter: Arc<dyn PlatformAdapter> = match platform {
            Platform::Twitter => Arc::new(TwitterAdapter::new(app, client).with_poll_policy(poll)),
            Platform::LinkedIn => {
                Arc::new(LinkedInAdapter::new(app, client).with_poll_policy(poll))
            }
            Platform::Instagram => {
                Arc::new(InstagramAdapter::new(app, client).with_poll_policy(poll))
            }
            Platform::TikTok => Arc::new(TikTokAdapter::new(app, client).with_poll_policy(poll)),
            Platform::YouTube => Arc::new(YouTubeAdapter::new(app, client)),
            Platform::Threads => Arc::new(ThreadsAdapter::new(app, client).with_poll_policy(poll)),
            Platform::Bluesky => {
                return Err(PlatformError::platform("Bluesky does not use OAuth app settings")
                    .with_context("platform", platform.as_str())
                    .into())
            }
        };
        Ok(adapter)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::platforms::mock::MockAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unregistered_platform_is_not_implemented() {
        let factory = PlatformFactory::new();
        let err = factory.get_platform(Platform::TikTok).err().unwrap();
        assert_eq!(err.code(), Some(ErrorCode::PlatformError));
        let platform_error = err.as_platform().unwrap();
        assert_eq!(platform_error.context["reason"], "not_implemented");
        assert!(err.to_string().contains("tiktok is not implemented"));
    }

    #[test]
    fn test_instances_are_cached() {
        let factory = PlatformFactory::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        factory.register(
            Platform::Twitter,
            Arc::new(move || -> Result<Arc<dyn PlatformAdapter>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(MockAdapter::success(Platform::Twitter)))
            }),
        );

        let first = factory.get_platform(Platform::Twitter).unwrap();
        let second = factory.get_platform(Platform::Twitter).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        factory.clear();
        factory.get_platform(Platform::Twitter).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_register_instance_replaces_adapter() {
        let factory = PlatformFactory::new();
        let mock = Arc::new(MockAdapter::success(Platform::Bluesky));
        factory.register_instance(mock.clone());

        let adapter = factory.get_platform(Platform::Bluesky).unwrap();
        assert_eq!(adapter.platform(), Platform::Bluesky);
        assert_eq!(factory.registered(), vec![Platform::Bluesky]);

        factory.clear();
        let rebuilt = factory.get_platform(Platform::Bluesky).unwrap();
        assert!(Arc::ptr_eq(&adapter, &rebuilt));
    }

    #[test]
    fn test_from_config_registers_configured_platforms() {
        let config = Config::parse(
            r#"
[database]
path = "/tmp/postflow-factory.db"

[platforms.twitter]
client_id = "tw"
redirect_uri = "https://app.example/cb"

[platforms.youtube]
client_id = "yt"
client_secret = "secret"
redirect_uri = "https://app.example/cb"

[platforms.bluesky]
"#,
        )
        .unwrap();

        let factory = PlatformFactory::from_config(&config).unwrap();
        assert_eq!(
            factory.registered(),
            vec![Platform::Twitter, Platform::YouTube, Platform::Bluesky]
        );
        assert_eq!(
            factory.get_platform(Platform::YouTube).unwrap().platform(),
            Platform::YouTube
        );
        assert!(factory.get_platform(Platform::LinkedIn).is_err());
    }
}
