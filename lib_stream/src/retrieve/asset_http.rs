//! # Widget Asset Retrieval
//!
//! An asynchronous HTTP client for widget assets, wrapping `reqwest` with
//! exponential-backoff retries, plus the [`WidgetLoader`] that uses it.

use std::sync::Arc;

use anyhow::Context;
use futures_util::FutureExt;
use reqwest::{header::AUTHORIZATION, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

use crate::core::registry::{ComponentManifest, LoadFuture, LoaderFactory, WidgetComponent, WidgetLoader};

/// HTTP client rooted at the widget asset base URL.
///
/// Relative component paths from pack manifests are joined onto the base, and
/// transient failures are retried with exponential backoff.
pub struct AssetClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl AssetClient {
    /// Creates a client.
    ///
    /// # Arguments
    /// * `base_url` - Absolute base URL, e.g. `"https://cdn.example.com/packs/"`.
    /// * `auth_token` - Optional bearer token sent with every request.
    /// * `max_retries` - Retries for transient failures (5xx, timeouts).
    ///
    /// # Errors
    /// Returns an error if `base_url` is not an absolute URL.
    pub fn new(base_url: &str, auth_token: Option<String>, max_retries: u32) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("invalid asset base url '{base_url}'"))?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let inner = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner,
            base_url,
            auth_token,
        })
    }

    /// Absolute URL of an asset path.
    pub fn asset_url(&self, path: &str) -> anyhow::Result<Url> {
        let relative = path.trim_start_matches("./");
        self.base_url
            .join(relative)
            .with_context(|| format!("cannot join '{path}' onto {}", self.base_url))
    }

    /// Fetches `path` as text.
    ///
    /// # Errors
    /// Network failures after retries, and any non-2xx status.
    pub async fn fetch_text(&self, path: &str) -> anyhow::Result<String> {
        let url = self.asset_url(path)?;
        let mut req = self.inner.get(url.clone());
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("GET {} returned {}: {}", url, status.as_u16(), body.trim());
        }
        log::debug!("Fetched widget asset {}", url);
        Ok(response.text().await?)
    }
}

/// Loads one component by fetching its asset.
pub struct AssetLoader {
    client: Arc<AssetClient>,
    component: WidgetComponent,
}

impl AssetLoader {
    /// Loader for `component` through `client`.
    pub fn new(client: Arc<AssetClient>, component: WidgetComponent) -> Self {
        Self { client, component }
    }
}

impl WidgetLoader for AssetLoader {
    fn load(&self) -> LoadFuture {
        let client = Arc::clone(&self.client);
        let mut component = self.component.clone();
        async move {
            // Components without an asset are descriptor-only.
            if let Some(path) = component.path.clone() {
                let source = client
                    .fetch_text(&path)
                    .await
                    .with_context(|| format!("asset for {}", component.reference()))?;
                component.source = Some(source);
            }
            Ok(component)
        }
        .boxed()
    }
}

/// Manifest factory producing [`AssetLoader`]s.
pub fn asset_loader_factory(client: Arc<AssetClient>) -> LoaderFactory {
    Arc::new(move |pack: &str, name: &str, manifest: &ComponentManifest| {
        let component = WidgetComponent::from_manifest(pack, name, manifest);
        Arc::new(AssetLoader::new(Arc::clone(&client), component)) as Arc<dyn WidgetLoader>
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned HTTP response per connection.
    async fn serve(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/packs/")
    }

    #[test]
    fn test_relative_paths_join_onto_base() {
        let client = AssetClient::new("https://cdn.example.com/packs/", None, 0).unwrap();
        assert_eq!(
            client.asset_url("./widgets/Welcome.vue").unwrap().as_str(),
            "https://cdn.example.com/packs/widgets/Welcome.vue"
        );
        assert!(AssetClient::new("relative/only", None, 0).is_err());
    }

    #[tokio::test]
    async fn test_loader_fetches_source() {
        let base = serve("200 OK", "<template>hi</template>").await;
        let client = Arc::new(AssetClient::new(&base, None, 0).unwrap());
        let mut component = WidgetComponent::new("dash", "Welcome");
        component.path = Some("./Welcome.vue".into());

        let loaded = AssetLoader::new(client, component).load().await.unwrap();
        assert_eq!(loaded.source.as_deref(), Some("<template>hi</template>"));
    }

    #[tokio::test]
    async fn test_not_found_is_an_error() {
        let base = serve("404 Not Found", "missing").await;
        let client = Arc::new(AssetClient::new(&base, None, 0).unwrap());
        let mut component = WidgetComponent::new("dash", "Gone");
        component.path = Some("Gone.vue".into());

        let err = AssetLoader::new(client, component).load().await.unwrap_err();
        assert!(format!("{err:#}").contains("404"));
    }

    #[tokio::test]
    async fn test_component_without_path_needs_no_network() {
        let client = Arc::new(AssetClient::new("http://127.0.0.1:9/", None, 0).unwrap());
        let loaded = AssetLoader::new(client, WidgetComponent::new("a", "B")).load().await.unwrap();
        assert!(loaded.source.is_none());
    }
}
