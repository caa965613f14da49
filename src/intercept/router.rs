use std::{collections::HashSet, fmt};

use http::{Method, Request};
use regex::Regex;

use crate::{
    config,
    core::{CacheError, CacheResult},
};

/// Request class selecting the strategy that resolves it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Route {
    /// Application shell and static assets, served cache-first
    Static,
    /// API calls, served network-first
    DynamicApi,
    /// Not intercepted
    Unhandled,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Static => "static",
            Route::DynamicApi => "dynamic_api",
            Route::Unhandled => "unhandled",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure classifier for intercepted requests.
///
/// Static matching takes precedence over the API prefix, so a GET for
/// `/api/app.js` is `Static`.
pub struct RequestRouter {
    static_suffix: Option<Regex>,
    shell_paths: HashSet<String>,
    api_prefix: String,
}

impl RequestRouter {
    pub fn new<S: AsRef<str>>(
        static_extensions: &[S],
        shell_paths: &[S],
        api_prefix: &str,
    ) -> CacheResult<Self> {
        let static_suffix = if static_extensions.is_empty() {
            None
        } else {
            let alternation = static_extensions
                .iter()
                .map(|ext| regex::escape(ext.as_ref()))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = format!(r"(?i)\.(?:{alternation})$");
            Some(Regex::new(&pattern).map_err(|e| {
                CacheError::Configuration(format!("invalid static extensions: {e}"))
            })?)
        };

        Ok(Self {
            static_suffix,
            shell_paths: shell_paths.iter().map(|p| p.as_ref().to_string()).collect(),
            api_prefix: api_prefix.to_string(),
        })
    }

    pub fn from_config(cfg: &config::Cache) -> CacheResult<Self> {
        Self::new(&cfg.static_extensions, &cfg.shell_paths, &cfg.api_prefix)
    }

    pub fn classify(&self, method: &Method, path: &str) -> Route {
        if method == Method::GET && self.is_static_path(path) {
            Route::Static
        } else if path.starts_with(&self.api_prefix) {
            Route::DynamicApi
        } else {
            Route::Unhandled
        }
    }

    pub fn classify_request<B>(&self, request: &Request<B>) -> Route {
        self.classify(request.method(), request.uri().path())
    }

    fn is_static_path(&self, path: &str) -> bool {
        self.shell_paths.contains(path)
            || self
                .static_suffix
                .as_ref()
                .is_some_and(|re| re.is_match(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_router() -> RequestRouter {
        RequestRouter::from_config(&config::Cache::default()).unwrap()
    }

    #[test]
    fn test_static_routes() {
        let router = default_router();
        for path in [
            "/",
            "/index.html",
            "/manifest.json",
            "/static/js/bundle.js",
            "/static/css/main.css",
            "/img/lung.PNG",
            "/icons/logo.svg",
            "/photo.jpeg",
        ] {
            assert_eq!(router.classify(&Method::GET, path), Route::Static, "{path}");
        }
    }

    #[test]
    fn test_dynamic_routes() {
        let router = default_router();
        assert_eq!(
            router.classify(&Method::POST, "/api/simulate"),
            Route::DynamicApi
        );
        assert_eq!(
            router.classify(&Method::GET, "/api/presets"),
            Route::DynamicApi
        );
        assert_eq!(router.classify(&Method::DELETE, "/api/"), Route::DynamicApi);
    }

    #[test]
    fn test_unhandled_routes() {
        let router = default_router();
        // Suffix match only: ".json" is not a script.
        assert_eq!(router.classify(&Method::GET, "/data.json"), Route::Unhandled);
        assert_eq!(router.classify(&Method::GET, "/about"), Route::Unhandled);
        assert_eq!(router.classify(&Method::GET, "/api"), Route::Unhandled);
        assert_eq!(router.classify(&Method::GET, "/bundle.js.map"), Route::Unhandled);
        // Static assets are read-only.
        assert_eq!(
            router.classify(&Method::POST, "/static/js/bundle.js"),
            Route::Unhandled
        );
        assert_eq!(router.classify(&Method::HEAD, "/"), Route::Unhandled);
    }

    #[test]
    fn test_static_takes_precedence() {
        let router = default_router();
        assert_eq!(router.classify(&Method::GET, "/api/widget.js"), Route::Static);
        assert_eq!(
            router.classify(&Method::POST, "/api/widget.js"),
            Route::DynamicApi
        );
    }

    #[test]
    fn test_classification_is_total_and_disjoint() {
        let router = default_router();
        let methods = [
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
            Method::PATCH,
        ];
        let paths = [
            "/",
            "/index.html",
            "/manifest.json",
            "/a.js",
            "/a.css",
            "/a.png",
            "/api/",
            "/api/x.js",
            "/api/simulate",
            "/other",
            "/apix",
            "",
        ];

        for method in methods.iter() {
            for path in paths {
                let route = router.classify(method, path);
                let candidates = [Route::Static, Route::DynamicApi, Route::Unhandled];
                assert_eq!(
                    candidates.iter().filter(|r| **r == route).count(),
                    1,
                    "{method} {path}"
                );
                // Classification is pure: same input, same answer.
                assert_eq!(route, router.classify(method, path));
            }
        }
    }

    #[test]
    fn test_custom_patterns() {
        let router = RequestRouter::new(&["woff2"], &["/app"], "/rest/").unwrap();
        assert_eq!(router.classify(&Method::GET, "/font.woff2"), Route::Static);
        assert_eq!(router.classify(&Method::GET, "/app"), Route::Static);
        assert_eq!(router.classify(&Method::GET, "/main.js"), Route::Unhandled);
        assert_eq!(router.classify(&Method::GET, "/rest/x"), Route::DynamicApi);
    }

    #[test]
    fn test_no_static_extensions() {
        let router = RequestRouter::new::<&str>(&[], &[], "/api/").unwrap();
        assert_eq!(router.classify(&Method::GET, "/main.js"), Route::Unhandled);
    }
}
