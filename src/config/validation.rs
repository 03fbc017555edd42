//! Config document validation
//!
//! Invalid documents are fatal at startup. At reload time the supervisor
//! validates before touching any worker, so a bad edit aborts the reload and
//! the previous config stays active.

use std::path::PathBuf;

use thiserror::Error;

use super::{Config, RouteConfig, TransformerConfig, TransformerRef};

/// Errors from loading or validating the config document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Validate a parsed config document.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.routes.is_empty() {
        return Err(ConfigError::Invalid(
            "routes must be a non-empty array".to_string(),
        ));
    }

    if let Some(limit) = &config.body_parser_limit {
        if super::parse_size(limit).is_none() {
            return Err(ConfigError::Invalid(format!(
                "bodyParserLimit '{}' is not a valid size",
                limit
            )));
        }
    }

    for route in &config.routes {
        validate_route(route)?;
    }

    Ok(())
}

fn validate_route(route: &RouteConfig) -> Result<(), ConfigError> {
    if route.path.is_empty() {
        return Err(ConfigError::Invalid(
            "route path must be non-empty".to_string(),
        ));
    }

    if route.upstreams.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "route '{}' has no upstreams",
            route.path
        )));
    }

    if route.failover.enabled && route.upstreams.len() < 2 {
        tracing::warn!(
            route = %route.path,
            "failover enabled with fewer than 2 upstreams; nothing to fail over to"
        );
    }

    let mut total_weight = 0.0;
    for upstream in &route.upstreams {
        let url = reqwest::Url::parse(&upstream.target).map_err(|e| {
            ConfigError::Invalid(format!(
                "route '{}': invalid upstream target '{}': {}",
                route.path, upstream.target, e
            ))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Invalid(format!(
                "route '{}': upstream target '{}' must use http or https",
                route.path, upstream.target
            )));
        }

        if !(upstream.weight > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "route '{}': upstream '{}' weight must be positive",
                route.path, upstream.target
            )));
        }
        if upstream.priority == 0 {
            return Err(ConfigError::Invalid(format!(
                "route '{}': upstream '{}' priority must be positive",
                route.path, upstream.target
            )));
        }
        total_weight += upstream.weight;

        if let Some(transformer) = &upstream.transformer {
            validate_transformer_ref(&route.path, transformer)?;
        }
    }

    if !(total_weight > 0.0) {
        return Err(ConfigError::Invalid(format!(
            "route '{}': total upstream weight must be > 0",
            route.path
        )));
    }

    if let Some(rewrite) = &route.path_rewrite {
        for (pattern, _) in rewrite.iter() {
            compile_check(&route.path, "pathRewrite", pattern)?;
        }
    }

    if let Some(transformer) = &route.transformer {
        validate_transformer_ref(&route.path, transformer)?;
    }

    Ok(())
}

fn validate_transformer_ref(route: &str, reference: &TransformerRef) -> Result<(), ConfigError> {
    match reference {
        TransformerRef::Named(name) => {
            if !crate::transformers::is_builtin(name) {
                return Err(ConfigError::Invalid(format!(
                    "route '{}': unknown transformer '{}'",
                    route, name
                )));
            }
            Ok(())
        }
        TransformerRef::Inline(config) => validate_transformer_config(route, config),
        TransformerRef::List(configs) => {
            for config in configs {
                validate_transformer_config(route, config)?;
            }
            Ok(())
        }
    }
}

fn validate_transformer_config(route: &str, config: &TransformerConfig) -> Result<(), ConfigError> {
    compile_check(route, "transformer path match", &config.path.pattern)?;
    for rule in &config.response {
        compile_check(route, "response status match", &rule.matcher.status)?;
    }
    Ok(())
}

fn compile_check(route: &str, what: &str, pattern: &str) -> Result<(), ConfigError> {
    regex::Regex::new(pattern).map_err(|e| {
        ConfigError::Invalid(format!(
            "route '{}': {} regex '{}' does not compile: {}",
            route, what, pattern, e
        ))
    })?;
    Ok(())
}
