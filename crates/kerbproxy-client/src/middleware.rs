//! `reqwest-middleware` integration.

use std::sync::Arc;

use async_trait::async_trait;
use http::Extensions;
use log::{debug, warn};
use reqwest::{Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next, Result};

use crate::policy::ProxyAuthenticationPolicy;

/// Upper bound on authentication follow-ups for one logical request.
pub const MAX_FOLLOW_UPS: usize = 20;

/// Retries requests rejected with `407` using tokens from a
/// [`ProxyAuthenticationPolicy`].
///
/// Requests whose body cannot be cloned are sent once and any `407` is
/// returned as is.
#[derive(Debug, Clone)]
pub struct ProxyAuthMiddleware {
    policy: Arc<ProxyAuthenticationPolicy>,
}

impl ProxyAuthMiddleware {
    /// Creates the middleware around a shared policy.
    #[must_use]
    pub const fn new(policy: Arc<ProxyAuthenticationPolicy>) -> Self {
        Self { policy }
    }

    /// The policy consulted on each challenge.
    #[must_use]
    pub const fn policy(&self) -> &Arc<ProxyAuthenticationPolicy> {
        &self.policy
    }
}

#[async_trait]
impl Middleware for ProxyAuthMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let mut request = req;
        let mut follow_ups = 0;

        loop {
            let Some(prior) = request.try_clone() else {
                warn!(
                    "request to {} has a streaming body, proxy authentication disabled",
                    request.url()
                );
                return next.run(request, extensions).await;
            };

            let response = next.clone().run(request, extensions).await?;
            if response.status() != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
                return Ok(response);
            }
            if follow_ups >= MAX_FOLLOW_UPS {
                warn!(
                    "too many proxy authentication follow-ups for {}",
                    response.url()
                );
                return Ok(response);
            }

            debug!("proxy challenged request to {}", prior.url());
            match self.policy.on_authentication_challenge(prior).await {
                Ok(Some(authenticated)) => {
                    follow_ups += 1;
                    request = authenticated;
                }
                Ok(None) => return Ok(response),
                Err(err) => return Err(reqwest_middleware::Error::middleware(err)),
            }
        }
    }
}
